use crate::{
    errors::{AppError, AppResult},
    providers::{
        OnChunk,
        anthropic::{AnthropicStreamEvent, BlockDelta, StreamContentBlock},
        stream::{Flow, SseEvent, StreamAccumulator, StreamDecoder},
    },
};

/// Decoder for the Messages API content-block stream
///
/// A tool block's argument buffer is only complete at its
/// `content_block_stop`; blocks never stopped are dropped at the end.
#[derive(Debug, Default)]
pub struct AnthropicStreamDecoder;

impl StreamDecoder for AnthropicStreamDecoder {
    fn decode(
        &mut self,
        event: &SseEvent,
        acc: &mut StreamAccumulator,
        on_chunk: &mut OnChunk<'_>,
    ) -> AppResult<Flow> {
        let parsed: AnthropicStreamEvent = match serde_json::from_str(&event.data) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::debug!(error = %e, event = ?event.event, "skipping malformed anthropic stream line");
                return Ok(Flow::Continue);
            }
        };

        match parsed {
            AnthropicStreamEvent::MessageStart { message } => {
                acc.set_model(message.model);
                acc.set_input_tokens(message.usage.input_tokens);
                if message.usage.output_tokens > 0 {
                    acc.set_output_tokens(message.usage.output_tokens);
                }
            }
            AnthropicStreamEvent::ContentBlockStart {
                index,
                content_block,
            } => match content_block {
                StreamContentBlock::ToolUse { id, name } => acc.start_tool_call(index, &id, &name),
                StreamContentBlock::Text { text } => acc.push_text(&text, on_chunk),
                StreamContentBlock::Unknown => {}
            },
            AnthropicStreamEvent::ContentBlockDelta { index, delta } => match delta {
                BlockDelta::TextDelta { text } => acc.push_text(&text, on_chunk),
                BlockDelta::InputJsonDelta { partial_json } => {
                    acc.push_tool_arguments(index, &partial_json)
                }
                BlockDelta::Unknown => {}
            },
            AnthropicStreamEvent::ContentBlockStop { index } => {
                acc.finish_tool_call(index);
            }
            AnthropicStreamEvent::MessageDelta { delta, usage } => {
                if let Some(reason) = delta.stop_reason {
                    acc.set_finish_reason(reason);
                }
                if let Some(usage) = usage {
                    acc.set_output_tokens(usage.output_tokens);
                }
            }
            AnthropicStreamEvent::MessageStop => return Ok(Flow::Done),
            AnthropicStreamEvent::Ping => {}
            AnthropicStreamEvent::Error { error } => {
                return Err(AppError::provider_error(
                    502,
                    format!("{}: {}", error.error_type, error.message),
                ));
            }
        }

        Ok(Flow::Continue)
    }
}
