use crate::{
    errors::AppResult,
    providers::{
        OnChunk,
        openai::OpenAIStreamChunk,
        stream::{Flow, SseEvent, StreamAccumulator, StreamDecoder},
    },
};

/// Decoder for the chat-completions delta stream
///
/// Text arrives as `choices[0].delta.content`; tool calls arrive as
/// `choices[0].delta.tool_calls[]` fragments keyed by `index`, with the id
/// and function name on the first fragment. The stream has no per-call stop
/// event, so every tool call is finalized once the stream ends.
#[derive(Debug, Default)]
pub struct OpenAIStreamDecoder;

impl StreamDecoder for OpenAIStreamDecoder {
    fn decode(
        &mut self,
        event: &SseEvent,
        acc: &mut StreamAccumulator,
        on_chunk: &mut OnChunk<'_>,
    ) -> AppResult<Flow> {
        let data = event.data.trim();
        if data == "[DONE]" {
            return Ok(Flow::Done);
        }

        let chunk: OpenAIStreamChunk = match serde_json::from_str(data) {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::debug!(error = %e, "skipping malformed openai stream line");
                return Ok(Flow::Continue);
            }
        };

        if let Some(model) = chunk.model {
            acc.set_model(model);
        }

        if let Some(usage) = chunk.usage {
            acc.set_input_tokens(usage.prompt_tokens);
            acc.set_output_tokens(usage.completion_tokens);
        }

        if let Some(choice) = chunk.choices.into_iter().next() {
            if let Some(text) = choice.delta.content.as_deref() {
                acc.push_text(text, on_chunk);
            }

            for call in choice.delta.tool_calls {
                let (name, arguments) = match call.function {
                    Some(f) => (f.name.unwrap_or_default(), f.arguments.unwrap_or_default()),
                    None => (String::new(), String::new()),
                };
                acc.start_tool_call(call.index, call.id.as_deref().unwrap_or_default(), &name);
                if !arguments.is_empty() {
                    acc.push_tool_arguments(call.index, &arguments);
                }
            }

            if let Some(reason) = choice.finish_reason {
                acc.set_finish_reason(reason);
            }
        }

        Ok(Flow::Continue)
    }

    fn finish(&mut self, acc: &mut StreamAccumulator) {
        acc.finish_all_tool_calls();
    }
}
