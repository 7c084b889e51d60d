//! Server-sent-event normalization shared by the streaming adapters.
//!
//! [`SseReader`] turns a raw byte stream into `data:` payloads, reassembling
//! lines that straddle transport chunks. A family-specific [`StreamDecoder`]
//! interprets each payload against a [`StreamAccumulator`], which owns the
//! running text buffer, the index-keyed tool-call buffers, token counts and
//! the finish reason. [`normalize_stream`] drives the loop.

use std::collections::BTreeMap;
use std::fmt;
use std::pin::Pin;

use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::{
    errors::{AppError, AppResult},
    providers::{OnChunk, ToolCall, reported_or_estimated},
};

/// Server-Sent Event wrapper
#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

impl SseEvent {
    /// Create a new SSE event with data
    pub fn new(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
            id: None,
        }
    }

    /// Create a new SSE event with event type and data
    pub fn with_event(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: Some(event.into()),
            data: data.into(),
            id: None,
        }
    }

    /// Format as SSE wire text
    pub fn to_sse_string(&self) -> String {
        let mut result = String::new();

        if let Some(event) = &self.event {
            result.push_str(&format!("event: {}\n", event));
        }

        if let Some(id) = &self.id {
            result.push_str(&format!("id: {}\n", id));
        }

        // Handle multi-line data
        for line in self.data.lines() {
            result.push_str(&format!("data: {}\n", line));
        }

        result.push('\n');
        result
    }
}

/// Incremental line reader over an SSE byte stream
///
/// Yields one [`SseEvent`] per `data:` line. Blank lines reset the pending
/// `event:` name; comments, `id:` and `retry:` lines are ignored.
pub struct SseReader<S> {
    stream: Pin<Box<S>>,
    buffer: Vec<u8>,
    pending_event: Option<String>,
    exhausted: bool,
}

impl<S, B, E> SseReader<S>
where
    S: Stream<Item = Result<B, E>> + Send,
    B: AsRef<[u8]>,
    E: fmt::Display,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream: Box::pin(stream),
            buffer: Vec::new(),
            pending_event: None,
            exhausted: false,
        }
    }

    /// 读取下一个SSE数据事件
    ///
    /// ## 功能说明
    /// 从缓冲区中取出完整的行进行解析；缓冲区没有完整行时再从底层流读取。
    /// 每次读取前都检查取消信号
    ///
    /// ## 返回值
    /// - `Ok(Some(SseEvent))`: 下一个`data:`事件
    /// - `Ok(None)`: 流已结束
    /// - `Err(AppError::Cancelled)`: 读取被取消
    /// - `Err(AppError::ProviderError)`: 底层传输出错
    pub async fn next_event(&mut self, cancel: &CancellationToken) -> AppResult<Option<SseEvent>> {
        loop {
            if let Some(line) = self.take_line() {
                if let Some(event) = self.parse_line(&line) {
                    return Ok(Some(event));
                }
                continue;
            }

            if self.exhausted {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                // Final line without a trailing newline.
                self.buffer.push(b'\n');
                continue;
            }

            if cancel.is_cancelled() {
                return Err(AppError::Cancelled);
            }

            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AppError::Cancelled),
                next = self.stream.next() => next,
            };

            match next {
                Some(Ok(bytes)) => self.buffer.extend_from_slice(bytes.as_ref()),
                Some(Err(e)) => {
                    return Err(AppError::provider_error(
                        502,
                        format!("stream interrupted: {}", e),
                    ));
                }
                None => self.exhausted = true,
            }
        }
    }

    fn take_line(&mut self) -> Option<String> {
        let end = self.buffer.iter().position(|b| *b == b'\n')?;
        let raw: Vec<u8> = self.buffer.drain(..=end).collect();
        let line = String::from_utf8_lossy(&raw[..end]);
        Some(line.trim_end_matches('\r').to_string())
    }

    fn parse_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            self.pending_event = None;
            return None;
        }

        if let Some(name) = line.strip_prefix("event:") {
            self.pending_event = Some(name.trim().to_string());
            return None;
        }

        let data = line.strip_prefix("data:")?;
        Some(SseEvent {
            event: self.pending_event.clone(),
            data: data.strip_prefix(' ').unwrap_or(data).to_string(),
            id: None,
        })
    }
}

#[derive(Debug, Default)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
    complete: bool,
}

/// Per-call accumulation state, discarded once the stream ends
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    content: String,
    tool_calls: BTreeMap<usize, PartialToolCall>,
    tokens_in: Option<u32>,
    tokens_out: Option<u32>,
    finish_reason: Option<String>,
    model: Option<String>,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a text fragment and hand it to the caller straight away.
    pub fn push_text(&mut self, text: &str, on_chunk: &mut OnChunk<'_>) {
        if text.is_empty() {
            return;
        }
        self.content.push_str(text);
        on_chunk(text);
    }

    /// Announce (or re-announce) the tool call at `index`. Empty ids and
    /// names never overwrite ones already seen.
    pub fn start_tool_call(&mut self, index: usize, id: &str, name: &str) {
        let call = self.tool_calls.entry(index).or_default();
        if !id.is_empty() {
            call.id = id.to_string();
        }
        if !name.is_empty() {
            call.name = name.to_string();
        }
    }

    pub fn push_tool_arguments(&mut self, index: usize, fragment: &str) {
        self.tool_calls
            .entry(index)
            .or_default()
            .arguments
            .push_str(fragment);
    }

    /// Returns false when no tool call is open at `index` (e.g. a text block).
    pub fn finish_tool_call(&mut self, index: usize) -> bool {
        match self.tool_calls.get_mut(&index) {
            Some(call) => {
                call.complete = true;
                true
            }
            None => false,
        }
    }

    pub fn finish_all_tool_calls(&mut self) {
        for call in self.tool_calls.values_mut() {
            call.complete = true;
        }
    }

    pub fn set_input_tokens(&mut self, tokens: u32) {
        self.tokens_in = Some(tokens);
    }

    pub fn set_output_tokens(&mut self, tokens: u32) {
        self.tokens_out = Some(tokens);
    }

    pub fn set_finish_reason(&mut self, reason: impl Into<String>) {
        self.finish_reason = Some(reason.into());
    }

    pub fn set_model(&mut self, model: impl Into<String>) {
        let model = model.into();
        if !model.is_empty() {
            self.model = Some(model);
        }
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    /// 汇总流式结果
    ///
    /// ## 内部实现逻辑
    /// 1. 按索引升序输出已完成的工具调用，未完成的丢弃并记录警告
    /// 2. 空参数缓冲区按`{}`处理
    /// 3. 后端未报告token用量时，按`长度/4`估算输入与输出token
    pub fn finish(self, prompt_len: usize) -> StreamOutcome {
        let usage_estimated = !matches!(self.tokens_in, Some(n) if n > 0)
            || !matches!(self.tokens_out, Some(n) if n > 0);
        let tokens_in = reported_or_estimated(self.tokens_in, prompt_len);
        let tokens_out = reported_or_estimated(self.tokens_out, self.content.len());

        let mut tool_calls = Vec::with_capacity(self.tool_calls.len());
        for (index, call) in self.tool_calls {
            if !call.complete {
                tracing::warn!(index, name = %call.name, "dropping tool call that never completed");
                continue;
            }
            let arguments = if call.arguments.is_empty() {
                "{}".to_string()
            } else {
                call.arguments
            };
            tool_calls.push(ToolCall {
                id: call.id,
                name: call.name,
                arguments,
            });
        }

        StreamOutcome {
            content: self.content,
            tool_calls,
            tokens_in,
            tokens_out,
            usage_estimated,
            finish_reason: self.finish_reason,
            model: self.model,
        }
    }
}

/// Normalized result of one streamed call, before pricing
#[derive(Debug, Clone, PartialEq)]
pub struct StreamOutcome {
    pub content: String,
    /// Ascending by block index
    pub tool_calls: Vec<ToolCall>,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub usage_estimated: bool,
    pub finish_reason: Option<String>,
    pub model: Option<String>,
}

/// Whether the decoder wants more events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Done,
}

/// Interprets one provider family's event payloads
pub trait StreamDecoder: Send {
    /// Fold one `data:` payload into the accumulator. Unparsable payloads
    /// should be skipped; only backend-signalled errors return `Err`.
    fn decode(
        &mut self,
        event: &SseEvent,
        acc: &mut StreamAccumulator,
        on_chunk: &mut OnChunk<'_>,
    ) -> AppResult<Flow>;

    /// Hook run once the stream ends, however it ended.
    fn finish(&mut self, _acc: &mut StreamAccumulator) {}
}

/// 将SSE字节流归一化为统一的流式结果
///
/// ## 功能说明
/// 逐行读取SSE流，交给对应协议族的解码器处理，文本片段实时回调给调用方，
/// 工具调用参数只在完成后输出
///
/// ## 错误处理
/// - 单行JSON解析失败：跳过
/// - 传输层错误（包括已经输出部分内容之后）：直接返回错误
/// - 取消信号：返回`AppError::Cancelled`
pub async fn normalize_stream<S, B, E, D>(
    stream: S,
    decoder: &mut D,
    prompt_len: usize,
    cancel: &CancellationToken,
    on_chunk: &mut OnChunk<'_>,
) -> AppResult<StreamOutcome>
where
    S: Stream<Item = Result<B, E>> + Send,
    B: AsRef<[u8]>,
    E: fmt::Display,
    D: StreamDecoder + ?Sized,
{
    let mut reader = SseReader::new(stream);
    let mut acc = StreamAccumulator::new();

    while let Some(event) = reader.next_event(cancel).await? {
        if decoder.decode(&event, &mut acc, on_chunk)? == Flow::Done {
            break;
        }
    }

    decoder.finish(&mut acc);
    Ok(acc.finish(prompt_len))
}
