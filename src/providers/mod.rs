pub mod anthropic;
pub mod local;
pub mod openai;
pub mod registry;
pub mod stream;
pub mod stub;

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{
    config::{PerformanceConfig, ProviderDetail},
    errors::{AppError, AppResult},
    job::{Job, JobKind},
};

// Re-export registry for easier access
pub use registry::ProviderRegistry;

/// Model information structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub owned_by: String,
}

impl ModelInfo {
    pub fn new(id: impl Into<String>, owned_by: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            object: "model".to_string(),
            created: 0,
            owned_by: owned_by.into(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// Message structure for chat conversations
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// A function the model may call
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments object
    pub parameters: serde_json::Value,
}

/// Uniform chat-completion request every adapter translates
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    /// Falls back to the provider's default model when absent
    pub model: Option<String>,
    pub messages: Vec<Message>,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
}

impl CompletionRequest {
    pub const DEFAULT_MAX_TOKENS: u32 = 4096;

    /// Single user-turn request.
    pub fn from_prompt(prompt: impl Into<String>) -> Self {
        Self {
            model: None,
            messages: vec![Message::user(prompt)],
            max_tokens: Self::DEFAULT_MAX_TOKENS,
            temperature: None,
            tools: Vec::new(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    /// System prompt, if the first message carries one.
    pub fn system_prompt(&self) -> Option<&str> {
        self.messages
            .iter()
            .find(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
    }

    /// Prompt length in bytes, used for token estimation.
    pub fn prompt_len(&self) -> usize {
        self.messages.iter().map(|m| m.content.len()).sum()
    }

    /// 验证请求参数的有效性
    ///
    /// ## 验证项目
    /// - **消息验证**: 至少一条非system消息，内容不能为空，不包含空字节
    /// - **Token验证**: max_tokens必须大于0
    /// - **参数验证**: temperature在0.0-2.0之间
    pub fn validate(&self) -> Result<(), String> {
        if !self.messages.iter().any(|m| m.role != Role::System) {
            return Err("Messages cannot be empty".to_string());
        }

        for message in &self.messages {
            if message.content.is_empty() {
                return Err("Message content cannot be empty".to_string());
            }
            if message.content.contains('\0') {
                return Err("Message content cannot contain null bytes".to_string());
            }
        }

        if self.max_tokens == 0 {
            return Err("max_tokens must be greater than 0".to_string());
        }

        if let Some(temp) = self.temperature {
            if !temp.is_finite() || !(0.0..=2.0).contains(&temp) {
                return Err("temperature must be between 0.0 and 2.0".to_string());
            }
        }

        Ok(())
    }
}

/// Uniform image-generation request
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ImageRequest {
    pub prompt: String,
    pub model: Option<String>,
    pub size: Option<String>,
}

impl ImageRequest {
    pub fn from_prompt(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            model: None,
            size: None,
        }
    }
}

/// A completed function-call request emitted by the model
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Raw JSON argument text exactly as the backend streamed it
    pub arguments: String,
}

impl ToolCall {
    pub fn arguments_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::from_str(&self.arguments)
    }
}

/// Final aggregate of a (streamed) completion
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct CompletionResponse {
    pub content: String,
    pub model: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub cost: f64,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: Option<String>,
}

/// Outcome of one blocking `execute`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProviderResult {
    pub content: String,
    pub model: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub cost: f64,
}

impl From<CompletionResponse> for ProviderResult {
    fn from(res: CompletionResponse) -> Self {
        Self {
            content: res.content,
            model: res.model,
            tokens_in: res.tokens_in,
            tokens_out: res.tokens_out,
            cost: res.cost,
        }
    }
}

/// Core AI Provider trait that all providers must implement
///
/// Streaming and model listing are optional capabilities, discovered through
/// [`AIProvider::as_streaming`] and [`AIProvider::as_model_lister`] rather
/// than required of every backend.
#[async_trait]
pub trait AIProvider: Send + Sync {
    /// Registry key, unique per registry
    fn name(&self) -> &str;

    /// Backend family, e.g. `openai` or `stub`
    fn provider_type(&self) -> &str;

    /// Job kinds this provider can execute.
    fn supports(&self, kind: JobKind) -> bool {
        kind == JobKind::Text
    }

    /// Cheap, side-effect-free liveness probe.
    async fn is_available(&self) -> bool;

    /// Run a job to completion. Kinds the provider does not support are
    /// rejected with [`AppError::UnsupportedJobKind`].
    async fn execute(&self, job: &Job) -> AppResult<ProviderResult>;

    fn as_streaming(&self) -> Option<&dyn StreamingProvider> {
        None
    }

    fn as_model_lister(&self) -> Option<&dyn ModelLister> {
        None
    }
}

/// Per-chunk text callback handed to streaming calls
pub type OnChunk<'a> = dyn FnMut(&str) + Send + 'a;

/// Incremental completion capability
#[async_trait]
pub trait StreamingProvider: Send + Sync {
    /// Streams a completion, calling `on_chunk` with each text fragment as
    /// it arrives, and returns the aggregated response. Tool-call arguments
    /// are never passed to `on_chunk`. `cancel` aborts the read loop with
    /// [`AppError::Cancelled`].
    async fn complete_stream(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
        on_chunk: &mut OnChunk<'_>,
    ) -> AppResult<CompletionResponse>;
}

/// Model discovery capability
#[async_trait]
pub trait ModelLister: Send + Sync {
    async fn list_models(&self) -> AppResult<Vec<ModelInfo>>;
}

/// Character heuristic used when a backend does not report token usage:
/// one token per four bytes of text.
pub fn estimate_tokens(text_len: usize) -> u32 {
    u32::try_from(text_len / 4).unwrap_or(u32::MAX)
}

/// Treat a missing or zero count as unreported and estimate from length.
pub(crate) fn reported_or_estimated(reported: Option<u32>, text_len: usize) -> u32 {
    match reported {
        Some(n) if n > 0 => n,
        _ => estimate_tokens(text_len),
    }
}

/// Outbound HTTP client owned by one provider adapter.
pub fn build_http_client(detail: &ProviderDetail, perf: &PerformanceConfig) -> AppResult<Client> {
    Client::builder()
        .timeout(Duration::from_secs(detail.timeout_seconds))
        .pool_max_idle_per_host(perf.connection_pool_size)
        .pool_idle_timeout(Duration::from_secs(perf.keep_alive_timeout_seconds))
        .build()
        .map_err(|e| AppError::ConfigError(format!("Failed to create HTTP client: {}", e)))
}

/// Map a non-2xx response into a provider error carrying status and body.
pub(crate) async fn error_from_response(label: &str, response: reqwest::Response) -> AppError {
    let status = response.status().as_u16();
    let error_body = response.text().await.unwrap_or_default();
    AppError::ProviderError {
        status,
        message: format!("{} API error ({}): {}", label, status, error_body),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_tokens_floors() {
        assert_eq!(estimate_tokens(0), 0);
        assert_eq!(estimate_tokens(3), 0);
        assert_eq!(estimate_tokens(4), 1);
        assert_eq!(estimate_tokens(11), 2);
    }

    #[test]
    fn test_zero_usage_counts_as_unreported() {
        assert_eq!(reported_or_estimated(Some(7), 400), 7);
        assert_eq!(reported_or_estimated(Some(0), 40), 10);
        assert_eq!(reported_or_estimated(None, 8), 2);
    }

    #[test]
    fn test_request_validation() {
        assert!(CompletionRequest::from_prompt("hi").validate().is_ok());
        assert!(CompletionRequest::from_prompt("").validate().is_err());

        let mut only_system = CompletionRequest::from_prompt("x");
        only_system.messages = vec![Message::system("be nice")];
        assert!(only_system.validate().is_err());

        let mut hot = CompletionRequest::from_prompt("x");
        hot.temperature = Some(3.5);
        assert!(hot.validate().is_err());
    }

    #[test]
    fn test_prompt_len_sums_all_messages() {
        let mut request = CompletionRequest::from_prompt("Hello");
        request.messages.insert(0, Message::system("abc"));
        assert_eq!(request.prompt_len(), 8);
        assert_eq!(request.system_prompt(), Some("abc"));
    }
}
