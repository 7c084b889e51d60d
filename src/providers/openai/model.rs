use serde::{Deserialize, Serialize};

// OpenAI-specific data structures for API communication
#[derive(Serialize, Debug)]
pub struct OpenAIRequest {
    pub model: String,
    pub messages: Vec<OpenAIMessage>,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<StreamOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<OpenAITool>,
}

#[derive(Serialize, Debug)]
pub struct StreamOptions {
    pub include_usage: bool,
}

#[derive(Serialize, Debug)]
pub struct OpenAIMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Serialize, Debug)]
pub struct OpenAITool {
    #[serde(rename = "type")]
    pub tool_type: &'static str,
    pub function: OpenAIFunction,
}

#[derive(Serialize, Debug)]
pub struct OpenAIFunction {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Deserialize, Debug)]
pub struct OpenAIResponse {
    #[serde(default)]
    pub model: String,
    pub choices: Vec<OpenAIChoice>,
    pub usage: Option<OpenAIUsage>,
}

#[derive(Deserialize, Debug)]
pub struct OpenAIChoice {
    pub message: OpenAIResponseMessage,
    pub finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct OpenAIResponseMessage {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<OpenAIToolCall>,
}

#[derive(Deserialize, Debug)]
pub struct OpenAIToolCall {
    pub id: String,
    pub function: OpenAIFunctionCall,
}

/// `arguments` is a JSON-encoded string, not an object
#[derive(Deserialize, Debug)]
pub struct OpenAIFunctionCall {
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

#[derive(Deserialize, Debug, Clone, Copy)]
pub struct OpenAIUsage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
}

// Streaming chunk: `data: {...}` lines of a chat-completions stream

#[derive(Deserialize, Debug)]
pub struct OpenAIStreamChunk {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub choices: Vec<OpenAIStreamChoice>,
    #[serde(default)]
    pub usage: Option<OpenAIUsage>,
}

#[derive(Deserialize, Debug)]
pub struct OpenAIStreamChoice {
    #[serde(default)]
    pub delta: OpenAIDelta,
    pub finish_reason: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
pub struct OpenAIDelta {
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<OpenAIToolCallDelta>,
}

#[derive(Deserialize, Debug)]
pub struct OpenAIToolCallDelta {
    pub index: usize,
    pub id: Option<String>,
    pub function: Option<OpenAIFunctionDelta>,
}

#[derive(Deserialize, Debug)]
pub struct OpenAIFunctionDelta {
    pub name: Option<String>,
    pub arguments: Option<String>,
}

// Image generation

#[derive(Serialize, Debug)]
pub struct OpenAIImageRequest {
    pub model: String,
    pub prompt: String,
    pub n: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct OpenAIImageResponse {
    pub data: Vec<OpenAIImageData>,
}

#[derive(Deserialize, Debug)]
pub struct OpenAIImageData {
    pub url: Option<String>,
    pub b64_json: Option<String>,
}

// Model listing

#[derive(Deserialize, Debug)]
pub struct OpenAIModelList {
    pub data: Vec<OpenAIModel>,
}

#[derive(Deserialize, Debug)]
pub struct OpenAIModel {
    pub id: String,
    #[serde(default)]
    pub created: u64,
    #[serde(default)]
    pub owned_by: String,
}
