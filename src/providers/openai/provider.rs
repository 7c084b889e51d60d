use async_trait::async_trait;
use reqwest::Client;
use tokio_util::sync::CancellationToken;

use crate::{
    config::ProviderDetail,
    errors::{AppError, AppResult},
    job::{Job, JobKind},
    pricing::CostCalculator,
    providers::{
        AIProvider, CompletionRequest, CompletionResponse, ImageRequest, ModelInfo, ModelLister,
        OnChunk, ProviderResult, StreamingProvider, ToolCall, error_from_response, openai::*,
        reported_or_estimated, stream::normalize_stream,
    },
};

const DEFAULT_CHAT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_IMAGE_MODEL: &str = "dall-e-3";

/// OpenAI provider implementation
///
/// Text jobs go to `chat/completions`, image jobs to `images/generations`.
pub struct OpenAIProvider {
    config: ProviderDetail,
    client: Client,
    cost: CostCalculator,
}

impl OpenAIProvider {
    pub fn new(config: ProviderDetail, client: Client, cost: CostCalculator) -> Self {
        Self {
            config,
            client,
            cost,
        }
    }

    fn chat_model(&self, request: &CompletionRequest) -> String {
        request
            .model
            .clone()
            .or_else(|| self.config.default_model.clone())
            .unwrap_or_else(|| DEFAULT_CHAT_MODEL.to_string())
    }

    /// Convert the uniform request into the chat-completions shape
    fn convert_request(&self, request: &CompletionRequest, stream: bool) -> OpenAIRequest {
        let messages = request
            .messages
            .iter()
            .map(|msg| OpenAIMessage {
                role: msg.role.as_str().to_string(),
                content: Some(msg.content.clone()),
            })
            .collect();

        let tools = request
            .tools
            .iter()
            .map(|tool| OpenAITool {
                tool_type: "function",
                function: OpenAIFunction {
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                    parameters: tool.parameters.clone(),
                },
            })
            .collect();

        OpenAIRequest {
            model: self.chat_model(request),
            messages,
            max_tokens: request.max_tokens,
            stream: stream.then_some(true),
            stream_options: stream.then_some(StreamOptions {
                include_usage: true,
            }),
            temperature: request.temperature,
            tools,
        }
    }

    async fn post_json<T: serde::Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
    ) -> AppResult<reqwest::Response> {
        let url = format!("{}{}", self.config.base_url(), path);

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| AppError::ProviderError {
                status: 502,
                message: format!("Failed to send request to OpenAI: {}", e),
            })?;

        // Handle HTTP errors
        if !response.status().is_success() {
            return Err(error_from_response("OpenAI", response).await);
        }

        Ok(response)
    }

    /// 非流式文本补全
    ///
    /// ## 内部实现逻辑
    /// 1. 验证请求并转换为OpenAI格式
    /// 2. 调用`chat/completions`接口
    /// 3. 后端未返回usage时按长度估算token
    /// 4. 通过成本计算器得出费用
    pub async fn complete(&self, request: CompletionRequest) -> AppResult<CompletionResponse> {
        request.validate().map_err(AppError::ValidationError)?;

        let openai_req = self.convert_request(&request, false);
        let model = openai_req.model.clone();
        let response = self.post_json("chat/completions", &openai_req).await?;

        let openai_res = response
            .json::<OpenAIResponse>()
            .await
            .map_err(|e| AppError::ProviderError {
                status: 502,
                message: format!("Failed to parse OpenAI response: {}", e),
            })?;

        let choice = openai_res
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| AppError::ProviderError {
                status: 502,
                message: "No choices in OpenAI response".to_string(),
            })?;

        let content = choice.message.content.unwrap_or_default();
        let tool_calls: Vec<ToolCall> = choice
            .message
            .tool_calls
            .into_iter()
            .map(|call| ToolCall {
                id: call.id,
                name: call.function.name,
                arguments: if call.function.arguments.is_empty() {
                    "{}".to_string()
                } else {
                    call.function.arguments
                },
            })
            .collect();
        let tokens_in = reported_or_estimated(
            openai_res.usage.map(|u| u.prompt_tokens),
            request.prompt_len(),
        );
        let tokens_out = reported_or_estimated(
            openai_res.usage.map(|u| u.completion_tokens),
            content.len(),
        );
        let model = if openai_res.model.is_empty() {
            model
        } else {
            openai_res.model
        };
        let cost = self.cost.token_cost(&model, tokens_in, tokens_out).await;

        Ok(CompletionResponse {
            content,
            model,
            tokens_in,
            tokens_out,
            cost,
            tool_calls,
            finish_reason: choice.finish_reason,
        })
    }

    /// Generate one image and return its URL, or the base64 payload when the
    /// backend answers inline.
    pub async fn generate_image(&self, request: ImageRequest) -> AppResult<ProviderResult> {
        if request.prompt.trim().is_empty() {
            return Err(AppError::ValidationError("Image prompt cannot be empty".to_string()));
        }

        let model = request
            .model
            .or_else(|| self.config.image_model.clone())
            .unwrap_or_else(|| DEFAULT_IMAGE_MODEL.to_string());

        let body = OpenAIImageRequest {
            model: model.clone(),
            prompt: request.prompt,
            n: 1,
            size: request.size,
        };
        let response = self.post_json("images/generations", &body).await?;

        let image_res = response
            .json::<OpenAIImageResponse>()
            .await
            .map_err(|e| AppError::ProviderError {
                status: 502,
                message: format!("Failed to parse OpenAI image response: {}", e),
            })?;

        let content = image_res
            .data
            .into_iter()
            .find_map(|d| d.url.or(d.b64_json))
            .ok_or_else(|| AppError::ProviderError {
                status: 502,
                message: "No image in OpenAI response".to_string(),
            })?;

        let cost = self.cost.image_cost(&model).await;
        Ok(ProviderResult {
            content,
            model,
            tokens_in: 0,
            tokens_out: 0,
            cost,
        })
    }

    fn configured_models(&self) -> Vec<ModelInfo> {
        let models = self.config.models.clone().unwrap_or_else(|| {
            vec![
                "gpt-4o".to_string(),
                "gpt-4o-mini".to_string(),
                "gpt-4-turbo".to_string(),
                "gpt-3.5-turbo".to_string(),
            ]
        });

        models
            .into_iter()
            .map(|model| ModelInfo::new(model, "openai"))
            .collect()
    }
}

#[async_trait]
impl AIProvider for OpenAIProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn provider_type(&self) -> &str {
        "openai"
    }

    fn supports(&self, kind: JobKind) -> bool {
        matches!(kind, JobKind::Text | JobKind::Image)
    }

    async fn is_available(&self) -> bool {
        !self.config.api_key.trim().is_empty()
    }

    async fn execute(&self, job: &Job) -> AppResult<ProviderResult> {
        match job.kind {
            JobKind::Text => self
                .complete(CompletionRequest::from_prompt(job.input.clone()))
                .await
                .map(ProviderResult::from),
            JobKind::Image => {
                self.generate_image(ImageRequest::from_prompt(job.input.clone()))
                    .await
            }
        }
    }

    fn as_streaming(&self) -> Option<&dyn StreamingProvider> {
        Some(self)
    }

    fn as_model_lister(&self) -> Option<&dyn ModelLister> {
        Some(self)
    }
}

#[async_trait]
impl StreamingProvider for OpenAIProvider {
    async fn complete_stream(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
        on_chunk: &mut OnChunk<'_>,
    ) -> AppResult<CompletionResponse> {
        request.validate().map_err(AppError::ValidationError)?;

        let openai_req = self.convert_request(&request, true);
        let requested_model = openai_req.model.clone();
        let response = self.post_json("chat/completions", &openai_req).await?;

        let mut decoder = OpenAIStreamDecoder;
        let outcome = normalize_stream(
            response.bytes_stream(),
            &mut decoder,
            request.prompt_len(),
            &cancel,
            on_chunk,
        )
        .await?;

        let model = outcome.model.unwrap_or(requested_model);
        let cost = self
            .cost
            .token_cost(&model, outcome.tokens_in, outcome.tokens_out)
            .await;

        tracing::debug!(
            provider = %self.config.name,
            model = %model,
            tokens_in = outcome.tokens_in,
            tokens_out = outcome.tokens_out,
            usage_estimated = outcome.usage_estimated,
            "openai stream finished"
        );

        Ok(CompletionResponse {
            content: outcome.content,
            model,
            tokens_in: outcome.tokens_in,
            tokens_out: outcome.tokens_out,
            cost,
            tool_calls: outcome.tool_calls,
            finish_reason: outcome.finish_reason,
        })
    }
}

#[async_trait]
impl ModelLister for OpenAIProvider {
    async fn list_models(&self) -> AppResult<Vec<ModelInfo>> {
        let url = format!("{}models", self.config.base_url());

        let result = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .send()
            .await;

        let response = match result {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                tracing::warn!(provider = %self.config.name, status = %response.status(), "model listing failed, using configured models");
                return Ok(self.configured_models());
            }
            Err(e) => {
                tracing::warn!(provider = %self.config.name, error = %e, "model listing failed, using configured models");
                return Ok(self.configured_models());
            }
        };

        let list = response
            .json::<OpenAIModelList>()
            .await
            .map_err(|e| AppError::ProviderError {
                status: 502,
                message: format!("Failed to parse OpenAI model list: {}", e),
            })?;

        Ok(list
            .data
            .into_iter()
            .map(|model| ModelInfo {
                id: model.id,
                object: "model".to_string(),
                created: model.created,
                owned_by: if model.owned_by.is_empty() {
                    "openai".to_string()
                } else {
                    model.owned_by
                },
            })
            .collect())
    }
}
