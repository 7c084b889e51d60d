// Anthropic Provider Implementation
use async_trait::async_trait;
use reqwest::Client;
use tokio_util::sync::CancellationToken;

use crate::{
    config::ProviderDetail,
    errors::{AppError, AppResult},
    job::{Job, JobKind},
    pricing::CostCalculator,
    providers::{
        AIProvider, CompletionRequest, CompletionResponse, ModelInfo, ModelLister, OnChunk,
        ProviderResult, Role, StreamingProvider, ToolCall, anthropic::*, error_from_response,
        reported_or_estimated, stream::normalize_stream,
    },
};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MODEL: &str = "claude-3-5-haiku-20241022";

/// Anthropic provider implementation (Messages API)
///
/// Text only. Streaming uses the content-block event taxonomy.
pub struct AnthropicProvider {
    config: ProviderDetail,
    client: Client,
    cost: CostCalculator,
}

impl AnthropicProvider {
    /// 创建新的Anthropic提供商实例
    ///
    /// ## 参数说明
    /// - `config`: Anthropic提供商的详细配置，包含API密钥、基础URL等
    /// - `client`: 此提供商专用的HTTP客户端
    /// - `cost`: 成本计算器，先查询定价服务，再回退到静态费率表
    ///
    /// ## 执行例子
    /// ```rust,ignore
    /// let client = build_http_client(&detail, &config.performance)?;
    /// let cost = CostCalculator::new(&detail.name, None, FallbackRates::anthropic());
    /// let provider = AnthropicProvider::new(detail, client, cost);
    /// ```
    pub fn new(config: ProviderDetail, client: Client, cost: CostCalculator) -> Self {
        Self {
            config,
            client,
            cost,
        }
    }

    /// Convert the uniform request into a Messages API body. System messages
    /// move to the top-level `system` field.
    fn convert_request(&self, request: &CompletionRequest, stream: bool) -> AnthropicRequest {
        let messages = request
            .messages
            .iter()
            .filter(|msg| msg.role != Role::System)
            .map(|msg| AnthropicMessage {
                role: msg.role.as_str().to_string(),
                content: msg.content.clone(),
            })
            .collect();

        let tools = request
            .tools
            .iter()
            .map(|tool| AnthropicTool {
                name: tool.name.clone(),
                description: tool.description.clone(),
                input_schema: tool.parameters.clone(),
            })
            .collect();

        AnthropicRequest {
            model: request
                .model
                .clone()
                .or_else(|| self.config.default_model.clone())
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            messages,
            max_tokens: request.max_tokens,
            system: request.system_prompt().map(str::to_string),
            stream: stream.then_some(true),
            temperature: request.temperature,
            tools,
        }
    }

    async fn send(&self, body: &AnthropicRequest) -> AppResult<reqwest::Response> {
        let url = format!("{}messages", self.config.base_url());

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| AppError::ProviderError {
                status: 502,
                message: format!("Failed to send request to Anthropic: {}", e),
            })?;

        if !response.status().is_success() {
            return Err(error_from_response("Anthropic", response).await);
        }

        Ok(response)
    }

    pub async fn complete(&self, request: CompletionRequest) -> AppResult<CompletionResponse> {
        request.validate().map_err(AppError::ValidationError)?;

        let body = self.convert_request(&request, false);
        let response = self.send(&body).await?;

        let anthropic_res = response
            .json::<AnthropicResponse>()
            .await
            .map_err(|e| AppError::ProviderError {
                status: 502,
                message: format!("Failed to parse Anthropic response: {}", e),
            })?;

        let mut content = String::new();
        let mut tool_calls = Vec::new();
        for block in anthropic_res.content {
            match block {
                ContentBlock::Text { text } => content.push_str(&text),
                ContentBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                    id,
                    name,
                    arguments: input.to_string(),
                }),
                ContentBlock::Unknown => {}
            }
        }

        let tokens_in = reported_or_estimated(
            anthropic_res.usage.map(|u| u.input_tokens),
            request.prompt_len(),
        );
        let tokens_out = reported_or_estimated(
            anthropic_res.usage.map(|u| u.output_tokens),
            content.len(),
        );
        let model = if anthropic_res.model.is_empty() {
            body.model
        } else {
            anthropic_res.model
        };
        let cost = self.cost.token_cost(&model, tokens_in, tokens_out).await;

        Ok(CompletionResponse {
            content,
            model,
            tokens_in,
            tokens_out,
            cost,
            tool_calls,
            finish_reason: anthropic_res.stop_reason,
        })
    }
}

#[async_trait]
impl AIProvider for AnthropicProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn provider_type(&self) -> &str {
        "anthropic"
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
            kind => Err(AppError::unsupported_kind(&self.config.name, kind)),
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
impl StreamingProvider for AnthropicProvider {
    async fn complete_stream(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
        on_chunk: &mut OnChunk<'_>,
    ) -> AppResult<CompletionResponse> {
        request.validate().map_err(AppError::ValidationError)?;

        let body = self.convert_request(&request, true);
        let response = self.send(&body).await?;

        let mut decoder = AnthropicStreamDecoder;
        let outcome = normalize_stream(
            response.bytes_stream(),
            &mut decoder,
            request.prompt_len(),
            &cancel,
            on_chunk,
        )
        .await?;

        let model = outcome.model.unwrap_or(body.model);
        let cost = self
            .cost
            .token_cost(&model, outcome.tokens_in, outcome.tokens_out)
            .await;

        tracing::debug!(
            provider = %self.config.name,
            model = %model,
            tokens_in = outcome.tokens_in,
            tokens_out = outcome.tokens_out,
            tool_calls = outcome.tool_calls.len(),
            "anthropic stream finished"
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
impl ModelLister for AnthropicProvider {
    /// Configured models, or a built-in list when none are configured.
    async fn list_models(&self) -> AppResult<Vec<ModelInfo>> {
        let models = self.config.models.clone().unwrap_or_else(|| {
            vec![
                "claude-3-5-sonnet-20241022".to_string(),
                "claude-3-5-haiku-20241022".to_string(),
                "claude-3-opus-20240229".to_string(),
                "claude-3-haiku-20240307".to_string(),
            ]
        });

        Ok(models
            .into_iter()
            .map(|model| ModelInfo::new(model, "anthropic"))
            .collect())
    }
}
