use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::{
    config::ProviderDetail,
    errors::{AppError, AppResult},
    job::{Job, JobKind},
    pricing::CostCalculator,
    providers::{
        AIProvider, ModelInfo, ModelLister, ProviderResult, error_from_response,
        reported_or_estimated,
    },
};

const DEFAULT_MODEL: &str = "llama3";

#[derive(Serialize, Debug)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

#[derive(Deserialize, Debug)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
    #[serde(default)]
    model: String,
    prompt_eval_count: Option<u32>,
    eval_count: Option<u32>,
}

#[derive(Deserialize, Debug)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagModel>,
}

#[derive(Deserialize, Debug)]
struct TagModel {
    name: String,
}

/// Self-hosted inference server (Ollama-style `api/generate`)
///
/// Availability is a reachability probe against `api/tags` bounded by a
/// short timeout, so a stopped server is reported unavailable quickly.
pub struct LocalProvider {
    config: ProviderDetail,
    client: Client,
    cost: CostCalculator,
    probe_timeout: Duration,
}

impl LocalProvider {
    pub fn new(
        config: ProviderDetail,
        client: Client,
        cost: CostCalculator,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            config,
            client,
            cost,
            probe_timeout,
        }
    }

    fn model(&self) -> &str {
        self.config.default_model.as_deref().unwrap_or(DEFAULT_MODEL)
    }

    async fn generate(&self, prompt: &str) -> AppResult<ProviderResult> {
        if prompt.trim().is_empty() {
            return Err(AppError::ValidationError("Prompt cannot be empty".to_string()));
        }

        let url = format!("{}api/generate", self.config.base_url());
        let body = GenerateRequest {
            model: self.model(),
            prompt,
            stream: false,
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::ProviderError {
                status: 502,
                message: format!("Failed to reach local inference server: {}", e),
            })?;

        if !response.status().is_success() {
            return Err(error_from_response("Local server", response).await);
        }

        let generated = response
            .json::<GenerateResponse>()
            .await
            .map_err(|e| AppError::ProviderError {
                status: 502,
                message: format!("Failed to parse local server response: {}", e),
            })?;

        let tokens_in = reported_or_estimated(generated.prompt_eval_count, prompt.len());
        let tokens_out = reported_or_estimated(generated.eval_count, generated.response.len());
        let model = if generated.model.is_empty() {
            self.model().to_string()
        } else {
            generated.model
        };
        let cost = self.cost.token_cost(&model, tokens_in, tokens_out).await;

        Ok(ProviderResult {
            content: generated.response,
            model,
            tokens_in,
            tokens_out,
            cost,
        })
    }
}

#[async_trait]
impl AIProvider for LocalProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn provider_type(&self) -> &str {
        "local"
    }

    async fn is_available(&self) -> bool {
        let url = format!("{}api/tags", self.config.base_url());
        match self
            .client
            .get(&url)
            .timeout(self.probe_timeout)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!(provider = %self.config.name, error = %e, "local server unreachable");
                false
            }
        }
    }

    async fn execute(&self, job: &Job) -> AppResult<ProviderResult> {
        match job.kind {
            JobKind::Text => self.generate(&job.input).await,
            kind => Err(AppError::unsupported_kind(&self.config.name, kind)),
        }
    }

    fn as_model_lister(&self) -> Option<&dyn ModelLister> {
        Some(self)
    }
}

#[async_trait]
impl ModelLister for LocalProvider {
    async fn list_models(&self) -> AppResult<Vec<ModelInfo>> {
        let url = format!("{}api/tags", self.config.base_url());
        let response = self.client.get(&url).send().await?;

        if !response.status().is_success() {
            return Err(error_from_response("Local server", response).await);
        }

        let tags = response.json::<TagsResponse>().await?;
        Ok(tags
            .models
            .into_iter()
            .map(|m| ModelInfo::new(m.name, "local"))
            .collect())
    }
}
