use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use super::{
    anthropic::AnthropicProvider, local::LocalProvider, openai::OpenAIProvider, stub::StubProvider,
};
use crate::{
    config::{Config, PerformanceConfig, ProviderDetail, ProviderType},
    errors::{AppError, AppResult},
    job::JobKind,
    pricing::{CostCalculator, FallbackRates, PricingService},
    providers::{AIProvider, ModelInfo, build_http_client},
};

#[derive(Default)]
struct RegistryInner {
    /// Registration order
    providers: Vec<Arc<dyn AIProvider>>,
    /// name -> position in `providers`
    index: HashMap<String, usize>,
}

/// Provider registry that manages all configured AI providers
///
/// Providers keep their registration order, which is also the selection
/// order. The map is read-mostly: lookups and selection share the lock,
/// `register` takes it exclusively for the insert only.
pub struct ProviderRegistry {
    inner: RwLock<RegistryInner>,
}

impl ProviderRegistry {
    /// 从配置创建新的提供商注册表
    ///
    /// ## 功能说明
    /// 按配置列表顺序初始化所有启用的AI提供商，列表顺序即选择顺序
    ///
    /// ## 内部实现逻辑
    /// 1. 遍历配置中的所有提供商，跳过`enabled = false`的条目
    /// 2. 根据`type`字段创建对应的提供商实例（openai/anthropic/local/stub）
    /// 3. 每个网络提供商拥有独立的HTTP客户端和成本计算器
    /// 4. 验证至少注册了一个提供商
    ///
    /// ## 参数说明
    /// - `config`: 应用程序配置
    /// - `pricing`: 可选的定价服务，为空时只使用静态费率表
    ///
    /// ## 返回值
    /// - `Ok(ProviderRegistry)`: 成功创建的提供商注册表
    /// - `Err(AppError::ConfigError)`: HTTP客户端创建失败或没有可用提供商
    pub fn from_config(config: &Config, pricing: Option<Arc<PricingService>>) -> AppResult<Self> {
        let mut inner = RegistryInner::default();

        for detail in &config.providers {
            if !detail.enabled {
                tracing::info!(provider = %detail.name, "provider disabled, skipping");
                continue;
            }

            let provider = Self::build_provider(detail, &config.performance, pricing.clone())?;
            tracing::info!(provider = %detail.name, provider_type = %detail.provider_type, "provider registered");
            Self::insert(&mut inner, provider);
        }

        // 验证至少配置了一个提供商
        if inner.providers.is_empty() {
            return Err(AppError::ConfigError(
                "No providers configured. At least one provider must be enabled.".to_string(),
            ));
        }

        Ok(Self {
            inner: RwLock::new(inner),
        })
    }

    /// Create an empty provider registry
    pub fn new_empty() -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
        }
    }

    fn build_provider(
        detail: &ProviderDetail,
        perf: &PerformanceConfig,
        pricing: Option<Arc<PricingService>>,
    ) -> AppResult<Arc<dyn AIProvider>> {
        let provider: Arc<dyn AIProvider> = match detail.provider_type {
            ProviderType::OpenAI => {
                let cost = CostCalculator::new(
                    &detail.name,
                    pricing,
                    FallbackRates::openai().merged(&detail.fallback_rates),
                );
                Arc::new(OpenAIProvider::new(
                    detail.clone(),
                    build_http_client(detail, perf)?,
                    cost,
                ))
            }
            ProviderType::Anthropic => {
                let cost = CostCalculator::new(
                    &detail.name,
                    pricing,
                    FallbackRates::anthropic().merged(&detail.fallback_rates),
                );
                Arc::new(AnthropicProvider::new(
                    detail.clone(),
                    build_http_client(detail, perf)?,
                    cost,
                ))
            }
            ProviderType::Local => {
                let cost = CostCalculator::new(
                    &detail.name,
                    pricing,
                    FallbackRates::new(detail.fallback_rates.clone()),
                );
                Arc::new(LocalProvider::new(
                    detail.clone(),
                    build_http_client(detail, perf)?,
                    cost,
                    Duration::from_millis(perf.availability_timeout_ms),
                ))
            }
            ProviderType::Stub => Arc::new(StubProvider::new(detail.name.clone())),
        };

        Ok(provider)
    }

    fn insert(inner: &mut RegistryInner, provider: Arc<dyn AIProvider>) {
        let name = provider.name().to_string();
        match inner.index.get(&name) {
            Some(&pos) => inner.providers[pos] = provider,
            None => {
                inner.index.insert(name, inner.providers.len());
                inner.providers.push(provider);
            }
        }
    }

    /// Register a provider. Re-registering a name replaces the earlier
    /// provider in place, keeping its selection position.
    pub async fn register(&self, provider: Arc<dyn AIProvider>) {
        let mut inner = self.inner.write().await;
        tracing::debug!(provider = %provider.name(), "registering provider");
        Self::insert(&mut inner, provider);
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn AIProvider>> {
        let inner = self.inner.read().await;
        inner
            .index
            .get(name)
            .map(|&pos| Arc::clone(&inner.providers[pos]))
    }

    /// All providers in registration order
    pub async fn list(&self) -> Vec<Arc<dyn AIProvider>> {
        self.inner.read().await.providers.clone()
    }

    pub async fn provider_names(&self) -> Vec<String> {
        self.inner
            .read()
            .await
            .providers
            .iter()
            .map(|p| p.name().to_string())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.providers.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// 为指定任务类型选择提供商
    ///
    /// ## 功能说明
    /// 按注册顺序遍历提供商，返回第一个支持该任务类型且可用性探测成功的提供商
    ///
    /// ## 内部实现逻辑
    /// 1. 在读锁内复制提供商列表，探测期间不持有锁
    /// 2. 跳过不支持该任务类型的提供商
    /// 3. 逐个执行可用性探测，第一个成功者胜出
    ///
    /// ## 返回值
    /// - `Ok(Arc<dyn AIProvider>)`: 选中的提供商
    /// - `Err(AppError::NoProviderAvailable)`: 没有可用的提供商
    pub async fn select_for_kind(&self, kind: JobKind) -> AppResult<Arc<dyn AIProvider>> {
        for provider in self.list().await {
            if !provider.supports(kind) {
                continue;
            }
            if provider.is_available().await {
                tracing::debug!(provider = %provider.name(), kind = %kind, "provider selected");
                return Ok(provider);
            }
            tracing::debug!(provider = %provider.name(), "provider unavailable, trying next");
        }

        Err(AppError::NoProviderAvailable)
    }

    /// 获取所有提供商的可用模型列表
    ///
    /// ## 容错机制
    /// - 不具备模型列表能力的提供商直接跳过
    /// - 单个提供商失败不会影响整体结果，只记录警告日志
    pub async fn list_all_models(&self) -> Vec<ModelInfo> {
        let mut all_models = Vec::new();

        for provider in self.list().await {
            let Some(lister) = provider.as_model_lister() else {
                continue;
            };
            match lister.list_models().await {
                Ok(mut models) => all_models.append(&mut models),
                Err(e) => {
                    tracing::warn!(provider = %provider.name(), error = %e, "Failed to get models from provider");
                }
            }
        }

        all_models
    }

    /// Probe every provider once.
    pub async fn availability_all(&self) -> HashMap<String, bool> {
        let mut results = HashMap::new();
        for provider in self.list().await {
            let available = provider.is_available().await;
            results.insert(provider.name().to_string(), available);
        }
        results
    }
}
