use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{
    errors::{AppError, AppResult},
    store::PricingStore,
};

const TOKENS_PER_UNIT: f64 = 1_000_000.0;

/// Unit prices for one provider/model pair
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProviderPricing {
    pub id: Uuid,
    pub provider: String,
    pub model: String,
    pub input_price_per_million_tokens: f64,
    pub output_price_per_million_tokens: f64,
    pub image_price: Option<f64>,
    /// Provider-level fallback used when no exact model row exists
    pub is_default: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProviderPricing {
    pub fn new(
        provider: impl Into<String>,
        model: impl Into<String>,
        input_price_per_million_tokens: f64,
        output_price_per_million_tokens: f64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            provider: provider.into(),
            model: model.into(),
            input_price_per_million_tokens,
            output_price_per_million_tokens,
            image_price: None,
            is_default: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_image_price(mut self, price: f64) -> Self {
        self.image_price = Some(price);
        self
    }

    pub fn as_default(mut self) -> Self {
        self.is_default = true;
        self
    }

    /// Synthetic record returned when nothing is configured.
    fn zero(provider: &str, model: &str) -> Self {
        Self {
            id: Uuid::nil(),
            ..Self::new(provider, model, 0.0, 0.0)
        }
    }

    fn validate(&self) -> AppResult<()> {
        if self.provider.is_empty() {
            return Err(AppError::ValidationError("pricing provider cannot be empty".to_string()));
        }
        let prices = [
            self.input_price_per_million_tokens,
            self.output_price_per_million_tokens,
            self.image_price.unwrap_or(0.0),
        ];
        if prices.iter().any(|p| !p.is_finite() || *p < 0.0) {
            return Err(AppError::ValidationError(
                "prices must be finite and non-negative".to_string(),
            ));
        }
        Ok(())
    }

    /// Token cost at this record's unit prices.
    pub fn token_cost(&self, tokens_in: u32, tokens_out: u32) -> f64 {
        f64::from(tokens_in) * self.input_price_per_million_tokens / TOKENS_PER_UNIT
            + f64::from(tokens_out) * self.output_price_per_million_tokens / TOKENS_PER_UNIT
    }
}

/// Pricing lookup with an in-memory cache keyed on `provider:model`
///
/// Lookups fall back from the exact model row to the provider default, then
/// to a zero-priced record. Every mutation drops the whole cache.
pub struct PricingService {
    store: Arc<dyn PricingStore>,
    cache: RwLock<PricingCache>,
}

/// Cached rows plus a counter bumped on every invalidation. A lookup only
/// fills the cache if no invalidation happened while it read the store.
#[derive(Default)]
struct PricingCache {
    entries: HashMap<String, ProviderPricing>,
    generation: u64,
}

impl PricingService {
    pub fn new(store: Arc<dyn PricingStore>) -> Self {
        Self {
            store,
            cache: RwLock::new(PricingCache::default()),
        }
    }

    fn cache_key(provider: &str, model: &str) -> String {
        format!("{}:{}", provider, model)
    }

    /// 获取提供商/模型的价格
    ///
    /// ## 功能说明
    /// 先查缓存；未命中时依次尝试精确的提供商+模型记录、提供商默认记录，
    /// 最后返回零价格记录。结果写入缓存，只有显式失效才会清除
    ///
    /// ## 返回值
    /// - `Ok(ProviderPricing)`: 命中的价格记录（可能是零价格）
    /// - `Err(AppError)`: 存储层错误
    pub async fn get_pricing(&self, provider: &str, model: &str) -> AppResult<ProviderPricing> {
        let key = Self::cache_key(provider, model);
        let generation = {
            let cache = self.cache.read().await;
            if let Some(hit) = cache.entries.get(&key) {
                return Ok(hit.clone());
            }
            cache.generation
        };

        tracing::debug!(provider, model, "pricing cache miss");
        let pricing = match self.store.find(provider, model).await? {
            Some(exact) => exact,
            None => match self.store.find_default(provider).await? {
                Some(default) => default,
                None => ProviderPricing::zero(provider, model),
            },
        };

        let mut cache = self.cache.write().await;
        if cache.generation == generation {
            cache.entries.insert(key, pricing.clone());
        } else {
            tracing::debug!(provider, model, "pricing changed during lookup, not caching");
        }
        Ok(pricing)
    }

    pub async fn calculate_cost(
        &self,
        provider: &str,
        model: &str,
        tokens_in: u32,
        tokens_out: u32,
    ) -> AppResult<f64> {
        let pricing = self.get_pricing(provider, model).await?;
        Ok(pricing.token_cost(tokens_in, tokens_out))
    }

    /// Flat per-image price, or 0 when none is configured.
    pub async fn calculate_image_cost(&self, provider: &str, model: &str) -> AppResult<f64> {
        let pricing = self.get_pricing(provider, model).await?;
        Ok(pricing.image_price.unwrap_or(0.0))
    }

    pub async fn list(&self) -> AppResult<Vec<ProviderPricing>> {
        self.store.list().await
    }

    pub async fn create(&self, pricing: ProviderPricing) -> AppResult<ProviderPricing> {
        pricing.validate()?;
        if pricing.is_default {
            self.demote_defaults(&pricing.provider, pricing.id).await?;
        }
        self.store.create(&pricing).await?;
        self.invalidate_cache().await;
        tracing::info!(provider = %pricing.provider, model = %pricing.model, "pricing created");
        Ok(pricing)
    }

    pub async fn update(&self, mut pricing: ProviderPricing) -> AppResult<ProviderPricing> {
        pricing.validate()?;
        pricing.updated_at = Utc::now();
        if pricing.is_default {
            self.demote_defaults(&pricing.provider, pricing.id).await?;
        }
        self.store.update(&pricing).await?;
        self.invalidate_cache().await;
        tracing::info!(provider = %pricing.provider, model = %pricing.model, "pricing updated");
        Ok(pricing)
    }

    pub async fn delete(&self, id: Uuid) -> AppResult<()> {
        self.store.delete(id).await?;
        self.invalidate_cache().await;
        tracing::info!(%id, "pricing deleted");
        Ok(())
    }

    pub async fn invalidate_cache(&self) {
        let mut cache = self.cache.write().await;
        cache.entries.clear();
        cache.generation += 1;
    }

    pub async fn cached_entries(&self) -> usize {
        self.cache.read().await.entries.len()
    }

    // At most one default per provider: a new default demotes the old one.
    async fn demote_defaults(&self, provider: &str, keep: Uuid) -> AppResult<()> {
        while let Some(mut current) = self.store.find_default(provider).await? {
            if current.id == keep {
                break;
            }
            current.is_default = false;
            current.updated_at = Utc::now();
            self.store.update(&current).await?;
        }
        Ok(())
    }
}

/// Static per-million token rates for one model
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct TokenRate {
    pub input_per_million: f64,
    pub output_per_million: f64,
    #[serde(default)]
    pub image_price: Option<f64>,
}

impl TokenRate {
    pub const fn new(input_per_million: f64, output_per_million: f64) -> Self {
        Self {
            input_per_million,
            output_per_million,
            image_price: None,
        }
    }
}

/// Provider-specific rate table used when the pricing service yields zero
///
/// Model lookup is exact first, then the longest configured prefix, so dated
/// model ids (`claude-3-5-sonnet-20241022`) resolve to their family rate.
#[derive(Debug, Clone, Default)]
pub struct FallbackRates {
    rates: HashMap<String, TokenRate>,
}

impl FallbackRates {
    pub fn new(rates: HashMap<String, TokenRate>) -> Self {
        Self { rates }
    }

    pub fn openai() -> Self {
        Self::from_pairs(&[
            ("gpt-4o-mini", TokenRate::new(0.15, 0.60)),
            ("gpt-4o", TokenRate::new(2.50, 10.00)),
            ("gpt-4-turbo", TokenRate::new(10.00, 30.00)),
            ("gpt-4", TokenRate::new(30.00, 60.00)),
            ("gpt-3.5-turbo", TokenRate::new(0.50, 1.50)),
            (
                "dall-e-3",
                TokenRate {
                    image_price: Some(0.04),
                    ..TokenRate::new(0.0, 0.0)
                },
            ),
        ])
    }

    pub fn anthropic() -> Self {
        Self::from_pairs(&[
            ("claude-3-5-sonnet", TokenRate::new(3.00, 15.00)),
            ("claude-3-5-haiku", TokenRate::new(0.80, 4.00)),
            ("claude-3-opus", TokenRate::new(15.00, 75.00)),
            ("claude-3-sonnet", TokenRate::new(3.00, 15.00)),
            ("claude-3-haiku", TokenRate::new(0.25, 1.25)),
        ])
    }

    fn from_pairs(pairs: &[(&str, TokenRate)]) -> Self {
        Self {
            rates: pairs.iter().map(|(m, r)| (m.to_string(), *r)).collect(),
        }
    }

    /// Overlay configured rates on top of these.
    pub fn merged(mut self, overrides: &HashMap<String, TokenRate>) -> Self {
        for (model, rate) in overrides {
            self.rates.insert(model.clone(), *rate);
        }
        self
    }

    pub fn rate_for(&self, model: &str) -> Option<TokenRate> {
        if let Some(rate) = self.rates.get(model) {
            return Some(*rate);
        }
        self.rates
            .iter()
            .filter(|(prefix, _)| model.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, rate)| *rate)
    }

    pub fn token_cost(&self, model: &str, tokens_in: u32, tokens_out: u32) -> f64 {
        self.rate_for(model)
            .map(|r| {
                f64::from(tokens_in) * r.input_per_million / TOKENS_PER_UNIT
                    + f64::from(tokens_out) * r.output_per_million / TOKENS_PER_UNIT
            })
            .unwrap_or(0.0)
    }

    pub fn image_cost(&self, model: &str) -> f64 {
        self.rate_for(model).and_then(|r| r.image_price).unwrap_or(0.0)
    }
}

/// Cost calculation as seen by one provider adapter
///
/// Asks the pricing service first and drops to the static table when the
/// service has nothing (or fails).
#[derive(Clone)]
pub struct CostCalculator {
    provider: String,
    pricing: Option<Arc<PricingService>>,
    fallback: FallbackRates,
}

impl CostCalculator {
    pub fn new(
        provider: impl Into<String>,
        pricing: Option<Arc<PricingService>>,
        fallback: FallbackRates,
    ) -> Self {
        Self {
            provider: provider.into(),
            pricing,
            fallback,
        }
    }

    pub async fn token_cost(&self, model: &str, tokens_in: u32, tokens_out: u32) -> f64 {
        let priced = match &self.pricing {
            Some(pricing) => pricing
                .calculate_cost(&self.provider, model, tokens_in, tokens_out)
                .await
                .unwrap_or_else(|e| {
                    tracing::warn!(provider = %self.provider, model, error = %e, "pricing lookup failed");
                    0.0
                }),
            None => 0.0,
        };

        if priced > 0.0 {
            return priced;
        }
        self.fallback.token_cost(model, tokens_in, tokens_out)
    }

    pub async fn image_cost(&self, model: &str) -> f64 {
        let priced = match &self.pricing {
            Some(pricing) => pricing
                .calculate_image_cost(&self.provider, model)
                .await
                .unwrap_or_else(|e| {
                    tracing::warn!(provider = %self.provider, model, error = %e, "pricing lookup failed");
                    0.0
                }),
            None => 0.0,
        };

        if priced > 0.0 {
            return priced;
        }
        self.fallback.image_cost(model)
    }
}
