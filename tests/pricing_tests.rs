use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Notify;
use uuid::Uuid;

use ai_aggregator::{
    errors::{AppError, AppResult},
    pricing::{CostCalculator, FallbackRates, PricingService, ProviderPricing},
    store::{InMemoryPricingStore, PricingStore},
};

/// Pricing store that counts lookups reaching it
#[derive(Default)]
struct CountingStore {
    inner: InMemoryPricingStore,
    lookups: AtomicUsize,
}

impl CountingStore {
    fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PricingStore for CountingStore {
    async fn create(&self, pricing: &ProviderPricing) -> AppResult<()> {
        self.inner.create(pricing).await
    }

    async fn update(&self, pricing: &ProviderPricing) -> AppResult<()> {
        self.inner.update(pricing).await
    }

    async fn delete(&self, id: Uuid) -> AppResult<()> {
        self.inner.delete(id).await
    }

    async fn get(&self, id: Uuid) -> AppResult<Option<ProviderPricing>> {
        self.inner.get(id).await
    }

    async fn list(&self) -> AppResult<Vec<ProviderPricing>> {
        self.inner.list().await
    }

    async fn find(&self, provider: &str, model: &str) -> AppResult<Option<ProviderPricing>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.inner.find(provider, model).await
    }

    async fn find_default(&self, provider: &str) -> AppResult<Option<ProviderPricing>> {
        self.inner.find_default(provider).await
    }
}

/// Pricing store whose reads always fail
struct FailingStore;

#[async_trait]
impl PricingStore for FailingStore {
    async fn create(&self, _: &ProviderPricing) -> AppResult<()> {
        Err(AppError::storage("down"))
    }

    async fn update(&self, _: &ProviderPricing) -> AppResult<()> {
        Err(AppError::storage("down"))
    }

    async fn delete(&self, _: Uuid) -> AppResult<()> {
        Err(AppError::storage("down"))
    }

    async fn get(&self, _: Uuid) -> AppResult<Option<ProviderPricing>> {
        Err(AppError::storage("down"))
    }

    async fn list(&self) -> AppResult<Vec<ProviderPricing>> {
        Err(AppError::storage("down"))
    }

    async fn find(&self, _: &str, _: &str) -> AppResult<Option<ProviderPricing>> {
        Err(AppError::storage("down"))
    }

    async fn find_default(&self, _: &str) -> AppResult<Option<ProviderPricing>> {
        Err(AppError::storage("down"))
    }
}

fn service() -> (Arc<CountingStore>, PricingService) {
    let store = Arc::new(CountingStore::default());
    let service = PricingService::new(store.clone() as Arc<dyn PricingStore>);
    (store, service)
}

#[tokio::test]
async fn test_lookup_is_cached_after_first_miss() {
    let (store, pricing) = service();
    pricing
        .create(ProviderPricing::new("openai", "gpt-4o", 2.5, 10.0))
        .await
        .unwrap();

    let first = pricing.get_pricing("openai", "gpt-4o").await.unwrap();
    let second = pricing.get_pricing("openai", "gpt-4o").await.unwrap();

    assert_eq!(first, second);
    assert_eq!(store.lookups(), 1);
    assert_eq!(pricing.cached_entries().await, 1);
}

#[tokio::test]
async fn test_lookup_falls_back_to_default_then_zero() {
    let (_, pricing) = service();
    pricing
        .create(ProviderPricing::new("openai", "gpt-4o", 2.5, 10.0))
        .await
        .unwrap();
    pricing
        .create(ProviderPricing::new("openai", "house", 1.0, 1.0).as_default())
        .await
        .unwrap();

    let exact = pricing.get_pricing("openai", "gpt-4o").await.unwrap();
    assert_eq!(exact.input_price_per_million_tokens, 2.5);

    let default = pricing.get_pricing("openai", "gpt-9").await.unwrap();
    assert_eq!(default.model, "house");
    assert!(default.is_default);

    let zero = pricing.get_pricing("nobody", "x").await.unwrap();
    assert_eq!(zero.id, Uuid::nil());
    assert_eq!(zero.input_price_per_million_tokens, 0.0);
    assert_eq!(zero.output_price_per_million_tokens, 0.0);
}

#[tokio::test]
async fn test_create_invalidates_cached_zero() {
    let (_, pricing) = service();

    let before = pricing.calculate_cost("openai", "gpt-4o", 1_000_000, 0).await.unwrap();
    assert_eq!(before, 0.0);

    pricing
        .create(ProviderPricing::new("openai", "gpt-4o", 2.5, 10.0))
        .await
        .unwrap();
    assert_eq!(pricing.cached_entries().await, 0);

    let after = pricing.calculate_cost("openai", "gpt-4o", 1_000_000, 0).await.unwrap();
    assert!((after - 2.5).abs() < 1e-9);
}

#[tokio::test]
async fn test_update_and_delete_invalidate() {
    let (_, pricing) = service();
    let row = pricing
        .create(ProviderPricing::new("anthropic", "claude", 3.0, 15.0))
        .await
        .unwrap();
    pricing.get_pricing("anthropic", "claude").await.unwrap();

    let mut cheaper = row.clone();
    cheaper.input_price_per_million_tokens = 1.0;
    pricing.update(cheaper).await.unwrap();
    let updated = pricing.get_pricing("anthropic", "claude").await.unwrap();
    assert_eq!(updated.input_price_per_million_tokens, 1.0);
    assert!(updated.updated_at >= row.updated_at);

    pricing.delete(row.id).await.unwrap();
    let gone = pricing.get_pricing("anthropic", "claude").await.unwrap();
    assert_eq!(gone.id, Uuid::nil());
    assert!(pricing.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_single_default_per_provider() {
    let (store, pricing) = service();
    let first = pricing
        .create(ProviderPricing::new("openai", "a", 1.0, 1.0).as_default())
        .await
        .unwrap();
    let second = pricing
        .create(ProviderPricing::new("openai", "b", 2.0, 2.0).as_default())
        .await
        .unwrap();
    pricing
        .create(ProviderPricing::new("anthropic", "c", 3.0, 3.0).as_default())
        .await
        .unwrap();

    let demoted = store.get(first.id).await.unwrap().unwrap();
    assert!(!demoted.is_default);
    assert!(store.get(second.id).await.unwrap().unwrap().is_default);

    let defaults: Vec<_> = pricing
        .list()
        .await
        .unwrap()
        .into_iter()
        .filter(|p| p.is_default)
        .map(|p| p.model)
        .collect();
    assert_eq!(defaults, vec!["c", "b"]);
}

#[tokio::test]
async fn test_invalid_prices_are_rejected() {
    let (_, pricing) = service();
    let err = pricing
        .create(ProviderPricing::new("openai", "gpt-4o", -1.0, 1.0))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::ValidationError(_)));
    assert!(pricing.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_image_cost() {
    let (_, pricing) = service();
    pricing
        .create(ProviderPricing::new("openai", "dall-e-3", 0.0, 0.0).with_image_price(0.08))
        .await
        .unwrap();

    assert_eq!(pricing.calculate_image_cost("openai", "dall-e-3").await.unwrap(), 0.08);
    assert_eq!(pricing.calculate_image_cost("openai", "dall-e-2").await.unwrap(), 0.0);
}

#[tokio::test]
async fn test_cost_calculator_prefers_pricing_service() {
    let (_, pricing) = service();
    pricing
        .create(ProviderPricing::new("openai", "gpt-4o", 1.0, 1.0))
        .await
        .unwrap();
    let calculator = CostCalculator::new("openai", Some(Arc::new(pricing)), FallbackRates::openai());

    let priced = calculator.token_cost("gpt-4o", 1_000_000, 1_000_000).await;
    assert!((priced - 2.0).abs() < 1e-9);

    let fallback = calculator.token_cost("gpt-4o-mini", 1_000_000, 1_000_000).await;
    assert!((fallback - 0.75).abs() < 1e-9);

    assert_eq!(calculator.token_cost("unknown-model", 1_000, 1_000).await, 0.0);
    assert!((calculator.image_cost("dall-e-3").await - 0.04).abs() < 1e-12);
}

#[tokio::test]
async fn test_cost_calculator_survives_store_failure() {
    let pricing = PricingService::new(Arc::new(FailingStore));
    assert!(pricing.get_pricing("anthropic", "claude-3-opus").await.is_err());

    let calculator = CostCalculator::new(
        "anthropic",
        Some(Arc::new(pricing)),
        FallbackRates::anthropic(),
    );
    let cost = calculator.token_cost("claude-3-opus-20240229", 1_000_000, 0).await;
    assert!((cost - 15.0).abs() < 1e-9);
}

/// Pricing store that parks the first exact lookup after it has read its
/// row, until the test releases it.
#[derive(Default)]
struct GatedStore {
    inner: InMemoryPricingStore,
    armed: AtomicBool,
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl PricingStore for GatedStore {
    async fn create(&self, pricing: &ProviderPricing) -> AppResult<()> {
        self.inner.create(pricing).await
    }

    async fn update(&self, pricing: &ProviderPricing) -> AppResult<()> {
        self.inner.update(pricing).await
    }

    async fn delete(&self, id: Uuid) -> AppResult<()> {
        self.inner.delete(id).await
    }

    async fn get(&self, id: Uuid) -> AppResult<Option<ProviderPricing>> {
        self.inner.get(id).await
    }

    async fn list(&self) -> AppResult<Vec<ProviderPricing>> {
        self.inner.list().await
    }

    async fn find(&self, provider: &str, model: &str) -> AppResult<Option<ProviderPricing>> {
        let row = self.inner.find(provider, model).await?;
        if self.armed.swap(false, Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        Ok(row)
    }

    async fn find_default(&self, provider: &str) -> AppResult<Option<ProviderPricing>> {
        self.inner.find_default(provider).await
    }
}

#[tokio::test]
async fn test_lookup_racing_an_update_does_not_cache_stale_price() {
    let store = Arc::new(GatedStore::default());
    let pricing = Arc::new(PricingService::new(store.clone() as Arc<dyn PricingStore>));
    let row = pricing
        .create(ProviderPricing::new("openai", "gpt-4o", 1.0, 1.0))
        .await
        .unwrap();

    store.armed.store(true, Ordering::SeqCst);
    let lookup = {
        let pricing = pricing.clone();
        tokio::spawn(async move { pricing.get_pricing("openai", "gpt-4o").await })
    };
    store.entered.notified().await;

    let mut repriced = row.clone();
    repriced.input_price_per_million_tokens = 2.0;
    pricing.update(repriced).await.unwrap();
    store.release.notify_one();

    let stale = lookup.await.unwrap().unwrap();
    assert_eq!(stale.input_price_per_million_tokens, 1.0);
    assert_eq!(pricing.cached_entries().await, 0);

    let fresh = pricing.get_pricing("openai", "gpt-4o").await.unwrap();
    assert_eq!(fresh.input_price_per_million_tokens, 2.0);
    assert_eq!(pricing.cached_entries().await, 1);
}
