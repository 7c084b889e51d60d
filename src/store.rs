//! Persistence ports used by the job service, plus in-memory adapters.
//!
//! Durable (SQL) implementations live outside this crate; the in-memory
//! stores back the binary and the test suite.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{
    errors::{AppError, AppResult},
    job::{Job, JobStatus, ProviderUsageSummary, Usage},
    pricing::ProviderPricing,
};

/// Tenant-scoped job persistence
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, job: &Job) -> AppResult<()>;

    /// Unscoped lookup used by the orchestration path.
    async fn get(&self, id: Uuid) -> AppResult<Job>;

    /// Lookup that only succeeds when the job belongs to `tenant_id`.
    async fn get_for_tenant(&self, tenant_id: Uuid, id: Uuid) -> AppResult<Job>;

    /// Replace a stored job, but only while its stored status is still
    /// `expected`. A job moved on by someone else in the meantime yields
    /// [`AppError::InvalidTransition`] and stays as stored. Unknown ids are
    /// an error.
    async fn update(&self, job: &Job, expected: JobStatus) -> AppResult<()>;

    async fn delete(&self, tenant_id: Uuid, id: Uuid) -> AppResult<()>;

    async fn list_by_tenant(&self, tenant_id: Uuid) -> AppResult<Vec<Job>>;

    async fn count_by_tenant(&self, tenant_id: Uuid) -> AppResult<u64>;
}

/// Append-only usage accounting
#[async_trait]
pub trait UsageStore: Send + Sync {
    async fn create(&self, usage: &Usage) -> AppResult<()>;

    async fn list_by_job(&self, job_id: Uuid) -> AppResult<Vec<Usage>>;

    async fn list_by_tenant(&self, tenant_id: Uuid) -> AppResult<Vec<Usage>>;

    async fn summary_by_provider(&self, tenant_id: Uuid) -> AppResult<Vec<ProviderUsageSummary>>;
}

/// Pricing table persistence
#[async_trait]
pub trait PricingStore: Send + Sync {
    async fn create(&self, pricing: &ProviderPricing) -> AppResult<()>;

    async fn update(&self, pricing: &ProviderPricing) -> AppResult<()>;

    async fn delete(&self, id: Uuid) -> AppResult<()>;

    async fn get(&self, id: Uuid) -> AppResult<Option<ProviderPricing>>;

    async fn list(&self) -> AppResult<Vec<ProviderPricing>>;

    async fn find(&self, provider: &str, model: &str) -> AppResult<Option<ProviderPricing>>;

    async fn find_default(&self, provider: &str) -> AppResult<Option<ProviderPricing>>;
}

#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<Uuid, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, job: &Job) -> AppResult<()> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(AppError::storage(format!("job {} already exists", job.id)));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> AppResult<Job> {
        self.jobs
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(AppError::JobNotFound(id))
    }

    async fn get_for_tenant(&self, tenant_id: Uuid, id: Uuid) -> AppResult<Job> {
        self.jobs
            .read()
            .await
            .get(&id)
            .filter(|job| job.tenant_id == tenant_id)
            .cloned()
            .ok_or(AppError::JobNotFound(id))
    }

    async fn update(&self, job: &Job, expected: JobStatus) -> AppResult<()> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(&job.id) {
            Some(slot) if slot.status == expected => {
                *slot = job.clone();
                Ok(())
            }
            Some(slot) => Err(AppError::InvalidTransition {
                from: slot.status,
                action: "update",
            }),
            None => Err(AppError::JobNotFound(job.id)),
        }
    }

    async fn delete(&self, tenant_id: Uuid, id: Uuid) -> AppResult<()> {
        let mut jobs = self.jobs.write().await;
        match jobs.get(&id) {
            Some(job) if job.tenant_id == tenant_id => {
                jobs.remove(&id);
                Ok(())
            }
            _ => Err(AppError::JobNotFound(id)),
        }
    }

    async fn list_by_tenant(&self, tenant_id: Uuid) -> AppResult<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|job| job.tenant_id == tenant_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }

    async fn count_by_tenant(&self, tenant_id: Uuid) -> AppResult<u64> {
        Ok(self
            .jobs
            .read()
            .await
            .values()
            .filter(|job| job.tenant_id == tenant_id)
            .count() as u64)
    }
}

#[derive(Default)]
pub struct InMemoryUsageStore {
    rows: RwLock<Vec<Usage>>,
}

impl InMemoryUsageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UsageStore for InMemoryUsageStore {
    async fn create(&self, usage: &Usage) -> AppResult<()> {
        self.rows.write().await.push(usage.clone());
        Ok(())
    }

    async fn list_by_job(&self, job_id: Uuid) -> AppResult<Vec<Usage>> {
        Ok(self
            .rows
            .read()
            .await
            .iter()
            .filter(|u| u.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn list_by_tenant(&self, tenant_id: Uuid) -> AppResult<Vec<Usage>> {
        Ok(self
            .rows
            .read()
            .await
            .iter()
            .filter(|u| u.tenant_id == tenant_id)
            .cloned()
            .collect())
    }

    async fn summary_by_provider(&self, tenant_id: Uuid) -> AppResult<Vec<ProviderUsageSummary>> {
        let rows = self.rows.read().await;
        let mut by_provider: HashMap<&str, ProviderUsageSummary> = HashMap::new();

        for usage in rows.iter().filter(|u| u.tenant_id == tenant_id) {
            let entry = by_provider
                .entry(usage.provider.as_str())
                .or_insert_with(|| ProviderUsageSummary {
                    provider: usage.provider.clone(),
                    ..Default::default()
                });
            entry.jobs += 1;
            entry.tokens_in += u64::from(usage.tokens_in);
            entry.tokens_out += u64::from(usage.tokens_out);
            entry.cost += usage.cost;
        }

        let mut summary: Vec<ProviderUsageSummary> = by_provider.into_values().collect();
        summary.sort_by(|a, b| a.provider.cmp(&b.provider));
        Ok(summary)
    }
}

#[derive(Default)]
pub struct InMemoryPricingStore {
    rows: RwLock<HashMap<Uuid, ProviderPricing>>,
}

impl InMemoryPricingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PricingStore for InMemoryPricingStore {
    async fn create(&self, pricing: &ProviderPricing) -> AppResult<()> {
        self.rows.write().await.insert(pricing.id, pricing.clone());
        Ok(())
    }

    async fn update(&self, pricing: &ProviderPricing) -> AppResult<()> {
        let mut rows = self.rows.write().await;
        match rows.get_mut(&pricing.id) {
            Some(slot) => {
                *slot = pricing.clone();
                Ok(())
            }
            None => Err(AppError::storage(format!("pricing {} not found", pricing.id))),
        }
    }

    async fn delete(&self, id: Uuid) -> AppResult<()> {
        self.rows
            .write()
            .await
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| AppError::storage(format!("pricing {} not found", id)))
    }

    async fn get(&self, id: Uuid) -> AppResult<Option<ProviderPricing>> {
        Ok(self.rows.read().await.get(&id).cloned())
    }

    async fn list(&self) -> AppResult<Vec<ProviderPricing>> {
        let mut rows: Vec<ProviderPricing> = self.rows.read().await.values().cloned().collect();
        rows.sort_by(|a, b| (&a.provider, &a.model).cmp(&(&b.provider, &b.model)));
        Ok(rows)
    }

    async fn find(&self, provider: &str, model: &str) -> AppResult<Option<ProviderPricing>> {
        Ok(self
            .rows
            .read()
            .await
            .values()
            .find(|p| p.provider == provider && p.model == model)
            .cloned())
    }

    async fn find_default(&self, provider: &str) -> AppResult<Option<ProviderPricing>> {
        Ok(self
            .rows
            .read()
            .await
            .values()
            .find(|p| p.provider == provider && p.is_default)
            .cloned())
    }
}
