//! Deterministic in-process provider for tests and offline runs.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::{
    errors::{AppError, AppResult},
    job::{Job, JobKind},
    providers::{AIProvider, ProviderResult, estimate_tokens},
};

/// Provider double with fixed answers and call counters
///
/// Implements only the minimum contract: no streaming and no model listing.
pub struct StubProvider {
    name: String,
    response: Option<String>,
    failure: Option<String>,
    available: AtomicBool,
    delay: Option<Duration>,
    execute_calls: AtomicUsize,
    availability_checks: AtomicUsize,
}

impl StubProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            response: None,
            failure: None,
            available: AtomicBool::new(true),
            delay: None,
            execute_calls: AtomicUsize::new(0),
            availability_checks: AtomicUsize::new(0),
        }
    }

    /// Answer every text job with `response`.
    pub fn with_response(mut self, response: impl Into<String>) -> Self {
        self.response = Some(response.into());
        self
    }

    /// Fail every execution with `message`, as a rate-limited backend would.
    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }

    pub fn unavailable(self) -> Self {
        self.available.store(false, Ordering::SeqCst);
        self
    }

    /// Sleep this long inside every execution.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn execute_calls(&self) -> usize {
        self.execute_calls.load(Ordering::SeqCst)
    }

    pub fn availability_checks(&self) -> usize {
        self.availability_checks.load(Ordering::SeqCst)
    }

    fn answer(&self, job: &Job) -> String {
        match job.kind {
            JobKind::Text => self
                .response
                .clone()
                .unwrap_or_else(|| format!("stub response to: {}", job.input)),
            JobKind::Image => format!("stub://images/{}.png", job.id),
        }
    }
}

#[async_trait]
impl AIProvider for StubProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn provider_type(&self) -> &str {
        "stub"
    }

    fn supports(&self, kind: JobKind) -> bool {
        matches!(kind, JobKind::Text | JobKind::Image)
    }

    async fn is_available(&self) -> bool {
        self.availability_checks.fetch_add(1, Ordering::SeqCst);
        self.available.load(Ordering::SeqCst)
    }

    async fn execute(&self, job: &Job) -> AppResult<ProviderResult> {
        self.execute_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(message) = &self.failure {
            return Err(AppError::provider_error(429, message.clone()));
        }

        let content = self.answer(job);
        Ok(ProviderResult {
            tokens_in: estimate_tokens(job.input.len()),
            tokens_out: estimate_tokens(content.len()),
            content,
            model: "stub-model".to_string(),
            cost: 0.0,
        })
    }
}
