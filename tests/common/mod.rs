#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use ai_aggregator::{
    config::{JobsConfig, ProviderDetail, ProviderType},
    job::{Job, JobStatus},
    notify::NotificationSink,
    providers::{AIProvider, ProviderRegistry},
    service::JobService,
    store::{InMemoryJobStore, InMemoryUsageStore, JobStore, UsageStore},
};

/// Create a test provider configuration pointing at `api_base`
pub fn provider_detail(name: &str, provider_type: ProviderType, api_base: &str) -> ProviderDetail {
    ProviderDetail {
        name: name.to_string(),
        provider_type,
        api_key: "test-api-key-1234567890".to_string(),
        api_base: format!("{}/", api_base.trim_end_matches('/')),
        models: None,
        default_model: None,
        image_model: None,
        timeout_seconds: 5,
        enabled: true,
        fallback_rates: HashMap::new(),
    }
}

/// Sink that keeps every snapshot it is handed
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<Job>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<Job> {
        self.events.lock().unwrap().clone()
    }

    pub fn statuses_for(&self, job: &Job) -> Vec<JobStatus> {
        self.events()
            .into_iter()
            .filter(|e| e.id == job.id)
            .map(|e| e.status)
            .collect()
    }
}

impl NotificationSink for RecordingSink {
    fn publish(&self, job: &Job) {
        self.events.lock().unwrap().push(job.clone());
    }
}

/// A service wired to in-memory stores and a recording sink
pub struct Harness {
    pub service: JobService,
    pub registry: Arc<ProviderRegistry>,
    pub jobs: Arc<InMemoryJobStore>,
    pub usage: Arc<InMemoryUsageStore>,
    pub sink: Arc<RecordingSink>,
}

impl Harness {
    pub async fn new(providers: Vec<Arc<dyn AIProvider>>) -> Self {
        Self::with_config(providers, JobsConfig::default()).await
    }

    pub async fn with_config(providers: Vec<Arc<dyn AIProvider>>, config: JobsConfig) -> Self {
        let registry = Arc::new(ProviderRegistry::new_empty());
        for provider in providers {
            registry.register(provider).await;
        }
        let jobs = Arc::new(InMemoryJobStore::new());
        let usage = Arc::new(InMemoryUsageStore::new());
        let sink = Arc::new(RecordingSink::default());

        let service = JobService::new(
            jobs.clone() as Arc<dyn JobStore>,
            usage.clone() as Arc<dyn UsageStore>,
            registry.clone(),
            sink.clone() as Arc<dyn NotificationSink>,
            &config,
        );

        Self {
            service,
            registry,
            jobs,
            usage,
            sink,
        }
    }
}

/// Frame JSON payloads as an SSE body
pub fn sse_body(events: &[(Option<&str>, String)]) -> String {
    let mut body = String::new();
    for (event, data) in events {
        if let Some(event) = event {
            body.push_str(&format!("event: {}\n", event));
        }
        body.push_str(&format!("data: {}\n\n", data));
    }
    body
}
