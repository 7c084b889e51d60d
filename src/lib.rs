pub mod config;
pub mod errors;
pub mod job;
pub mod notify;
pub mod pricing;
pub mod providers;
pub mod service;
pub mod store;

// Re-export commonly used types for easier access
pub use config::{Config, load_config, load_config_from};
pub use errors::{AppError, AppResult};
pub use job::{Job, JobKind, JobStatus, Usage};
pub use notify::{JobEventPublisher, NotificationSink};
pub use pricing::{PricingService, ProviderPricing};
pub use providers::{AIProvider, ModelLister, ProviderRegistry, StreamingProvider};
pub use service::JobService;
