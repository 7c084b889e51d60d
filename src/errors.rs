use thiserror::Error;
use uuid::Uuid;

use crate::job::{JobKind, JobStatus};

// Use anyhow::Result for configuration loading and other internal plumbing
// Use thiserror for well-typed errors that callers need to match on

/// Application-specific errors that need special handling
#[derive(Error, Debug)]
pub enum AppError {
    #[error("job not found: {0}")]
    JobNotFound(Uuid),

    #[error("provider not found: {0}")]
    ProviderNotFound(String),

    #[error("provider not available: {0}")]
    ProviderNotAvailable(String),

    #[error("no provider available")]
    NoProviderAvailable,

    /// Backend failure. Displays as the bare message so a failed job carries
    /// exactly what the backend reported.
    #[error("{message}")]
    ProviderError {
        status: u16,
        message: String,
    },

    #[error("provider {provider} does not support {kind} jobs")]
    UnsupportedJobKind {
        provider: String,
        kind: JobKind,
    },

    #[error("cannot {action} a job in status {from}")]
    InvalidTransition {
        from: JobStatus,
        action: &'static str,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("storage error: {0}")]
    StorageError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Request validation failed: {0}")]
    ValidationError(String),

    #[error("Internal server error: {0}")]
    InternalServerError(String),
}

impl AppError {
    pub fn provider_not_found(name: impl Into<String>) -> Self {
        Self::ProviderNotFound(name.into())
    }

    pub fn provider_not_available(name: impl Into<String>) -> Self {
        Self::ProviderNotAvailable(name.into())
    }

    pub fn provider_error(status: u16, message: impl Into<String>) -> Self {
        Self::ProviderError {
            status,
            message: message.into(),
        }
    }

    pub fn unsupported_kind(provider: impl Into<String>, kind: JobKind) -> Self {
        Self::UnsupportedJobKind {
            provider: provider.into(),
            kind,
        }
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::StorageError(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::InternalServerError(msg.into())
    }

    /// Whether the error is a lookup miss rather than a failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::JobNotFound(_) | Self::ProviderNotFound(_))
    }
}

/// Convert from anyhow::Error to AppError for error context
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        // Log the full error chain for debugging
        tracing::error!("Application error: {:?}", err);
        AppError::InternalServerError(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        let status = err.status().map(|s| s.as_u16()).unwrap_or(502);
        AppError::ProviderError {
            status,
            message: err.to_string(),
        }
    }
}

/// Helper type for results that use AppError
pub type AppResult<T> = Result<T, AppError>;
