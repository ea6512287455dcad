//! Error types for the inbox agent.

use std::time::Duration;

/// Top-level error type for the orchestration core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The persistent store could not be reached. Aborts the current cycle.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(#[from] DatabaseError),

    /// Network failure or timeout on any collaborator.
    #[error("Transient external failure: {0}")]
    Transient(#[from] ExternalError),

    #[error("Rate limit exhausted: {quota} calls per {window:?}")]
    RateLimitExhausted { quota: u32, window: Duration },
}

impl Error {
    /// Whether the next scheduled tick may simply retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::StoreUnavailable(_))
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// Failure of a single call to an external collaborator.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExternalError {
    #[error("{service} call timed out after {timeout:?}")]
    Timeout { service: String, timeout: Duration },

    #[error("{service} request failed: {reason}")]
    RequestFailed { service: String, reason: String },

    #[error("Invalid response from {service}: {reason}")]
    InvalidResponse { service: String, reason: String },
}

impl ExternalError {
    pub fn request(service: &str, reason: impl Into<String>) -> Self {
        Self::RequestFailed {
            service: service.to_string(),
            reason: reason.into(),
        }
    }

    pub fn invalid(service: &str, reason: impl Into<String>) -> Self {
        Self::InvalidResponse {
            service: service.to_string(),
            reason: reason.into(),
        }
    }

    pub fn timeout(service: &str, timeout: Duration) -> Self {
        Self::Timeout {
            service: service.to_string(),
            timeout,
        }
    }
}

/// Which composer step failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComposeStage {
    Caption,
    Generate,
}

impl std::fmt::Display for ComposeStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Caption => "caption",
            Self::Generate => "generate",
        };
        write!(f, "{s}")
    }
}

/// A composer step failed; the message is recorded as failed and never retried.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{stage}: {cause}")]
pub struct ComposeError {
    pub stage: ComposeStage,
    pub cause: ExternalError,
}

/// Run `fut` under `timeout`, mapping elapsed time to [`ExternalError::Timeout`].
pub async fn with_timeout<T, F>(
    service: &str,
    timeout: Duration,
    fut: F,
) -> std::result::Result<T, ExternalError>
where
    F: std::future::Future<Output = std::result::Result<T, ExternalError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(ExternalError::timeout(service, timeout)),
    }
}
