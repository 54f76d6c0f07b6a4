//! Error types for Quotaward.

use thiserror::Error;

/// Main error type for Quotaward operations.
///
/// Most of these never escape the public core: persistence and preference
/// failures are logged and absorbed. They exist so the internal steps can
/// use `?` and so callers of the lower-level helpers can tell failures apart.
#[derive(Error, Debug)]
pub enum QuotawardError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Snapshot document present but structurally unusable
    #[error("Snapshot error: {0}")]
    Snapshot(String),

    /// Quota-status collaborator unreachable or returned garbage
    #[error("Quota status unavailable: {0}")]
    QuotaStatus(String),

    /// The provider rejected a request for exceeding its rate limit.
    /// `retry_after` is its hint in seconds, when one was sent.
    #[error("Rate limited by provider (retry after: {retry_after:?})")]
    RateLimited { retry_after: Option<i64> },

    /// A poll cycle's task failed
    #[error("Poll task failed: {0}")]
    Task(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<config::ConfigError> for QuotawardError {
    fn from(e: config::ConfigError) -> Self {
        QuotawardError::Config(e.to_string())
    }
}

/// Result type alias for Quotaward operations.
pub type Result<T> = std::result::Result<T, QuotawardError>;
