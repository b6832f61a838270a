//! Error types for quota and pool operations

use std::time::Duration;

/// Errors from limiter and pool operations.
///
/// All of these are local, recoverable conditions. Callers translate them
/// into a structured "try again later" response rather than a fault.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(
        "pool exhausted: {exhausted} exhausted, {suspended} suspended of {total} credentials"
    )]
    PoolExhausted {
        /// Time until some capacity returns. `None` when nothing will come
        /// back on its own (every credential suspended, or an empty pool).
        retry_after: Option<Duration>,
        total: usize,
        exhausted: usize,
        suspended: usize,
    },

    #[error("provider rejected credential {credential_id}: {message}")]
    ProviderAuthFailure {
        credential_id: String,
        message: String,
    },

    #[error("rate limiter unavailable: {0}")]
    LimiterUnavailable(String),

    #[error("provider call failed: {0}")]
    Upstream(String),

    #[error("credential not found: {0}")]
    NotFound(String),

    #[error("credential already exists: {0}")]
    Duplicate(String),

    #[error("invalid limits: {0}")]
    InvalidLimits(String),
}

impl Error {
    /// Retry hint carried by the error, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::PoolExhausted { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Whether the caller may retry the same operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::PoolExhausted { .. }
                | Error::LimiterUnavailable(_)
                | Error::Upstream(_)
                | Error::ProviderAuthFailure { .. }
        )
    }
}

/// Result alias for quota operations.
pub type Result<T> = std::result::Result<T, Error>;
