//! Error taxonomy of the orchestration layer

use crate::provider::ProviderError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OrchestratorError {
    #[error("Rate limit exceeded, retry in {}s", retry_after.as_secs().max(1))]
    RateLimited { retry_after: Duration },

    #[error("Daily token budget exceeded ({remaining} tokens remaining)")]
    BudgetExceeded { remaining: u64 },

    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Upstream run failed: {0}")]
    UpstreamRunFailed(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Record {0} is already final")]
    RecordFinalized(String),
}

/// Unreachable providers are retryable; a refused request (auth, config,
/// malformed input) is a run failure and is not retried
impl From<ProviderError> for OrchestratorError {
    fn from(e: ProviderError) -> Self {
        if e.kind.is_retryable() {
            Self::UpstreamUnavailable(e.message)
        } else {
            Self::UpstreamRunFailed(e.message)
        }
    }
}
