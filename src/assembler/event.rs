//! Events that drive an assembly

use crate::provider::RunSnapshot;

/// Events that trigger state transitions
#[derive(Debug, Clone)]
pub enum AssemblyEvent {
    /// Kick off the protocol
    Start,
    MessageAppended,
    RunCreated { run_id: String },
    Snapshot(RunSnapshot),
    ProviderFailed(ProviderFailure),

    // Caller/driver events
    CancelRequested,
    TimedOut,
}

/// A failed provider call, reduced to what the transition needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderFailure {
    /// Transient failure (network, 429, 5xx)
    pub retryable: bool,
    pub message: String,
}

impl From<&crate::provider::ProviderError> for ProviderFailure {
    fn from(e: &crate::provider::ProviderError) -> Self {
        Self {
            retryable: e.kind.is_retryable(),
            message: e.message.clone(),
        }
    }
}
