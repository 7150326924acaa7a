//! Assembly state types

use crate::provider::RunUsage;
use serde::Serialize;

/// Where a single run is in the append → run → poll protocol
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssemblyState {
    /// Nothing sent upstream yet
    Created,

    /// User text is attached to the thread
    MessageAppended,

    /// Run exists; no output observed yet
    RunStarted {
        run_id: String,
        /// Consecutive transient poll failures
        poll_failures: u32,
    },

    /// Output is arriving
    InProgress {
        run_id: String,
        /// Everything emitted so far, in order
        text: String,
        usage: Option<RunUsage>,
        poll_failures: u32,
    },

    Completed {
        text: String,
        usage: RunUsage,
    },

    Failed {
        reason: String,
        partial: String,
    },

    Cancelled {
        partial: String,
    },
}

impl AssemblyState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AssemblyState::Completed { .. }
                | AssemblyState::Failed { .. }
                | AssemblyState::Cancelled { .. }
        )
    }

    /// Run id, once the run exists
    pub fn run_id(&self) -> Option<&str> {
        match self {
            AssemblyState::RunStarted { run_id, .. } | AssemblyState::InProgress { run_id, .. } => {
                Some(run_id)
            }
            _ => None,
        }
    }

    /// Text accumulated so far
    pub fn partial_text(&self) -> &str {
        match self {
            AssemblyState::InProgress { text, .. } | AssemblyState::Completed { text, .. } => text,
            AssemblyState::Failed { partial, .. } | AssemblyState::Cancelled { partial } => partial,
            _ => "",
        }
    }

    /// Last usage the provider reported for the run
    pub fn last_usage(&self) -> Option<RunUsage> {
        match self {
            AssemblyState::InProgress { usage, .. } => *usage,
            AssemblyState::Completed { usage, .. } => Some(*usage),
            _ => None,
        }
    }
}
