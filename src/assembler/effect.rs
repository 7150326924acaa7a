//! Effects produced by assembly transitions

use crate::db::RecordFailure;
use crate::provider::RunUsage;

/// Effects to be executed by the driver after a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Attach the user's text to the thread
    AppendMessage,

    /// Create a generation run
    StartRun,

    /// Poll the run after the configured interval
    SchedulePoll,

    /// Ask the provider to stop the run (best-effort)
    CancelRun { run_id: String },

    /// Hand an update to the consumer
    Emit(AssemblyUpdate),
}

/// What the consumer of an assembly observes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssemblyUpdate {
    /// Newly arrived text, to be appended to what came before
    Partial { appended: String },

    /// Run finished; `text` is the concatenation of every partial
    Final {
        text: String,
        token_in: u64,
        token_out: u64,
    },

    /// Run could not complete
    Failed {
        failure: RecordFailure,
        partial: String,
        usage: RunUsage,
    },

    /// Caller aborted; `token_out` is the reported usage, or an estimate from `partial`
    Cancelled { partial: String, token_out: u64 },
}

impl AssemblyUpdate {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, AssemblyUpdate::Partial { .. })
    }
}
