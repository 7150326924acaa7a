//! Common types for upstream assistant interactions

use serde::{Deserialize, Serialize};

/// Handle of a conversation thread on the provider side
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThreadHandle(pub String);

impl ThreadHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ThreadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Request to start a generation run on a thread
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    /// Extra instructions appended for this run only (tone etc.)
    pub additional_instructions: Option<String>,
    /// Upper bound on generated tokens for this run
    pub max_output_tokens: Option<u32>,
}

/// Upstream run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    InProgress,
    Completed,
    Failed,
    Cancelling,
    Cancelled,
    Expired,
    Incomplete,
    RequiresAction,
}

impl RunStatus {
    /// Status values after which the provider will not produce more output
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Expired | Self::Incomplete
        )
    }
}

/// Token usage reported for a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// One observation of a run.
///
/// `output` is the assistant text produced so far (cumulative, not a delta).
#[derive(Debug, Clone, PartialEq)]
pub struct RunSnapshot {
    pub status: RunStatus,
    pub output: String,
    pub usage: Option<RunUsage>,
    pub failure: Option<String>,
}

#[cfg(test)]
impl RunSnapshot {
    pub fn in_progress(output: impl Into<String>) -> Self {
        Self {
            status: RunStatus::InProgress,
            output: output.into(),
            usage: None,
            failure: None,
        }
    }

    pub fn completed(output: impl Into<String>, usage: RunUsage) -> Self {
        Self {
            status: RunStatus::Completed,
            output: output.into(),
            usage: Some(usage),
            failure: None,
        }
    }

    pub fn failed(output: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Failed,
            output: output.into(),
            usage: None,
            failure: Some(reason.into()),
        }
    }
}
