//! Database schema and types

pub use crate::text::Citation;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// SQL schema for initialization
pub const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS threads (
    caller_id TEXT PRIMARY KEY,
    thread_id TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS message_records (
    sequence_id INTEGER PRIMARY KEY AUTOINCREMENT,
    message_id TEXT NOT NULL UNIQUE,
    caller_id TEXT NOT NULL,
    conversation_id TEXT,
    role TEXT NOT NULL,
    text TEXT NOT NULL DEFAULT '',
    citations TEXT NOT NULL DEFAULT '[]',
    token_in INTEGER NOT NULL DEFAULT 0,
    token_out INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    failure TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_records_caller ON message_records(caller_id, sequence_id);

CREATE TABLE IF NOT EXISTS daily_budgets (
    caller_id TEXT PRIMARY KEY,
    date_utc TEXT NOT NULL,
    output_tokens_consumed INTEGER NOT NULL DEFAULT 0
);
";

/// Marks records orphaned by a crash as failed
pub const MIGRATION_FAIL_INTERRUPTED: &str = r#"
UPDATE message_records
SET status = 'failed',
    failure = '{"kind":"interrupted","message":"Interrupted by server restart"}'
WHERE status IN ('pending', 'streaming')
"#;

/// Caller → upstream thread mapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadMapping {
    pub caller_id: String,
    pub thread_id: String,
    pub created_at: DateTime<Utc>,
}

/// Author of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            _ => Err(format!("Unknown role: {s}")),
        }
    }
}

/// Lifecycle of a message record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Pending,
    Streaming,
    Complete,
    Failed,
}

impl RecordStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RecordStatus::Complete | RecordStatus::Failed)
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordStatus::Pending => write!(f, "pending"),
            RecordStatus::Streaming => write!(f, "streaming"),
            RecordStatus::Complete => write!(f, "complete"),
            RecordStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for RecordStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RecordStatus::Pending),
            "streaming" => Ok(RecordStatus::Streaming),
            "complete" => Ok(RecordStatus::Complete),
            "failed" => Ok(RecordStatus::Failed),
            _ => Err(format!("Unknown record status: {s}")),
        }
    }
}

/// Why a record ended up failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    UpstreamUnavailable,
    UpstreamRunFailed,
    Cancelled,
    Interrupted,
    /// Local failure (storage) unrelated to the provider
    Internal,
}

/// Failure details stored on a failed record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl RecordFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(FailureKind::Cancelled, "Cancelled")
    }
}

/// One message of a caller's conversation, as read by the UI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub message_id: String,
    pub sequence_id: i64,
    pub caller_id: String,
    /// Upstream thread this record belongs to, known once the thread is resolved
    pub conversation_id: Option<String>,
    pub role: Role,
    pub text: String,
    pub citations: Vec<Citation>,
    pub token_in: u64,
    pub token_out: u64,
    pub status: RecordStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<RecordFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MessageRecord {
    /// New assistant record awaiting a run
    pub fn pending_assistant(message_id: impl Into<String>, caller_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            message_id: message_id.into(),
            sequence_id: 0,
            caller_id: caller_id.into(),
            conversation_id: None,
            role: Role::Assistant,
            text: String::new(),
            citations: Vec::new(),
            token_in: 0,
            token_out: 0,
            status: RecordStatus::Pending,
            failure: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The caller's own message; complete on creation
    pub fn user(
        message_id: impl Into<String>,
        caller_id: impl Into<String>,
        conversation_id: Option<String>,
        text: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            message_id: message_id.into(),
            sequence_id: 0,
            caller_id: caller_id.into(),
            conversation_id,
            role: Role::User,
            text: text.into(),
            citations: Vec::new(),
            token_in: 0,
            token_out: 0,
            status: RecordStatus::Complete,
            failure: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Daily output-token consumption for a caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyBudget {
    pub date_utc: NaiveDate,
    pub output_tokens_consumed: u64,
}

pub(crate) fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}

pub(crate) fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()
}
