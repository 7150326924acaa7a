//! API request and response types

use crate::db::MessageRecord;
use crate::runtime::Tone;
use serde::{Deserialize, Serialize};

/// Request to send a chat message
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub tone: Option<Tone>,
}

/// Response for cancel action
#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub cancelled: usize,
}

/// Response for thread reset
#[derive(Debug, Serialize)]
pub struct ResetResponse {
    pub conversation_id: String,
}

/// A single record plus the caller's remaining budget
#[derive(Debug, Serialize)]
pub struct RecordResponse {
    pub record: MessageRecord,
    pub limit_remaining: u64,
}

/// Response with a caller's history
#[derive(Debug, Serialize)]
pub struct RecordListResponse {
    pub records: Vec<MessageRecord>,
    pub limit_remaining: u64,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            retry_after_secs: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_request_tone_is_optional() {
        let req: ChatRequest = serde_json::from_str(r#"{"message":"hi"}"#).unwrap();
        assert_eq!(req.message, "hi");
        assert_eq!(req.tone, None);

        let req: ChatRequest =
            serde_json::from_str(r#"{"message":"hi","tone":"gentle"}"#).unwrap();
        assert_eq!(req.tone, Some(Tone::Gentle));

        assert!(serde_json::from_str::<ChatRequest>(r#"{"message":"hi","tone":"harsh"}"#).is_err());
    }
}
