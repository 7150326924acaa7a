//! Progressive and final record publishing
//!
//! Writes go to the record store first, then fan out to live subscribers. A
//! record accepts appends only while streaming and exactly one terminal write.

use crate::db::{Citation, MessageRecord, RecordFailure};
use crate::error::OrchestratorError;
use crate::runtime::RecordStore;
use serde::Serialize;
use tokio::sync::broadcast;

/// Capacity of the live event channel; slow subscribers lag rather than block writers
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events pushed to live subscribers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PublishedEvent {
    Partial {
        caller_id: String,
        message_id: String,
        appended: String,
    },
    Final {
        caller_id: String,
        record: MessageRecord,
        limit_remaining: u64,
    },
    Failed {
        caller_id: String,
        message_id: String,
        failure: RecordFailure,
        limit_remaining: u64,
    },
}

impl PublishedEvent {
    pub fn caller_id(&self) -> &str {
        match self {
            PublishedEvent::Partial { caller_id, .. }
            | PublishedEvent::Final { caller_id, .. }
            | PublishedEvent::Failed { caller_id, .. } => caller_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            PublishedEvent::Partial { .. } => "partial",
            PublishedEvent::Final { .. } => "final",
            PublishedEvent::Failed { .. } => "failed",
        }
    }
}

/// Returned once a reply is final
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompletionSummary {
    pub message_id: String,
    pub conversation_id: Option<String>,
    pub token_in: u64,
    pub token_out: u64,
    pub citation_count: usize,
    pub limit_remaining: u64,
}

pub struct ConversationPublisher<S: RecordStore> {
    store: S,
    events: broadcast::Sender<PublishedEvent>,
}

impl<S: RecordStore> ConversationPublisher<S> {
    pub fn new(store: S) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { store, events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PublishedEvent> {
        self.events.subscribe()
    }

    /// Append streamed text. Appends to a record that is no longer streaming are dropped.
    pub async fn publish_partial(
        &self,
        caller_id: &str,
        message_id: &str,
        appended: &str,
    ) -> Result<(), OrchestratorError> {
        let applied = self
            .store
            .append_text(message_id, appended)
            .await
            .map_err(OrchestratorError::Storage)?;
        if !applied {
            tracing::warn!(message_id, "Dropping partial for record that is not streaming");
            return Ok(());
        }
        self.broadcast(PublishedEvent::Partial {
            caller_id: caller_id.to_string(),
            message_id: message_id.to_string(),
            appended: appended.to_string(),
        });
        Ok(())
    }

    /// The single transition into `complete`
    #[allow(clippy::too_many_arguments)]
    pub async fn publish_final(
        &self,
        caller_id: &str,
        message_id: &str,
        clean_text: &str,
        citations: &[Citation],
        token_in: u64,
        token_out: u64,
        limit_remaining: u64,
    ) -> Result<CompletionSummary, OrchestratorError> {
        let applied = self
            .store
            .complete_record(message_id, clean_text, citations, token_in, token_out)
            .await
            .map_err(OrchestratorError::Storage)?;
        if !applied {
            return Err(OrchestratorError::RecordFinalized(message_id.to_string()));
        }

        let record = self.load(message_id).await?;
        tracing::info!(
            message_id,
            caller_id,
            token_in,
            token_out,
            citations = citations.len(),
            "Reply complete"
        );

        let summary = CompletionSummary {
            message_id: message_id.to_string(),
            conversation_id: record.conversation_id.clone(),
            token_in,
            token_out,
            citation_count: citations.len(),
            limit_remaining,
        };
        self.broadcast(PublishedEvent::Final {
            caller_id: caller_id.to_string(),
            record,
            limit_remaining,
        });
        Ok(summary)
    }

    /// The single transition into `failed`; streamed text is kept for diagnostics
    pub async fn publish_failed(
        &self,
        caller_id: &str,
        message_id: &str,
        failure: &RecordFailure,
        token_in: u64,
        token_out: u64,
        limit_remaining: u64,
    ) -> Result<(), OrchestratorError> {
        let applied = self
            .store
            .fail_record(message_id, failure, token_in, token_out)
            .await
            .map_err(OrchestratorError::Storage)?;
        if !applied {
            return Err(OrchestratorError::RecordFinalized(message_id.to_string()));
        }

        tracing::info!(
            message_id,
            caller_id,
            kind = ?failure.kind,
            reason = %failure.message,
            "Reply failed"
        );
        self.broadcast(PublishedEvent::Failed {
            caller_id: caller_id.to_string(),
            message_id: message_id.to_string(),
            failure: failure.clone(),
            limit_remaining,
        });
        Ok(())
    }

    async fn load(&self, message_id: &str) -> Result<MessageRecord, OrchestratorError> {
        self.store
            .get_record(message_id)
            .await
            .map_err(OrchestratorError::Storage)?
            .ok_or_else(|| OrchestratorError::NotFound(message_id.to_string()))
    }

    fn broadcast(&self, event: PublishedEvent) {
        // No subscribers is fine; the record store is the source of truth
        let _ = self.events.send(event);
    }
}
