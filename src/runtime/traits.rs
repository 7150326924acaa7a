//! Trait abstractions for orchestrator storage
//!
//! These traits let the orchestrator and its components run against the real
//! database or the in-memory mocks in `testing`.

use crate::db::{Citation, DailyBudget, Database, DbError, MessageRecord, RecordFailure, ThreadMapping};
use async_trait::async_trait;
use chrono::NaiveDate;
use std::sync::Arc;

/// Caller → upstream thread mapping
#[async_trait]
pub trait ThreadMapStore: Send + Sync {
    async fn get_thread(&self, caller_id: &str) -> Result<Option<ThreadMapping>, String>;

    /// Insert or replace the caller's mapping
    async fn put_thread(&self, caller_id: &str, thread_id: &str) -> Result<ThreadMapping, String>;
}

/// Message records read by the UI
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn insert_record(&self, record: &MessageRecord) -> Result<MessageRecord, String>;

    async fn get_record(&self, message_id: &str) -> Result<Option<MessageRecord>, String>;

    async fn list_records(&self, caller_id: &str) -> Result<Vec<MessageRecord>, String>;

    /// `pending` → `streaming`; false if the record is not pending
    async fn mark_streaming(&self, message_id: &str, conversation_id: &str) -> Result<bool, String>;

    /// Append to a streaming record's text; false if the record is not streaming
    async fn append_text(&self, message_id: &str, appended: &str) -> Result<bool, String>;

    /// Final transition to `complete`; false if the record was already terminal
    async fn complete_record(
        &self,
        message_id: &str,
        text: &str,
        citations: &[Citation],
        token_in: u64,
        token_out: u64,
    ) -> Result<bool, String>;

    /// Final transition to `failed`; false if the record was already terminal
    async fn fail_record(
        &self,
        message_id: &str,
        failure: &RecordFailure,
        token_in: u64,
        token_out: u64,
    ) -> Result<bool, String>;
}

/// Daily output-token consumption
#[async_trait]
pub trait BudgetStore: Send + Sync {
    async fn get_budget(&self, caller_id: &str) -> Result<Option<DailyBudget>, String>;

    /// Atomically add `amount` to today's consumption, starting over if the
    /// stored date is not `today`. Returns the new total.
    async fn add_consumed(&self, caller_id: &str, today: NaiveDate, amount: u64)
        -> Result<u64, String>;
}

/// Combined storage trait for convenience
pub trait Storage: ThreadMapStore + RecordStore + BudgetStore {}
impl<T: ThreadMapStore + RecordStore + BudgetStore> Storage for T {}

// ============================================================================
// Arc implementations for trait objects
// ============================================================================

#[async_trait]
impl<T: ThreadMapStore + ?Sized> ThreadMapStore for Arc<T> {
    async fn get_thread(&self, caller_id: &str) -> Result<Option<ThreadMapping>, String> {
        (**self).get_thread(caller_id).await
    }

    async fn put_thread(&self, caller_id: &str, thread_id: &str) -> Result<ThreadMapping, String> {
        (**self).put_thread(caller_id, thread_id).await
    }
}

#[async_trait]
impl<T: RecordStore + ?Sized> RecordStore for Arc<T> {
    async fn insert_record(&self, record: &MessageRecord) -> Result<MessageRecord, String> {
        (**self).insert_record(record).await
    }

    async fn get_record(&self, message_id: &str) -> Result<Option<MessageRecord>, String> {
        (**self).get_record(message_id).await
    }

    async fn list_records(&self, caller_id: &str) -> Result<Vec<MessageRecord>, String> {
        (**self).list_records(caller_id).await
    }

    async fn mark_streaming(&self, message_id: &str, conversation_id: &str) -> Result<bool, String> {
        (**self).mark_streaming(message_id, conversation_id).await
    }

    async fn append_text(&self, message_id: &str, appended: &str) -> Result<bool, String> {
        (**self).append_text(message_id, appended).await
    }

    async fn complete_record(
        &self,
        message_id: &str,
        text: &str,
        citations: &[Citation],
        token_in: u64,
        token_out: u64,
    ) -> Result<bool, String> {
        (**self)
            .complete_record(message_id, text, citations, token_in, token_out)
            .await
    }

    async fn fail_record(
        &self,
        message_id: &str,
        failure: &RecordFailure,
        token_in: u64,
        token_out: u64,
    ) -> Result<bool, String> {
        (**self)
            .fail_record(message_id, failure, token_in, token_out)
            .await
    }
}

#[async_trait]
impl<T: BudgetStore + ?Sized> BudgetStore for Arc<T> {
    async fn get_budget(&self, caller_id: &str) -> Result<Option<DailyBudget>, String> {
        (**self).get_budget(caller_id).await
    }

    async fn add_consumed(
        &self,
        caller_id: &str,
        today: NaiveDate,
        amount: u64,
    ) -> Result<u64, String> {
        (**self).add_consumed(caller_id, today, amount).await
    }
}

// ============================================================================
// Production Adapter
// ============================================================================

/// Adapter to use Database as Storage
#[derive(Clone)]
pub struct DatabaseStorage {
    db: Database,
}

impl DatabaseStorage {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ThreadMapStore for DatabaseStorage {
    async fn get_thread(&self, caller_id: &str) -> Result<Option<ThreadMapping>, String> {
        self.db.get_thread(caller_id).map_err(|e| e.to_string())
    }

    async fn put_thread(&self, caller_id: &str, thread_id: &str) -> Result<ThreadMapping, String> {
        self.db
            .put_thread(caller_id, thread_id)
            .map_err(|e| e.to_string())
    }
}

#[async_trait]
impl RecordStore for DatabaseStorage {
    async fn insert_record(&self, record: &MessageRecord) -> Result<MessageRecord, String> {
        self.db.insert_record(record).map_err(|e| e.to_string())
    }

    async fn get_record(&self, message_id: &str) -> Result<Option<MessageRecord>, String> {
        match self.db.get_record(message_id) {
            Ok(record) => Ok(Some(record)),
            Err(DbError::RecordNotFound(_)) => Ok(None),
            Err(e) => Err(e.to_string()),
        }
    }

    async fn list_records(&self, caller_id: &str) -> Result<Vec<MessageRecord>, String> {
        self.db.list_records(caller_id).map_err(|e| e.to_string())
    }

    async fn mark_streaming(&self, message_id: &str, conversation_id: &str) -> Result<bool, String> {
        self.db
            .mark_streaming(message_id, conversation_id)
            .map_err(|e| e.to_string())
    }

    async fn append_text(&self, message_id: &str, appended: &str) -> Result<bool, String> {
        self.db
            .append_text(message_id, appended)
            .map_err(|e| e.to_string())
    }

    async fn complete_record(
        &self,
        message_id: &str,
        text: &str,
        citations: &[Citation],
        token_in: u64,
        token_out: u64,
    ) -> Result<bool, String> {
        self.db
            .complete_record(message_id, text, citations, token_in, token_out)
            .map_err(|e| e.to_string())
    }

    async fn fail_record(
        &self,
        message_id: &str,
        failure: &RecordFailure,
        token_in: u64,
        token_out: u64,
    ) -> Result<bool, String> {
        self.db
            .fail_record(message_id, failure, token_in, token_out)
            .map_err(|e| e.to_string())
    }
}

#[async_trait]
impl BudgetStore for DatabaseStorage {
    async fn get_budget(&self, caller_id: &str) -> Result<Option<DailyBudget>, String> {
        self.db.get_budget(caller_id).map_err(|e| e.to_string())
    }

    async fn add_consumed(
        &self,
        caller_id: &str,
        today: NaiveDate,
        amount: u64,
    ) -> Result<u64, String> {
        self.db
            .add_consumed(caller_id, today, amount)
            .map_err(|e| e.to_string())
    }
}
