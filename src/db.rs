//! Database module
//!
//! Persists the caller → thread mapping, message records and daily budgets.

mod schema;

pub use schema::*;
use schema::{parse_date, parse_datetime, MIGRATION_FAIL_INTERRUPTED};

use chrono::{NaiveDate, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Record not found: {0}")]
    RecordNotFound(String),
}

pub type DbResult<T> = Result<T, DbError>;

const RECORD_COLUMNS: &str = "sequence_id, message_id, caller_id, conversation_id, role, text, \
     citations, token_in, token_out, status, failure, created_at, updated_at";

/// Thread-safe database handle
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    #[allow(dead_code)] // Used in tests
    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn run_migrations(&self) -> DbResult<()> {
        self.conn().execute_batch(SCHEMA)?;
        Ok(())
    }

    /// Fail every record a previous process left pending or streaming.
    /// Returns the number of records touched.
    pub fn fail_interrupted_records(&self) -> DbResult<usize> {
        let touched = self.conn().execute(MIGRATION_FAIL_INTERRUPTED, [])?;
        Ok(touched)
    }

    // ==================== Thread Mapping ====================

    pub fn get_thread(&self, caller_id: &str) -> DbResult<Option<ThreadMapping>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT caller_id, thread_id, created_at FROM threads WHERE caller_id = ?1",
            params![caller_id],
            |row| {
                Ok(ThreadMapping {
                    caller_id: row.get(0)?,
                    thread_id: row.get(1)?,
                    created_at: parse_datetime(&row.get::<_, String>(2)?),
                })
            },
        )
        .optional()
        .map_err(DbError::from)
    }

    /// Insert or replace the caller's thread mapping
    pub fn put_thread(&self, caller_id: &str, thread_id: &str) -> DbResult<ThreadMapping> {
        let conn = self.conn();
        let now = Utc::now();
        conn.execute(
            "INSERT INTO threads (caller_id, thread_id, created_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(caller_id) DO UPDATE SET thread_id = excluded.thread_id,
                                                  created_at = excluded.created_at",
            params![caller_id, thread_id, now.to_rfc3339()],
        )?;
        Ok(ThreadMapping {
            caller_id: caller_id.to_string(),
            thread_id: thread_id.to_string(),
            created_at: now,
        })
    }

    // ==================== Message Records ====================

    /// Insert a record; returns it with its assigned sequence id
    pub fn insert_record(&self, record: &MessageRecord) -> DbResult<MessageRecord> {
        let conn = self.conn();
        let failure = record
            .failure
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        conn.execute(
            "INSERT INTO message_records (message_id, caller_id, conversation_id, role, text,
                 citations, token_in, token_out, status, failure, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                record.message_id,
                record.caller_id,
                record.conversation_id,
                record.role.to_string(),
                record.text,
                serde_json::to_string(&record.citations)?,
                to_sql_count(record.token_in),
                to_sql_count(record.token_out),
                record.status.to_string(),
                failure,
                record.created_at.to_rfc3339(),
                record.updated_at.to_rfc3339(),
            ],
        )?;

        let mut stored = record.clone();
        stored.sequence_id = conn.last_insert_rowid();
        Ok(stored)
    }

    pub fn get_record(&self, message_id: &str) -> DbResult<MessageRecord> {
        let conn = self.conn();
        let sql = format!("SELECT {RECORD_COLUMNS} FROM message_records WHERE message_id = ?1");
        conn.query_row(&sql, params![message_id], record_from_row)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    DbError::RecordNotFound(message_id.to_string())
                }
                other => DbError::Sqlite(other),
            })
    }

    /// All records of a caller in creation order
    pub fn list_records(&self, caller_id: &str) -> DbResult<Vec<MessageRecord>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM message_records
             WHERE caller_id = ?1 ORDER BY sequence_id ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![caller_id], record_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// pending → streaming, attaching the upstream thread id
    pub fn mark_streaming(&self, message_id: &str, conversation_id: &str) -> DbResult<bool> {
        let conn = self.conn();
        let updated = conn.execute(
            "UPDATE message_records SET status = 'streaming', conversation_id = ?1, updated_at = ?2
             WHERE message_id = ?3 AND status = 'pending'",
            params![conversation_id, Utc::now().to_rfc3339(), message_id],
        )?;
        Ok(updated == 1)
    }

    /// Append to a streaming record's text. No-op once the record left `streaming`.
    pub fn append_text(&self, message_id: &str, appended: &str) -> DbResult<bool> {
        let conn = self.conn();
        let updated = conn.execute(
            "UPDATE message_records SET text = text || ?1, updated_at = ?2
             WHERE message_id = ?3 AND status = 'streaming'",
            params![appended, Utc::now().to_rfc3339(), message_id],
        )?;
        Ok(updated == 1)
    }

    /// Single transition into `complete`. Returns false if the record was already terminal.
    pub fn complete_record(
        &self,
        message_id: &str,
        text: &str,
        citations: &[Citation],
        token_in: u64,
        token_out: u64,
    ) -> DbResult<bool> {
        let conn = self.conn();
        let updated = conn.execute(
            "UPDATE message_records
             SET text = ?1, citations = ?2, token_in = ?3, token_out = ?4,
                 status = 'complete', failure = NULL, updated_at = ?5
             WHERE message_id = ?6 AND status IN ('pending', 'streaming')",
            params![
                text,
                serde_json::to_string(citations)?,
                to_sql_count(token_in),
                to_sql_count(token_out),
                Utc::now().to_rfc3339(),
                message_id,
            ],
        )?;
        Ok(updated == 1)
    }

    /// Transition into `failed`, keeping whatever text was streamed
    pub fn fail_record(
        &self,
        message_id: &str,
        failure: &RecordFailure,
        token_in: u64,
        token_out: u64,
    ) -> DbResult<bool> {
        let conn = self.conn();
        let updated = conn.execute(
            "UPDATE message_records
             SET status = 'failed', failure = ?1, token_in = ?2, token_out = ?3, updated_at = ?4
             WHERE message_id = ?5 AND status IN ('pending', 'streaming')",
            params![
                serde_json::to_string(failure)?,
                to_sql_count(token_in),
                to_sql_count(token_out),
                Utc::now().to_rfc3339(),
                message_id,
            ],
        )?;
        Ok(updated == 1)
    }

    // ==================== Daily Budgets ====================

    pub fn get_budget(&self, caller_id: &str) -> DbResult<Option<DailyBudget>> {
        let conn = self.conn();
        let row: Option<(String, i64)> = conn
            .query_row(
                "SELECT date_utc, output_tokens_consumed FROM daily_budgets WHERE caller_id = ?1",
                params![caller_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        Ok(row.and_then(|(date, consumed)| {
            parse_date(&date).map(|date_utc| DailyBudget {
                date_utc,
                output_tokens_consumed: from_sql_count(consumed),
            })
        }))
    }

    /// Atomically add consumed output tokens for `today`, starting from zero when
    /// the stored row belongs to an earlier day. Returns the new consumption.
    pub fn add_consumed(&self, caller_id: &str, today: NaiveDate, amount: u64) -> DbResult<u64> {
        let conn = self.conn();
        let today = today.format("%Y-%m-%d").to_string();
        conn.execute(
            "INSERT INTO daily_budgets (caller_id, date_utc, output_tokens_consumed)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(caller_id) DO UPDATE SET
                 output_tokens_consumed = CASE
                     WHEN date_utc = excluded.date_utc
                         THEN output_tokens_consumed + excluded.output_tokens_consumed
                     ELSE excluded.output_tokens_consumed
                 END,
                 date_utc = excluded.date_utc",
            params![caller_id, today, to_sql_count(amount)],
        )?;
        let consumed: i64 = conn.query_row(
            "SELECT output_tokens_consumed FROM daily_budgets WHERE caller_id = ?1",
            params![caller_id],
            |row| row.get(0),
        )?;
        Ok(from_sql_count(consumed))
    }
}

fn to_sql_count(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_sql_count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<MessageRecord> {
    let role: String = row.get(4)?;
    let citations: String = row.get(6)?;
    let status: String = row.get(9)?;
    let failure: Option<String> = row.get(10)?;

    Ok(MessageRecord {
        sequence_id: row.get(0)?,
        message_id: row.get(1)?,
        caller_id: row.get(2)?,
        conversation_id: row.get(3)?,
        role: role.parse().map_err(|e| conversion_error(4, e))?,
        text: row.get(5)?,
        citations: serde_json::from_str(&citations)
            .map_err(|e| conversion_error(6, e.to_string()))?,
        token_in: from_sql_count(row.get(7)?),
        token_out: from_sql_count(row.get(8)?),
        status: status.parse().map_err(|e| conversion_error(9, e))?,
        failure: failure
            .map(|f| serde_json::from_str(&f))
            .transpose()
            .map_err(|e| conversion_error(10, e.to_string()))?,
        created_at: parse_datetime(&row.get::<_, String>(11)?),
        updated_at: parse_datetime(&row.get::<_, String>(12)?),
    })
}
