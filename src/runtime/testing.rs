//! Mock implementations for testing
//!
//! These mocks enable orchestration tests without a database or network.

use super::traits::*;
use crate::db::{
    Citation, DailyBudget, MessageRecord, RecordFailure, RecordStatus, ThreadMapping,
};
use crate::provider::{
    AssistantProvider, ProviderError, RunRequest, RunSnapshot, ThreadHandle,
};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

// ============================================================================
// Scripted Provider
// ============================================================================

/// A provider call, as recorded by [`ScriptedProvider`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderCall {
    CreateThread,
    DeleteThread { thread_id: String },
    AppendMessage { thread_id: String, text: String },
    CreateRun {
        thread_id: String,
        max_output_tokens: Option<u32>,
        additional_instructions: Option<String>,
    },
    PollRun { run_id: String },
    CancelRun { run_id: String },
}

/// Mock provider replaying queued run scripts.
///
/// Each `create_run` takes the next queued script; each poll of that run takes
/// the script's next step. The last step repeats once the script runs out, so a
/// script ending in an in-progress snapshot never finishes on its own.
pub struct ScriptedProvider {
    runs: Mutex<VecDeque<Vec<Result<RunSnapshot, ProviderError>>>>,
    active_runs: Mutex<HashMap<String, VecDeque<Result<RunSnapshot, ProviderError>>>>,
    create_thread_errors: Mutex<VecDeque<ProviderError>>,
    delete_thread_errors: Mutex<VecDeque<ProviderError>>,
    append_errors: Mutex<VecDeque<ProviderError>>,
    create_run_delay: Mutex<Option<Duration>>,
    next_thread: AtomicUsize,
    next_run: AtomicUsize,
    deleted: Mutex<Vec<String>>,
    /// Record of all calls made
    pub calls: Mutex<Vec<ProviderCall>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            runs: Mutex::new(VecDeque::new()),
            active_runs: Mutex::new(HashMap::new()),
            create_thread_errors: Mutex::new(VecDeque::new()),
            delete_thread_errors: Mutex::new(VecDeque::new()),
            append_errors: Mutex::new(VecDeque::new()),
            create_run_delay: Mutex::new(None),
            next_thread: AtomicUsize::new(1),
            next_run: AtomicUsize::new(1),
            deleted: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Queue the snapshots the next run will report, in poll order
    pub fn queue_run(&self, snapshots: Vec<RunSnapshot>) {
        self.queue_run_results(snapshots.into_iter().map(Ok).collect());
    }

    /// Like [`Self::queue_run`], with poll failures mixed in
    pub fn queue_run_results(&self, steps: Vec<Result<RunSnapshot, ProviderError>>) {
        self.runs.lock().unwrap().push_back(steps);
    }

    pub fn fail_next_create_thread(&self, error: ProviderError) {
        self.create_thread_errors.lock().unwrap().push_back(error);
    }

    pub fn fail_next_delete(&self, error: ProviderError) {
        self.delete_thread_errors.lock().unwrap().push_back(error);
    }

    pub fn fail_next_append(&self, error: ProviderError) {
        self.append_errors.lock().unwrap().push_back(error);
    }

    /// Make `create_run` return only after `delay`, with the run already live
    pub fn delay_create_run(&self, delay: Duration) {
        *self.create_run_delay.lock().unwrap() = Some(delay);
    }

    pub fn calls(&self) -> Vec<ProviderCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn poll_count(&self) -> usize {
        self.count(|c| matches!(c, ProviderCall::PollRun { .. }))
    }

    /// Threads successfully created
    pub fn threads_created(&self) -> usize {
        self.next_thread.load(Ordering::SeqCst) - 1
    }

    pub fn deleted_threads(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    /// Created and not deleted
    pub fn live_threads(&self) -> usize {
        let deleted: HashSet<String> = self.deleted_threads().into_iter().collect();
        (1..=self.threads_created())
            .filter(|n| !deleted.contains(&format!("thread_{n}")))
            .count()
    }

    /// Thread ids messages were appended to, in order
    pub fn appended_threads(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                ProviderCall::AppendMessage { thread_id, .. } => Some(thread_id),
                _ => None,
            })
            .collect()
    }

    fn count(&self, pred: impl Fn(&ProviderCall) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| pred(c)).count()
    }

    fn record(&self, call: ProviderCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AssistantProvider for ScriptedProvider {
    async fn create_thread(&self) -> Result<ThreadHandle, ProviderError> {
        self.record(ProviderCall::CreateThread);
        if let Some(e) = self.create_thread_errors.lock().unwrap().pop_front() {
            return Err(e);
        }
        let n = self.next_thread.fetch_add(1, Ordering::SeqCst);
        Ok(ThreadHandle::new(format!("thread_{n}")))
    }

    async fn delete_thread(&self, thread: &ThreadHandle) -> Result<(), ProviderError> {
        self.record(ProviderCall::DeleteThread {
            thread_id: thread.to_string(),
        });
        if let Some(e) = self.delete_thread_errors.lock().unwrap().pop_front() {
            return Err(e);
        }
        self.deleted.lock().unwrap().push(thread.to_string());
        Ok(())
    }

    async fn append_message(&self, thread: &ThreadHandle, text: &str) -> Result<(), ProviderError> {
        self.record(ProviderCall::AppendMessage {
            thread_id: thread.to_string(),
            text: text.to_string(),
        });
        match self.append_errors.lock().unwrap().pop_front() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn create_run(
        &self,
        thread: &ThreadHandle,
        request: &RunRequest,
    ) -> Result<String, ProviderError> {
        self.record(ProviderCall::CreateRun {
            thread_id: thread.to_string(),
            max_output_tokens: request.max_output_tokens,
            additional_instructions: request.additional_instructions.clone(),
        });
        let script = self
            .runs
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| ProviderError::invalid_request("No scripted run queued"))?;
        let run_id = format!("run_{}", self.next_run.fetch_add(1, Ordering::SeqCst));
        self.active_runs
            .lock()
            .unwrap()
            .insert(run_id.clone(), script.into());
        let delay = *self.create_run_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(run_id)
    }

    async fn poll_run(
        &self,
        _thread: &ThreadHandle,
        run_id: &str,
    ) -> Result<RunSnapshot, ProviderError> {
        self.record(ProviderCall::PollRun {
            run_id: run_id.to_string(),
        });
        let mut runs = self.active_runs.lock().unwrap();
        let script = runs
            .get_mut(run_id)
            .ok_or_else(|| ProviderError::not_found(format!("No run {run_id}")))?;
        match script.len() {
            0 => Err(ProviderError::not_found("Empty run script")),
            1 => script[0].clone(),
            _ => script.pop_front().unwrap_or_else(|| Err(ProviderError::unknown("unreachable"))),
        }
    }

    async fn cancel_run(&self, _thread: &ThreadHandle, run_id: &str) -> Result<(), ProviderError> {
        self.record(ProviderCall::CancelRun {
            run_id: run_id.to_string(),
        });
        Ok(())
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

// ============================================================================
// Delayed Scripted Provider (for concurrency and cancellation testing)
// ============================================================================

/// Scripted provider whose thread creation and polls take `delay`
pub struct DelayedScriptedProvider {
    pub inner: ScriptedProvider,
    delay: Duration,
}

impl DelayedScriptedProvider {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: ScriptedProvider::new(),
            delay,
        }
    }
}

#[async_trait]
impl AssistantProvider for DelayedScriptedProvider {
    async fn create_thread(&self) -> Result<ThreadHandle, ProviderError> {
        tokio::time::sleep(self.delay).await;
        self.inner.create_thread().await
    }

    async fn delete_thread(&self, thread: &ThreadHandle) -> Result<(), ProviderError> {
        self.inner.delete_thread(thread).await
    }

    async fn append_message(&self, thread: &ThreadHandle, text: &str) -> Result<(), ProviderError> {
        self.inner.append_message(thread, text).await
    }

    async fn create_run(
        &self,
        thread: &ThreadHandle,
        request: &RunRequest,
    ) -> Result<String, ProviderError> {
        self.inner.create_run(thread, request).await
    }

    async fn poll_run(
        &self,
        thread: &ThreadHandle,
        run_id: &str,
    ) -> Result<RunSnapshot, ProviderError> {
        tokio::time::sleep(self.delay).await;
        self.inner.poll_run(thread, run_id).await
    }

    async fn cancel_run(&self, thread: &ThreadHandle, run_id: &str) -> Result<(), ProviderError> {
        self.inner.cancel_run(thread, run_id).await
    }

    fn name(&self) -> &str {
        "delayed-scripted"
    }
}

// ============================================================================
// In-Memory Storage
// ============================================================================

/// In-memory storage with the same transition rules as the database
pub struct InMemoryStorage {
    threads: Mutex<HashMap<String, ThreadMapping>>,
    records: Mutex<Vec<MessageRecord>>,
    budgets: Mutex<HashMap<String, DailyBudget>>,
    put_thread_errors: Mutex<VecDeque<String>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            threads: Mutex::new(HashMap::new()),
            records: Mutex::new(Vec::new()),
            budgets: Mutex::new(HashMap::new()),
            put_thread_errors: Mutex::new(VecDeque::new()),
        }
    }

    pub fn thread_of(&self, caller_id: &str) -> Option<String> {
        self.threads
            .lock()
            .unwrap()
            .get(caller_id)
            .map(|m| m.thread_id.clone())
    }

    pub fn budget_of(&self, caller_id: &str) -> Option<DailyBudget> {
        self.budgets.lock().unwrap().get(caller_id).copied()
    }

    pub fn set_budget(&self, caller_id: &str, budget: DailyBudget) {
        self.budgets
            .lock()
            .unwrap()
            .insert(caller_id.to_string(), budget);
    }

    pub fn fail_next_put_thread(&self, error: impl Into<String>) {
        self.put_thread_errors.lock().unwrap().push_back(error.into());
    }

    fn update_record(
        &self,
        message_id: &str,
        allowed: &[RecordStatus],
        apply: impl FnOnce(&mut MessageRecord),
    ) -> bool {
        let mut records = self.records.lock().unwrap();
        match records
            .iter_mut()
            .find(|r| r.message_id == message_id && allowed.contains(&r.status))
        {
            Some(record) => {
                apply(record);
                record.updated_at = Utc::now();
                true
            }
            None => false,
        }
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ThreadMapStore for InMemoryStorage {
    async fn get_thread(&self, caller_id: &str) -> Result<Option<ThreadMapping>, String> {
        Ok(self.threads.lock().unwrap().get(caller_id).cloned())
    }

    async fn put_thread(&self, caller_id: &str, thread_id: &str) -> Result<ThreadMapping, String> {
        if let Some(e) = self.put_thread_errors.lock().unwrap().pop_front() {
            return Err(e);
        }
        let mapping = ThreadMapping {
            caller_id: caller_id.to_string(),
            thread_id: thread_id.to_string(),
            created_at: Utc::now(),
        };
        self.threads
            .lock()
            .unwrap()
            .insert(caller_id.to_string(), mapping.clone());
        Ok(mapping)
    }
}

#[async_trait]
impl RecordStore for InMemoryStorage {
    async fn insert_record(&self, record: &MessageRecord) -> Result<MessageRecord, String> {
        let mut records = self.records.lock().unwrap();
        if records.iter().any(|r| r.message_id == record.message_id) {
            return Err(format!("Duplicate message id: {}", record.message_id));
        }
        let mut stored = record.clone();
        #[allow(clippy::cast_possible_wrap)]
        let sequence_id = records.len() as i64 + 1;
        stored.sequence_id = sequence_id;
        records.push(stored.clone());
        Ok(stored)
    }

    async fn get_record(&self, message_id: &str) -> Result<Option<MessageRecord>, String> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.message_id == message_id)
            .cloned())
    }

    async fn list_records(&self, caller_id: &str) -> Result<Vec<MessageRecord>, String> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.caller_id == caller_id)
            .cloned()
            .collect())
    }

    async fn mark_streaming(&self, message_id: &str, conversation_id: &str) -> Result<bool, String> {
        Ok(self.update_record(message_id, &[RecordStatus::Pending], |r| {
            r.status = RecordStatus::Streaming;
            r.conversation_id = Some(conversation_id.to_string());
        }))
    }

    async fn append_text(&self, message_id: &str, appended: &str) -> Result<bool, String> {
        Ok(self.update_record(message_id, &[RecordStatus::Streaming], |r| {
            r.text.push_str(appended);
        }))
    }

    async fn complete_record(
        &self,
        message_id: &str,
        text: &str,
        citations: &[Citation],
        token_in: u64,
        token_out: u64,
    ) -> Result<bool, String> {
        Ok(self.update_record(
            message_id,
            &[RecordStatus::Pending, RecordStatus::Streaming],
            |r| {
                r.text = text.to_string();
                r.citations = citations.to_vec();
                r.token_in = token_in;
                r.token_out = token_out;
                r.status = RecordStatus::Complete;
                r.failure = None;
            },
        ))
    }

    async fn fail_record(
        &self,
        message_id: &str,
        failure: &RecordFailure,
        token_in: u64,
        token_out: u64,
    ) -> Result<bool, String> {
        Ok(self.update_record(
            message_id,
            &[RecordStatus::Pending, RecordStatus::Streaming],
            |r| {
                r.token_in = token_in;
                r.token_out = token_out;
                r.status = RecordStatus::Failed;
                r.failure = Some(failure.clone());
            },
        ))
    }
}

#[async_trait]
impl BudgetStore for InMemoryStorage {
    async fn get_budget(&self, caller_id: &str) -> Result<Option<DailyBudget>, String> {
        Ok(self.budget_of(caller_id))
    }

    async fn add_consumed(
        &self,
        caller_id: &str,
        today: NaiveDate,
        amount: u64,
    ) -> Result<u64, String> {
        let mut budgets = self.budgets.lock().unwrap();
        let budget = budgets
            .entry(caller_id.to_string())
            .or_insert(DailyBudget {
                date_utc: today,
                output_tokens_consumed: 0,
            });
        if budget.date_utc != today {
            budget.date_utc = today;
            budget.output_tokens_consumed = 0;
        }
        budget.output_tokens_consumed += amount;
        Ok(budget.output_tokens_consumed)
    }
}
