//! Conversation orchestration
//!
//! A submitted message passes the rate and budget gates synchronously, gets a
//! pending reply record, and is then driven to a terminal state in a background
//! task that holds the caller's run lock for its whole lifetime.

mod active;
pub mod traits;

#[cfg(test)]
pub mod testing;

pub use active::WatchGuard;
pub use traits::*;

use crate::assembler::{AssemblerConfig, AssemblyUpdate, StreamAssembler};
use crate::db::{FailureKind, MessageRecord, RecordFailure};
use crate::error::OrchestratorError;
use crate::keyed_lock::KeyedLocks;
use crate::provider::{AssistantProvider, RunRequest, ThreadHandle};
use crate::publisher::{ConversationPublisher, PublishedEvent};
use crate::quota::{Admission, BudgetDecision, RateLimiter, TokenBudgetTracker};
use crate::text::{extract_citations, sanitize};
use active::ActiveRuns;
use chrono::{NaiveDate, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Type alias for the production orchestrator
pub type ProductionOrchestrator = Orchestrator<DatabaseStorage, Arc<dyn AssistantProvider>>;

/// Requested answer style
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tone {
    Direct,
    Gentle,
}

impl Tone {
    /// Per-run instructions passed to the assistant
    pub fn instructions(self) -> &'static str {
        match self {
            Tone::Direct => {
                "Answer plainly and concisely. Lead with the main point and skip reassurance."
            }
            Tone::Gentle => {
                "Answer warmly and patiently. Acknowledge the question before explaining, \
                 and keep the language encouraging."
            }
        }
    }
}

/// Limits the orchestrator enforces
#[derive(Debug, Clone, Copy)]
pub struct OrchestratorLimits {
    pub rate_limit_per_window: u32,
    pub rate_window: Duration,
    pub daily_output_tokens: u64,
    pub max_output_tokens_per_request: u64,
}

/// Synchronous answer to an accepted message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmitAck {
    /// Id of the assistant record that will carry the reply
    pub message_id: String,
    pub user_message_id: String,
    /// Daily output tokens left before this reply
    pub limit_remaining: u64,
    /// Requests left in the current rate window
    pub rate_remaining: u32,
}

/// A caller's quota position
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageSummary {
    pub date_utc: NaiveDate,
    pub output_tokens_consumed: u64,
    pub daily_output_tokens: u64,
    pub limit_remaining: u64,
    pub rate_remaining: u32,
    pub run_active: bool,
}

pub struct Orchestrator<S, P>
where
    S: Storage + Clone + 'static,
    P: AssistantProvider + Clone + 'static,
{
    storage: S,
    rate_limiter: RateLimiter,
    budget: TokenBudgetTracker<S>,
    threads: crate::threads::ThreadStore<S, P>,
    assembler: StreamAssembler<P>,
    publisher: ConversationPublisher<S>,
    /// One live run per caller
    run_locks: KeyedLocks,
    active: ActiveRuns,
    max_output_tokens_per_request: u64,
}

impl<S, P> Orchestrator<S, P>
where
    S: Storage + Clone + 'static,
    P: AssistantProvider + Clone + 'static,
{
    pub fn new(
        storage: S,
        provider: P,
        limits: OrchestratorLimits,
        assembler: AssemblerConfig,
    ) -> Self {
        Self {
            rate_limiter: RateLimiter::new(limits.rate_limit_per_window, limits.rate_window),
            budget: TokenBudgetTracker::new(storage.clone(), limits.daily_output_tokens),
            threads: crate::threads::ThreadStore::new(storage.clone(), provider.clone()),
            assembler: StreamAssembler::new(provider, assembler),
            publisher: ConversationPublisher::new(storage.clone()),
            storage,
            run_locks: KeyedLocks::new(),
            active: ActiveRuns::new(),
            max_output_tokens_per_request: limits.max_output_tokens_per_request,
        }
    }

    /// Accept a message and start producing the reply in the background.
    ///
    /// Rate and budget are checked before anything touches the provider.
    pub async fn submit(
        self: &Arc<Self>,
        caller_id: &str,
        message: &str,
        tone: Option<Tone>,
    ) -> Result<SubmitAck, OrchestratorError> {
        let rate_remaining = match self.rate_limiter.admit(caller_id) {
            Admission::Allowed { remaining } => remaining,
            Admission::Denied { retry_after } => {
                return Err(OrchestratorError::RateLimited { retry_after });
            }
        };

        let remaining = self
            .budget
            .remaining(caller_id)
            .await
            .map_err(OrchestratorError::Storage)?;
        let ceiling = self.max_output_tokens_per_request.min(remaining).max(1);
        let limit_remaining = match self
            .budget
            .check_and_reserve(caller_id, ceiling)
            .await
            .map_err(OrchestratorError::Storage)?
        {
            BudgetDecision::Allowed(remaining) => remaining,
            BudgetDecision::Denied(remaining) => {
                return Err(OrchestratorError::BudgetExceeded { remaining });
            }
        };

        let conversation_id = self.threads.current(caller_id).await?.map(|t| t.0);
        let user_record = MessageRecord::user(
            uuid::Uuid::new_v4().to_string(),
            caller_id,
            conversation_id,
            message,
        );
        self.storage
            .insert_record(&user_record)
            .await
            .map_err(OrchestratorError::Storage)?;

        let message_id = uuid::Uuid::new_v4().to_string();
        self.storage
            .insert_record(&MessageRecord::pending_assistant(&message_id, caller_id))
            .await
            .map_err(OrchestratorError::Storage)?;

        let cancel = CancellationToken::new();
        self.active.register(&message_id, caller_id, cancel.clone());

        tracing::info!(
            caller_id,
            message_id = %message_id,
            ceiling,
            limit_remaining,
            rate_remaining,
            "Message accepted"
        );

        let this = Arc::clone(self);
        let job = RunJob {
            caller_id: caller_id.to_string(),
            message_id: message_id.clone(),
            message: message.to_string(),
            request: RunRequest {
                additional_instructions: tone.map(|t| t.instructions().to_string()),
                max_output_tokens: Some(u32::try_from(ceiling).unwrap_or(u32::MAX)),
            },
            cancel,
        };
        tokio::spawn(async move {
            let message_id = job.message_id.clone();
            this.drive(job).await;
            this.active.finish(&message_id);
        });

        Ok(SubmitAck {
            message_id,
            user_message_id: user_record.message_id,
            limit_remaining,
            rate_remaining,
        })
    }

    /// Abort every run the caller has in flight. Returns how many were signalled.
    pub fn cancel(&self, caller_id: &str) -> usize {
        let signalled = self.active.cancel_caller(caller_id);
        if signalled > 0 {
            tracing::info!(caller_id, runs = signalled, "Cancellation requested");
        }
        signalled
    }

    /// Start the caller over on a fresh upstream thread.
    ///
    /// Any in-flight reply is cancelled; the reset waits for it to wind down so
    /// no run is left writing to the old thread.
    pub async fn reset(&self, caller_id: &str) -> Result<ThreadHandle, OrchestratorError> {
        self.cancel(caller_id);
        let _run_guard = self.run_locks.lock(caller_id).await;
        self.threads.reset(caller_id).await
    }

    /// A record, if it belongs to the caller
    pub async fn get_record(
        &self,
        caller_id: &str,
        message_id: &str,
    ) -> Result<MessageRecord, OrchestratorError> {
        self.storage
            .get_record(message_id)
            .await
            .map_err(OrchestratorError::Storage)?
            .filter(|r| r.caller_id == caller_id)
            .ok_or_else(|| OrchestratorError::NotFound(message_id.to_string()))
    }

    /// The caller's records in creation order
    pub async fn list_records(&self, caller_id: &str) -> Result<Vec<MessageRecord>, OrchestratorError> {
        self.storage
            .list_records(caller_id)
            .await
            .map_err(OrchestratorError::Storage)
    }

    pub async fn usage(&self, caller_id: &str) -> Result<UsageSummary, OrchestratorError> {
        let today = Utc::now().date_naive();
        let consumed = self
            .budget
            .consumed_on(caller_id, today)
            .await
            .map_err(OrchestratorError::Storage)?;
        Ok(UsageSummary {
            date_utc: today,
            output_tokens_consumed: consumed,
            daily_output_tokens: self.budget.cap(),
            limit_remaining: self.budget.cap().saturating_sub(consumed),
            rate_remaining: self.rate_limiter.remaining(caller_id),
            run_active: self.run_locks.is_locked(caller_id),
        })
    }

    /// Daily output tokens the caller has left
    pub async fn limit_remaining(&self, caller_id: &str) -> Result<u64, OrchestratorError> {
        self.budget
            .remaining(caller_id)
            .await
            .map_err(OrchestratorError::Storage)
    }

    /// Register an open event stream for the caller.
    ///
    /// When the caller's last guard drops, their in-flight runs are cancelled.
    pub fn watch(&self, caller_id: &str) -> WatchGuard {
        self.active.watch(caller_id)
    }

    /// Live partial/final/failed events for every caller
    pub fn subscribe(&self) -> broadcast::Receiver<PublishedEvent> {
        self.publisher.subscribe()
    }

    // ==================== Background run ====================

    async fn drive(&self, job: RunJob) {
        let RunJob {
            caller_id,
            message_id,
            message,
            request,
            cancel,
        } = job;

        let _run_guard = tokio::select! {
            guard = self.run_locks.lock(&caller_id) => guard,
            () = cancel.cancelled() => {
                self.finish_failed(&caller_id, &message_id, &RecordFailure::cancelled(), 0, 0).await;
                return;
            }
        };
        if cancel.is_cancelled() {
            self.finish_failed(&caller_id, &message_id, &RecordFailure::cancelled(), 0, 0)
                .await;
            return;
        }

        let thread = match self.threads.resolve_or_create(&caller_id).await {
            Ok(thread) => thread,
            Err(e) => {
                tracing::error!(caller_id = %caller_id, message_id = %message_id, error = %e, "Could not resolve thread");
                self.finish_failed(&caller_id, &message_id, &failure_for(&e), 0, 0)
                    .await;
                return;
            }
        };

        match self.storage.mark_streaming(&message_id, thread.as_str()).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(message_id = %message_id, "Record left pending state before its run started");
                return;
            }
            Err(e) => {
                tracing::error!(message_id = %message_id, error = %e, "Failed to mark record streaming");
                let failure = RecordFailure::new(FailureKind::Internal, e);
                self.finish_failed(&caller_id, &message_id, &failure, 0, 0).await;
                return;
            }
        }

        let mut updates = pin!(self.assembler.run(thread, message, request, cancel));
        while let Some(update) = updates.next().await {
            match update {
                AssemblyUpdate::Partial { appended } => {
                    if let Err(e) = self
                        .publisher
                        .publish_partial(&caller_id, &message_id, &appended)
                        .await
                    {
                        tracing::error!(message_id = %message_id, error = %e, "Failed to publish partial");
                    }
                }
                AssemblyUpdate::Final {
                    text,
                    token_in,
                    token_out,
                } => {
                    self.finish_complete(&caller_id, &message_id, &text, token_in, token_out)
                        .await;
                }
                AssemblyUpdate::Failed { failure, usage, .. } => {
                    self.finish_failed(
                        &caller_id,
                        &message_id,
                        &failure,
                        usage.input_tokens,
                        usage.output_tokens,
                    )
                    .await;
                }
                AssemblyUpdate::Cancelled { token_out, .. } => {
                    self.finish_failed(
                        &caller_id,
                        &message_id,
                        &RecordFailure::cancelled(),
                        0,
                        token_out,
                    )
                    .await;
                }
            }
        }
    }

    async fn finish_complete(
        &self,
        caller_id: &str,
        message_id: &str,
        raw_text: &str,
        token_in: u64,
        token_out: u64,
    ) {
        let limit_remaining = self.commit_tokens(caller_id, token_out).await;
        let clean = sanitize(raw_text);
        let citations = extract_citations(&clean);

        match self
            .publisher
            .publish_final(
                caller_id,
                message_id,
                &clean,
                &citations,
                token_in,
                token_out,
                limit_remaining,
            )
            .await
        {
            Ok(summary) => tracing::debug!(
                caller_id,
                message_id,
                conversation_id = ?summary.conversation_id,
                limit_remaining = summary.limit_remaining,
                "Budget after reply"
            ),
            Err(e) => tracing::error!(message_id, error = %e, "Failed to publish final reply"),
        }
    }

    async fn finish_failed(
        &self,
        caller_id: &str,
        message_id: &str,
        failure: &RecordFailure,
        token_in: u64,
        token_out: u64,
    ) {
        let limit_remaining = self.commit_tokens(caller_id, token_out).await;
        if let Err(e) = self
            .publisher
            .publish_failed(caller_id, message_id, failure, token_in, token_out, limit_remaining)
            .await
        {
            tracing::error!(message_id, error = %e, "Failed to publish failed reply");
        }
    }

    /// Commit consumed tokens; returns the caller's remaining budget
    async fn commit_tokens(&self, caller_id: &str, token_out: u64) -> u64 {
        match self.budget.commit(caller_id, token_out).await {
            Ok(remaining) => remaining,
            Err(e) => {
                tracing::error!(caller_id, token_out, error = %e, "Failed to commit token usage");
                0
            }
        }
    }
}

struct RunJob {
    caller_id: String,
    message_id: String,
    message: String,
    request: RunRequest,
    cancel: CancellationToken,
}

fn failure_for(e: &OrchestratorError) -> RecordFailure {
    let kind = match e {
        OrchestratorError::UpstreamUnavailable(_) => FailureKind::UpstreamUnavailable,
        OrchestratorError::UpstreamRunFailed(_) => FailureKind::UpstreamRunFailed,
        _ => FailureKind::Internal,
    };
    RecordFailure::new(kind, e.to_string())
}
