//! Streaming run assembly
//!
//! Drives append message → start run → poll against the upstream provider and
//! turns cumulative run output into an ordered sequence of append-only updates.
//! The protocol lives in a pure state machine ([`transition`]); [`StreamAssembler`]
//! only executes the effects it returns.

mod effect;
mod event;
mod state;
mod transition;

#[cfg(test)]
mod proptests;

pub use effect::{AssemblyUpdate, Effect};
pub use event::{AssemblyEvent, ProviderFailure};
pub use state::AssemblyState;
pub use transition::{transition, TransitionError, TransitionResult};

use crate::provider::{AssistantProvider, ProviderError, RunRequest, ThreadHandle};
use futures::Stream;
use rand::Rng;
use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Bound on the best-effort upstream cancel after a run is abandoned
const CANCEL_RUN_TIMEOUT: Duration = Duration::from_secs(5);

/// Timing knobs for a run
#[derive(Debug, Clone, Copy)]
pub struct AssemblerConfig {
    pub poll_interval: Duration,
    pub run_timeout: Duration,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            run_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Clone)]
pub struct StreamAssembler<P: AssistantProvider> {
    provider: P,
    config: AssemblerConfig,
}

impl<P: AssistantProvider + Clone + 'static> StreamAssembler<P> {
    pub fn new(provider: P, config: AssemblerConfig) -> Self {
        Self { provider, config }
    }

    /// Run `message` against `thread`.
    ///
    /// The stream is lazy: nothing is sent upstream until it is first polled.
    /// It yields zero or more [`AssemblyUpdate::Partial`] followed by exactly one
    /// terminal update, then ends. Triggering `cancel` stops polling and ends the
    /// stream with [`AssemblyUpdate::Cancelled`].
    pub fn run(
        &self,
        thread: ThreadHandle,
        message: String,
        request: RunRequest,
        cancel: CancellationToken,
    ) -> impl Stream<Item = AssemblyUpdate> + Send + 'static {
        let mut driver = Driver {
            provider: self.provider.clone(),
            thread,
            message,
            request,
            cancel,
            poll_interval: self.config.poll_interval,
            deadline: Instant::now() + self.config.run_timeout,
            state: AssemblyState::Created,
            effects: VecDeque::new(),
            outbox: VecDeque::new(),
        };
        driver.apply(AssemblyEvent::Start);
        futures::stream::unfold(driver, |mut driver| async move {
            driver.next_update().await.map(|update| (update, driver))
        })
    }
}

/// Executes effects and feeds their outcomes back as events
struct Driver<P> {
    provider: P,
    thread: ThreadHandle,
    message: String,
    request: RunRequest,
    cancel: CancellationToken,
    poll_interval: Duration,
    deadline: Instant,
    state: AssemblyState,
    /// Effects still to run, in the order the transitions produced them
    effects: VecDeque<Effect>,
    outbox: VecDeque<AssemblyUpdate>,
}

impl<P: AssistantProvider> Driver<P> {
    async fn next_update(&mut self) -> Option<AssemblyUpdate> {
        loop {
            if let Some(update) = self.outbox.pop_front() {
                return Some(update);
            }
            let effect = self.effects.pop_front()?;
            if let Some(event) = self.execute_effect(effect).await {
                self.apply(event);
            }
        }
    }

    /// Run the pure transition and queue its effects. No I/O happens here.
    fn apply(&mut self, event: AssemblyEvent) {
        if let AssemblyEvent::Snapshot(snapshot) = &event {
            let accumulated = self.state.partial_text();
            if !snapshot.output.starts_with(accumulated) {
                tracing::warn!(
                    thread_id = %self.thread,
                    run_id = ?self.state.run_id(),
                    accumulated_len = accumulated.len(),
                    output_len = snapshot.output.len(),
                    "Run output no longer extends emitted text; ignoring snapshot"
                );
            }
        }

        let result = match transition(&self.state, event) {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(thread_id = %self.thread, error = %e, "Dropped assembly event");
                return;
            }
        };

        let from = state_name(&self.state);
        self.state = result.new_state;
        let to = state_name(&self.state);
        if from != to {
            tracing::debug!(thread_id = %self.thread, from, to, "Assembly state changed");
        }

        self.effects.extend(result.effects);
    }

    async fn execute_effect(&mut self, effect: Effect) -> Option<AssemblyEvent> {
        match effect {
            Effect::AppendMessage => {
                let outcome = self
                    .guarded(self.provider.append_message(&self.thread, &self.message))
                    .await;
                Some(outcome.map_or_else(|e| e, |r| provider_event(r, |()| AssemblyEvent::MessageAppended)))
            }

            // Not raced against cancel or the deadline: a run the provider has
            // already created must be known here so it can be cancelled.
            Effect::StartRun => {
                let created = self.provider.create_run(&self.thread, &self.request).await;
                let interrupt = self.interruption();
                match created {
                    Ok(run_id) => {
                        self.apply(AssemblyEvent::RunCreated { run_id });
                        interrupt
                    }
                    Err(e) => Some(interrupt.unwrap_or_else(|| {
                        AssemblyEvent::ProviderFailed(ProviderFailure::from(&e))
                    })),
                }
            }

            Effect::SchedulePoll if self.state.is_terminal() => None,

            Effect::SchedulePoll => {
                let delay = jittered(self.poll_interval);
                if let Err(interrupt) = self.guarded(tokio::time::sleep(delay)).await {
                    return Some(interrupt);
                }
                let run_id = self.state.run_id()?.to_string();
                let outcome = self
                    .guarded(self.provider.poll_run(&self.thread, &run_id))
                    .await;
                Some(outcome.map_or_else(|e| e, |r| provider_event(r, AssemblyEvent::Snapshot)))
            }

            Effect::CancelRun { run_id } => {
                match tokio::time::timeout(
                    CANCEL_RUN_TIMEOUT,
                    self.provider.cancel_run(&self.thread, &run_id),
                )
                .await
                {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::warn!(run_id = %run_id, error = %e, "Failed to cancel upstream run");
                    }
                    Err(_) => {
                        tracing::warn!(run_id = %run_id, "Timed out cancelling upstream run");
                    }
                }
                None
            }

            Effect::Emit(update) => {
                self.outbox.push_back(update);
                None
            }
        }
    }

    /// Cancellation or timeout that happened while an unguarded call was in flight
    fn interruption(&self) -> Option<AssemblyEvent> {
        if self.cancel.is_cancelled() {
            Some(AssemblyEvent::CancelRequested)
        } else if Instant::now() >= self.deadline {
            Some(AssemblyEvent::TimedOut)
        } else {
            None
        }
    }

    /// Await `fut` unless the caller cancels or the run deadline passes first.
    /// Interruptions come back as the event to feed the state machine.
    async fn guarded<F: Future>(&self, fut: F) -> Result<F::Output, AssemblyEvent> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(AssemblyEvent::CancelRequested),
            () = tokio::time::sleep_until(self.deadline) => Err(AssemblyEvent::TimedOut),
            output = fut => Ok(output),
        }
    }
}

fn provider_event<T>(
    result: Result<T, ProviderError>,
    on_ok: impl FnOnce(T) -> AssemblyEvent,
) -> AssemblyEvent {
    match result {
        Ok(value) => on_ok(value),
        Err(e) => AssemblyEvent::ProviderFailed(ProviderFailure::from(&e)),
    }
}

/// Poll interval with up to 20% random slack so concurrent runs don't poll in lockstep
fn jittered(interval: Duration) -> Duration {
    let max_jitter = u64::try_from(interval.as_millis() / 5).unwrap_or(0);
    if max_jitter == 0 {
        return interval;
    }
    interval + Duration::from_millis(rand::thread_rng().gen_range(0..=max_jitter))
}

fn state_name(state: &AssemblyState) -> &'static str {
    match state {
        AssemblyState::Created => "created",
        AssemblyState::MessageAppended => "message_appended",
        AssemblyState::RunStarted { .. } => "run_started",
        AssemblyState::InProgress { .. } => "in_progress",
        AssemblyState::Completed { .. } => "completed",
        AssemblyState::Failed { .. } => "failed",
        AssemblyState::Cancelled { .. } => "cancelled",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::FailureKind;
    use crate::provider::{ProviderError, RunSnapshot, RunUsage};
    use crate::runtime::testing::{ProviderCall, ScriptedProvider};
    use futures::StreamExt;
    use std::sync::Arc;

    fn fast_config() -> AssemblerConfig {
        AssemblerConfig {
            poll_interval: Duration::from_millis(1),
            run_timeout: Duration::from_secs(5),
        }
    }

    fn thread() -> ThreadHandle {
        ThreadHandle::new("thread_1")
    }

    async fn collect(
        provider: &Arc<ScriptedProvider>,
        config: AssemblerConfig,
        cancel: CancellationToken,
    ) -> Vec<AssemblyUpdate> {
        let assembler = StreamAssembler::new(Arc::clone(provider), config);
        assembler
            .run(thread(), "Explain lesson 1".to_string(), RunRequest::default(), cancel)
            .collect()
            .await
    }

    #[tokio::test]
    async fn test_streams_deltas_then_final() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.queue_run(vec![
            RunSnapshot::in_progress("Lesson "),
            RunSnapshot::in_progress("Lesson 1 teaches "),
            RunSnapshot::completed(
                "Lesson 1 teaches nothing is as it appears.",
                RunUsage {
                    input_tokens: 52,
                    output_tokens: 11,
                },
            ),
        ]);

        let updates = collect(&provider, fast_config(), CancellationToken::new()).await;
        assert_eq!(
            updates,
            vec![
                AssemblyUpdate::Partial {
                    appended: "Lesson ".to_string()
                },
                AssemblyUpdate::Partial {
                    appended: "1 teaches ".to_string()
                },
                AssemblyUpdate::Partial {
                    appended: "nothing is as it appears.".to_string()
                },
                AssemblyUpdate::Final {
                    text: "Lesson 1 teaches nothing is as it appears.".to_string(),
                    token_in: 52,
                    token_out: 11,
                },
            ]
        );

        let calls = provider.calls();
        assert_eq!(
            calls[0],
            ProviderCall::AppendMessage {
                thread_id: "thread_1".to_string(),
                text: "Explain lesson 1".to_string()
            }
        );
        assert!(matches!(calls[1], ProviderCall::CreateRun { .. }));
    }

    #[tokio::test]
    async fn test_stream_is_lazy() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.queue_run(vec![RunSnapshot::completed("done", RunUsage::default())]);
        let assembler = StreamAssembler::new(Arc::clone(&provider), fast_config());
        let stream = assembler.run(
            thread(),
            "hi".to_string(),
            RunRequest::default(),
            CancellationToken::new(),
        );
        assert_eq!(provider.call_count(), 0);
        drop(stream);
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn test_append_failure_surfaces_unavailable() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.fail_next_append(ProviderError::network("connection refused"));

        let updates = collect(&provider, fast_config(), CancellationToken::new()).await;
        assert_eq!(updates.len(), 1);
        match &updates[0] {
            AssemblyUpdate::Failed { failure, partial, .. } => {
                assert_eq!(failure.kind, FailureKind::UpstreamUnavailable);
                assert!(partial.is_empty());
            }
            other => panic!("Expected failure, got {other:?}"),
        }
        // Never got as far as creating a run
        assert!(!provider
            .calls()
            .iter()
            .any(|c| matches!(c, ProviderCall::CreateRun { .. })));
    }

    #[tokio::test]
    async fn test_cancel_mid_run_stops_polling() {
        let provider = Arc::new(ScriptedProvider::new());
        // Stays in progress forever
        provider.queue_run(vec![RunSnapshot::in_progress("Lesson ")]);
        let cancel = CancellationToken::new();

        let assembler = StreamAssembler::new(Arc::clone(&provider), fast_config());
        let mut stream = Box::pin(assembler.run(
            thread(),
            "hi".to_string(),
            RunRequest::default(),
            cancel.clone(),
        ));

        assert_eq!(
            stream.next().await,
            Some(AssemblyUpdate::Partial {
                appended: "Lesson ".to_string()
            })
        );
        cancel.cancel();
        assert_eq!(
            stream.next().await,
            Some(AssemblyUpdate::Cancelled {
                partial: "Lesson ".to_string(),
                token_out: 2
            })
        );
        assert_eq!(stream.next().await, None);

        let polls_at_cancel = provider.poll_count();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(provider.poll_count(), polls_at_cancel);
        assert!(provider
            .calls()
            .iter()
            .any(|c| matches!(c, ProviderCall::CancelRun { .. })));
    }

    #[tokio::test]
    async fn test_cancel_during_run_creation_cancels_created_run() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.queue_run(vec![RunSnapshot::in_progress("Lesson ")]);
        provider.delay_create_run(Duration::from_millis(50));
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        let updates = collect(&provider, fast_config(), cancel).await;

        assert_eq!(
            updates,
            vec![AssemblyUpdate::Cancelled {
                partial: String::new(),
                token_out: 0
            }]
        );
        assert_eq!(provider.poll_count(), 0);
        assert!(provider.calls().contains(&ProviderCall::CancelRun {
            run_id: "run_1".to_string()
        }));
    }

    #[tokio::test]
    async fn test_transient_poll_errors_are_retried() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.queue_run_results(vec![
            Ok(RunSnapshot::in_progress("Lesson ")),
            Err(ProviderError::network("connection reset")),
            Err(ProviderError::server_error("Server error: 502")),
            Ok(RunSnapshot::completed(
                "Lesson 1",
                RunUsage {
                    input_tokens: 5,
                    output_tokens: 3,
                },
            )),
        ]);

        let updates = collect(&provider, fast_config(), CancellationToken::new()).await;
        assert_eq!(
            updates.last(),
            Some(&AssemblyUpdate::Final {
                text: "Lesson 1".to_string(),
                token_in: 5,
                token_out: 3,
            })
        );
        assert_eq!(provider.poll_count(), 4);
    }

    #[tokio::test]
    async fn test_repeated_poll_errors_fail_as_unavailable() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.queue_run_results(vec![
            Ok(RunSnapshot::in_progress("Lesson ")),
            Err(ProviderError::network("connection reset")),
        ]);

        let updates = collect(&provider, fast_config(), CancellationToken::new()).await;
        match updates.last() {
            Some(AssemblyUpdate::Failed { failure, partial, .. }) => {
                assert_eq!(failure.kind, FailureKind::UpstreamUnavailable);
                assert_eq!(partial, "Lesson ");
            }
            other => panic!("Expected failure, got {other:?}"),
        }
        // One good poll, then three failures in a row
        assert_eq!(provider.poll_count(), 4);
        assert!(provider
            .calls()
            .iter()
            .any(|c| matches!(c, ProviderCall::CancelRun { .. })));
    }

    #[tokio::test]
    async fn test_run_timeout_fails_run() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.queue_run(vec![RunSnapshot::in_progress("slow")]);
        let config = AssemblerConfig {
            poll_interval: Duration::from_millis(5),
            run_timeout: Duration::from_millis(40),
        };

        let updates = collect(&provider, config, CancellationToken::new()).await;
        match updates.last() {
            Some(AssemblyUpdate::Failed { failure, partial, .. }) => {
                assert_eq!(failure.kind, FailureKind::UpstreamRunFailed);
                assert_eq!(failure.message, "Run timed out");
                assert_eq!(partial, "slow");
            }
            other => panic!("Expected timeout failure, got {other:?}"),
        }
    }

    #[test]
    fn test_jitter_bounds() {
        let base = Duration::from_millis(500);
        for _ in 0..100 {
            let d = jittered(base);
            assert!(d >= base && d <= Duration::from_millis(600));
        }
        assert_eq!(jittered(Duration::ZERO), Duration::ZERO);
    }
}
