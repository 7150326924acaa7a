//! Pure state transition function
//!
//! Given the same state and event this always produces the same result; all
//! provider I/O happens in the driver that executes the returned effects.

use super::effect::{AssemblyUpdate, Effect};
use super::event::{AssemblyEvent, ProviderFailure};
use super::state::AssemblyState;
use crate::db::{FailureKind, RecordFailure};
use crate::provider::{RunSnapshot, RunStatus, RunUsage};
use thiserror::Error;

/// Consecutive transient poll failures tolerated before the run is given up
pub const MAX_POLL_FAILURES: u32 = 3;

/// Rough output-token density used when the provider has not reported usage
const CHARS_PER_TOKEN: usize = 4;

/// Result of a state transition
#[derive(Debug)]
pub struct TransitionResult {
    pub new_state: AssemblyState,
    pub effects: Vec<Effect>,
}

impl TransitionResult {
    pub fn new(state: AssemblyState) -> Self {
        Self {
            new_state: state,
            effects: vec![],
        }
    }

    pub fn with_effect(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }

    pub fn with_effects(mut self, effects: impl IntoIterator<Item = Effect>) -> Self {
        self.effects.extend(effects);
        self
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("Assembly already finished")]
    AlreadyTerminal,
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),
}

pub fn transition(
    state: &AssemblyState,
    event: AssemblyEvent,
) -> Result<TransitionResult, TransitionError> {
    if state.is_terminal() {
        return Err(TransitionError::AlreadyTerminal);
    }

    match (state, event) {
        // ============================================================
        // Protocol steps
        // ============================================================
        (AssemblyState::Created, AssemblyEvent::Start) => {
            Ok(TransitionResult::new(AssemblyState::Created).with_effect(Effect::AppendMessage))
        }

        (AssemblyState::Created, AssemblyEvent::MessageAppended) => {
            Ok(TransitionResult::new(AssemblyState::MessageAppended).with_effect(Effect::StartRun))
        }

        (AssemblyState::MessageAppended, AssemblyEvent::RunCreated { run_id }) => {
            Ok(TransitionResult::new(AssemblyState::RunStarted {
                run_id,
                poll_failures: 0,
            })
            .with_effect(Effect::SchedulePoll))
        }

        (AssemblyState::RunStarted { run_id, .. }, AssemblyEvent::Snapshot(snapshot)) => {
            Ok(observe(run_id, "", None, snapshot))
        }

        (
            AssemblyState::InProgress {
                run_id,
                text,
                usage,
                ..
            },
            AssemblyEvent::Snapshot(snapshot),
        ) => Ok(observe(run_id, text, *usage, snapshot)),

        // ============================================================
        // Provider failures
        // ============================================================
        (AssemblyState::RunStarted { run_id, poll_failures }, AssemblyEvent::ProviderFailed(f))
            if f.retryable && poll_failures + 1 < MAX_POLL_FAILURES =>
        {
            Ok(TransitionResult::new(AssemblyState::RunStarted {
                run_id: run_id.clone(),
                poll_failures: poll_failures + 1,
            })
            .with_effect(Effect::SchedulePoll))
        }

        (
            AssemblyState::InProgress {
                run_id,
                text,
                usage,
                poll_failures,
            },
            AssemblyEvent::ProviderFailed(f),
        ) if f.retryable && poll_failures + 1 < MAX_POLL_FAILURES => {
            Ok(TransitionResult::new(AssemblyState::InProgress {
                run_id: run_id.clone(),
                text: text.clone(),
                usage: *usage,
                poll_failures: poll_failures + 1,
            })
            .with_effect(Effect::SchedulePoll))
        }

        (_, AssemblyEvent::ProviderFailed(f)) => Ok(fail(state, failure_from_provider(&f))),

        // ============================================================
        // Cancellation and timeout
        // ============================================================
        (_, AssemblyEvent::CancelRequested) => {
            let partial = state.partial_text().to_string();
            let token_out = settled_usage(state.last_usage(), &partial).output_tokens;
            Ok(TransitionResult::new(AssemblyState::Cancelled {
                partial: partial.clone(),
            })
            .with_effects(cancel_run_effect(state))
            .with_effect(Effect::Emit(AssemblyUpdate::Cancelled { partial, token_out })))
        }

        (_, AssemblyEvent::TimedOut) => Ok(fail(
            state,
            RecordFailure::new(FailureKind::UpstreamRunFailed, "Run timed out"),
        )),

        (state, event) => Err(TransitionError::InvalidTransition(format!(
            "No transition from {state:?} on {event:?}"
        ))),
    }
}

/// Fold a run snapshot into the accumulated text
fn observe(
    run_id: &str,
    accumulated: &str,
    previous_usage: Option<RunUsage>,
    snapshot: RunSnapshot,
) -> TransitionResult {
    let usage = snapshot.usage.or(previous_usage);

    // Output is cumulative; only a strict extension yields new text. Anything
    // else would rewrite what was already emitted, so it is ignored.
    let mut effects = Vec::new();
    let text = match snapshot.output.strip_prefix(accumulated) {
        Some(delta) if !delta.is_empty() => {
            effects.push(Effect::Emit(AssemblyUpdate::Partial {
                appended: delta.to_string(),
            }));
            snapshot.output.clone()
        }
        _ => accumulated.to_string(),
    };

    match snapshot.status {
        RunStatus::Queued | RunStatus::InProgress | RunStatus::Cancelling => {
            TransitionResult::new(AssemblyState::InProgress {
                run_id: run_id.to_string(),
                text,
                usage,
                poll_failures: 0,
            })
            .with_effects(effects)
            .with_effect(Effect::SchedulePoll)
        }

        // Incomplete means the output-token ceiling cut the reply short; what
        // was produced is still the answer.
        RunStatus::Completed | RunStatus::Incomplete => {
            let usage = settled_usage(usage, &text);
            TransitionResult::new(AssemblyState::Completed {
                text: text.clone(),
                usage,
            })
            .with_effects(effects)
            .with_effect(Effect::Emit(AssemblyUpdate::Final {
                text,
                token_in: usage.input_tokens,
                token_out: usage.output_tokens,
            }))
        }

        RunStatus::Failed | RunStatus::Expired | RunStatus::Cancelled => {
            let reason = snapshot
                .failure
                .unwrap_or_else(|| format!("Run ended with status {:?}", snapshot.status));
            let failure = RecordFailure::new(FailureKind::UpstreamRunFailed, reason.clone());
            TransitionResult::new(AssemblyState::Failed {
                reason,
                partial: text.clone(),
            })
            .with_effects(effects)
            .with_effect(Effect::Emit(AssemblyUpdate::Failed {
                usage: settled_usage(usage, &text),
                failure,
                partial: text,
            }))
        }

        RunStatus::RequiresAction => {
            let reason = "Run requires tool outputs, which this assistant does not provide";
            TransitionResult::new(AssemblyState::Failed {
                reason: reason.to_string(),
                partial: text.clone(),
            })
            .with_effects(effects)
            .with_effect(Effect::CancelRun {
                run_id: run_id.to_string(),
            })
            .with_effect(Effect::Emit(AssemblyUpdate::Failed {
                failure: RecordFailure::new(FailureKind::UpstreamRunFailed, reason),
                usage: settled_usage(usage, &text),
                partial: text,
            }))
        }
    }
}

fn fail(state: &AssemblyState, failure: RecordFailure) -> TransitionResult {
    let partial = state.partial_text().to_string();
    let usage = settled_usage(state.last_usage(), &partial);
    TransitionResult::new(AssemblyState::Failed {
        reason: failure.message.clone(),
        partial: partial.clone(),
    })
    .with_effects(cancel_run_effect(state))
    .with_effect(Effect::Emit(AssemblyUpdate::Failed {
        failure,
        partial,
        usage,
    }))
}

/// Usage to charge for a finished run. Providers only report usage once a run
/// is terminal, so a run abandoned mid-stream is charged from its visible text.
fn settled_usage(reported: Option<RunUsage>, text: &str) -> RunUsage {
    reported.unwrap_or_else(|| RunUsage {
        input_tokens: 0,
        output_tokens: estimate_output_tokens(text),
    })
}

fn estimate_output_tokens(text: &str) -> u64 {
    u64::try_from(text.chars().count().div_ceil(CHARS_PER_TOKEN)).unwrap_or(u64::MAX)
}

fn cancel_run_effect(state: &AssemblyState) -> Option<Effect> {
    state.run_id().map(|run_id| Effect::CancelRun {
        run_id: run_id.to_string(),
    })
}

/// Transient failures mean the provider is unreachable; anything else is a broken run
fn failure_from_provider(f: &ProviderFailure) -> RecordFailure {
    let kind = if f.retryable {
        FailureKind::UpstreamUnavailable
    } else {
        FailureKind::UpstreamRunFailed
    };
    RecordFailure::new(kind, f.message.clone())
}
