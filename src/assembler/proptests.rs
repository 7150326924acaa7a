//! Property-based tests for the assembly state machine

use super::effect::{AssemblyUpdate, Effect};
use super::event::{AssemblyEvent, ProviderFailure};
use super::state::AssemblyState;
use super::transition::*;
use crate::provider::{RunSnapshot, RunStatus, RunUsage};
use proptest::prelude::*;

// ============================================================================
// Generators
// ============================================================================

fn started() -> AssemblyState {
    AssemblyState::RunStarted {
        run_id: "run_1".to_string(),
        poll_failures: 0,
    }
}

fn arb_chunks() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec("[a-zA-Z0-9 .,]{0,12}", 0..12)
}

fn arb_status() -> impl Strategy<Value = RunStatus> {
    prop_oneof![
        4 => Just(RunStatus::InProgress),
        1 => Just(RunStatus::Queued),
        1 => Just(RunStatus::Completed),
        1 => Just(RunStatus::Failed),
        1 => Just(RunStatus::Expired),
        1 => Just(RunStatus::Incomplete),
        1 => Just(RunStatus::RequiresAction),
    ]
}

fn arb_usage() -> impl Strategy<Value = Option<RunUsage>> {
    prop::option::of((0u64..5000, 0u64..2000).prop_map(|(input_tokens, output_tokens)| {
        RunUsage {
            input_tokens,
            output_tokens,
        }
    }))
}

/// Snapshots with arbitrary, possibly non-cumulative, output
fn arb_snapshot() -> impl Strategy<Value = RunSnapshot> {
    (arb_status(), "[ab ]{0,10}", arb_usage()).prop_map(|(status, output, usage)| RunSnapshot {
        status,
        output,
        usage,
        failure: None,
    })
}

fn arb_event() -> impl Strategy<Value = AssemblyEvent> {
    prop_oneof![
        8 => arb_snapshot().prop_map(AssemblyEvent::Snapshot),
        1 => any::<bool>().prop_map(|retryable| AssemblyEvent::ProviderFailed(ProviderFailure {
            retryable,
            message: "boom".to_string(),
        })),
        1 => Just(AssemblyEvent::CancelRequested),
        1 => Just(AssemblyEvent::TimedOut),
    ]
}

fn emitted(effects: &[Effect]) -> impl Iterator<Item = &AssemblyUpdate> {
    effects.iter().filter_map(|e| match e {
        Effect::Emit(update) => Some(update),
        _ => None,
    })
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    /// Feeding cumulative output chunk by chunk yields partials that concatenate
    /// to the final text.
    #[test]
    fn prop_partials_concatenate_to_final(chunks in arb_chunks(), out in 0u64..2000) {
        let mut state = started();
        let mut cumulative = String::new();
        let mut seen = String::new();

        for chunk in &chunks {
            cumulative.push_str(chunk);
            let r = transition(&state, AssemblyEvent::Snapshot(RunSnapshot::in_progress(cumulative.clone()))).unwrap();
            for update in emitted(&r.effects) {
                if let AssemblyUpdate::Partial { appended } = update {
                    seen.push_str(appended);
                }
            }
            state = r.new_state;
        }

        let usage = RunUsage { input_tokens: 1, output_tokens: out };
        let r = transition(&state, AssemblyEvent::Snapshot(RunSnapshot::completed(cumulative.clone(), usage))).unwrap();
        let mut final_text = None;
        for update in emitted(&r.effects) {
            match update {
                AssemblyUpdate::Partial { appended } => seen.push_str(appended),
                AssemblyUpdate::Final { text, token_out, .. } => {
                    prop_assert_eq!(*token_out, out);
                    final_text = Some(text.clone());
                }
                other => prop_assert!(false, "unexpected update {:?}", other),
            }
        }

        prop_assert_eq!(final_text.as_deref(), Some(cumulative.as_str()));
        prop_assert_eq!(seen, cumulative);
    }

    /// For any event sequence the accumulated text only ever grows by appending.
    #[test]
    fn prop_partial_text_is_append_only(events in prop::collection::vec(arb_event(), 0..30)) {
        let mut state = started();
        for event in events {
            let Ok(r) = transition(&state, event) else {
                prop_assert!(state.is_terminal());
                continue;
            };
            prop_assert!(
                r.new_state.partial_text().starts_with(state.partial_text()),
                "{:?} is not an extension of {:?}", r.new_state.partial_text(), state.partial_text()
            );
            state = r.new_state;
        }
    }

    /// Exactly one terminal update is emitted over the life of an assembly,
    /// and nothing after it.
    #[test]
    fn prop_single_terminal_update(events in prop::collection::vec(arb_event(), 0..30)) {
        let mut state = started();
        let mut terminal_updates = 0;
        for event in events {
            let Ok(r) = transition(&state, event) else { continue };
            for update in emitted(&r.effects) {
                prop_assert_eq!(terminal_updates, 0, "update after terminal: {:?}", update);
                if update.is_terminal() {
                    terminal_updates += 1;
                }
            }
            state = r.new_state;
        }
        prop_assert_eq!(terminal_updates, usize::from(state.is_terminal()));
    }

    /// Terminal states absorb every event.
    #[test]
    fn prop_terminal_states_reject_events(event in arb_event(), partial in "[a-z ]{0,20}") {
        for state in [
            AssemblyState::Completed { text: partial.clone(), usage: RunUsage::default() },
            AssemblyState::Failed { reason: "x".to_string(), partial: partial.clone() },
            AssemblyState::Cancelled { partial: partial.clone() },
        ] {
            prop_assert_eq!(transition(&state, event.clone()).unwrap_err(), TransitionError::AlreadyTerminal);
        }
    }

    /// Cancellation always ends in Cancelled, carrying the text accumulated so far.
    #[test]
    fn prop_cancel_keeps_partial(chunks in arb_chunks()) {
        let mut state = started();
        let mut cumulative = String::new();
        for chunk in &chunks {
            cumulative.push_str(chunk);
            state = transition(&state, AssemblyEvent::Snapshot(RunSnapshot::in_progress(cumulative.clone()))).unwrap().new_state;
        }
        let r = transition(&state, AssemblyEvent::CancelRequested).unwrap();
        prop_assert_eq!(r.new_state, AssemblyState::Cancelled { partial: cumulative });
    }
}
