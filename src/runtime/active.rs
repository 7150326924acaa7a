//! In-flight runs and the live streams watching them
//!
//! A caller's runs are cancelled when their last event stream goes away, so a
//! reply nobody is listening to stops spending tokens. Runs submitted by a
//! caller who never opened a stream are left alone.

use dashmap::DashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

struct ActiveRun {
    caller_id: String,
    cancel: CancellationToken,
}

#[derive(Clone, Default)]
pub struct ActiveRuns {
    /// message id -> run awaiting or holding the caller's lock
    runs: Arc<DashMap<String, ActiveRun>>,
    /// caller id -> open event streams
    watchers: Arc<DashMap<String, usize>>,
}

impl ActiveRuns {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, message_id: &str, caller_id: &str, cancel: CancellationToken) {
        self.runs.insert(
            message_id.to_string(),
            ActiveRun {
                caller_id: caller_id.to_string(),
                cancel,
            },
        );
    }

    pub fn finish(&self, message_id: &str) {
        self.runs.remove(message_id);
    }

    /// Signal every run the caller has in flight. Returns how many were signalled.
    pub fn cancel_caller(&self, caller_id: &str) -> usize {
        let mut signalled = 0;
        for run in self.runs.iter().filter(|r| r.caller_id == caller_id) {
            run.cancel.cancel();
            signalled += 1;
        }
        signalled
    }

    /// Count an open event stream for the caller until the guard drops
    pub fn watch(&self, caller_id: &str) -> WatchGuard {
        *self.watchers.entry(caller_id.to_string()).or_insert(0) += 1;
        WatchGuard {
            runs: self.clone(),
            caller_id: caller_id.to_string(),
        }
    }

    #[cfg(test)]
    fn watcher_count(&self, caller_id: &str) -> usize {
        self.watchers.get(caller_id).map_or(0, |n| *n)
    }

    fn unwatch(&self, caller_id: &str) {
        let last = {
            let Some(mut count) = self.watchers.get_mut(caller_id) else {
                return;
            };
            *count = count.saturating_sub(1);
            *count == 0
        };
        if !last {
            return;
        }
        self.watchers.remove_if(caller_id, |_, n| *n == 0);

        let cancelled = self.cancel_caller(caller_id);
        if cancelled > 0 {
            tracing::info!(caller_id, runs = cancelled, "Last event stream closed; cancelling runs");
        }
    }
}

/// Held by an open event stream
pub struct WatchGuard {
    runs: ActiveRuns,
    caller_id: String,
}

impl Drop for WatchGuard {
    fn drop(&mut self) {
        self.runs.unwatch(&self.caller_id);
    }
}
