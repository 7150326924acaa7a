//! Fixed-window request limiter keyed by caller

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Outcome of an admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Admitted; `remaining` requests are left in the current window
    Allowed { remaining: u32 },
    /// Rejected until the window rolls over
    Denied { retry_after: Duration },
}

/// Per-caller request counter over a fixed window
///
/// Uses `DashMap`'s entry API so each caller's read-modify-write is atomic
/// without a global lock.
#[derive(Clone)]
pub struct RateLimiter {
    /// caller -> (`count`, `window_start`)
    state: Arc<DashMap<String, (u32, Instant)>>,
    cap: u32,
    window: Duration,
}

/// Stale-entry sweep only kicks in once this many callers are tracked
const CLEANUP_THRESHOLD: usize = 10_000;

impl RateLimiter {
    pub fn new(cap: u32, window: Duration) -> Self {
        Self {
            state: Arc::new(DashMap::new()),
            cap,
            window,
        }
    }

    pub fn admit(&self, caller_id: &str) -> Admission {
        self.admit_at(caller_id, Instant::now())
    }

    /// Admission check against an explicit clock reading
    pub fn admit_at(&self, caller_id: &str, now: Instant) -> Admission {
        let mut entry = self
            .state
            .entry(caller_id.to_string())
            .or_insert((0, now));
        let (count, window_start) = entry.value_mut();

        if now.saturating_duration_since(*window_start) >= self.window {
            *count = 0;
            *window_start = now;
        }

        let admission = if *count >= self.cap {
            let elapsed = now.saturating_duration_since(*window_start);
            Admission::Denied {
                retry_after: self.window.saturating_sub(elapsed),
            }
        } else {
            *count += 1;
            Admission::Allowed {
                remaining: self.cap - *count,
            }
        };
        drop(entry);

        if self.state.len() > CLEANUP_THRESHOLD {
            self.cleanup_expired(now);
        }

        if let Admission::Denied { retry_after } = admission {
            tracing::info!(
                caller_id,
                retry_after_secs = retry_after.as_secs(),
                "Rate limit exceeded"
            );
        }
        admission
    }

    /// Requests left in the caller's current window, without consuming one
    pub fn remaining(&self, caller_id: &str) -> u32 {
        let now = Instant::now();
        self.state.get(caller_id).map_or(self.cap, |entry| {
            let (count, window_start) = *entry.value();
            if now.saturating_duration_since(window_start) >= self.window {
                self.cap
            } else {
                self.cap.saturating_sub(count)
            }
        })
    }

    fn cleanup_expired(&self, now: Instant) {
        self.state
            .retain(|_, (_, start)| now.saturating_duration_since(*start) < self.window);
    }
}
