//! Fixed-window call counter keyed by caller.
//!
//! One [`RateLimiter`] instance is shared by reference between everything
//! that needs to pace against the same budget: the engine uses one for
//! outbound enrichment calls, the HTTP server uses a separate one to admit
//! inbound run requests. Stale windows are dropped explicitly via
//! [`RateLimiter::purge_expired`] or [`RateLimiter::clear`]; there is no
//! background sweeper.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    reset_at: Instant,
}

/// Per-key fixed-length window counter.
#[derive(Debug, Default)]
pub struct RateLimiter {
    windows: Mutex<HashMap<String, Window>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a call for `key` and report whether it fits the budget.
    pub fn allow(&self, key: &str, limit: u32, window: Duration) -> bool {
        self.allow_at(key, limit, window, Instant::now())
    }

    /// [`allow`](Self::allow) with an explicit clock reading.
    ///
    /// When `now` has passed the key's reset time the counter restarts at 1
    /// and a new window begins. Otherwise the counter increments and the
    /// call is allowed while the count stays within `limit`.
    pub fn allow_at(&self, key: &str, limit: u32, window: Duration, now: Instant) -> bool {
        let mut windows = self.lock();
        match windows.get_mut(key) {
            Some(w) if now < w.reset_at => {
                w.count = w.count.saturating_add(1);
                w.count <= limit
            }
            _ => {
                windows.insert(
                    key.to_string(),
                    Window {
                        count: 1,
                        reset_at: now + window,
                    },
                );
                limit >= 1
            }
        }
    }

    /// Time left until `key`'s current window resets, if one is open.
    pub fn retry_after(&self, key: &str) -> Option<Duration> {
        self.retry_after_at(key, Instant::now())
    }

    pub fn retry_after_at(&self, key: &str, now: Instant) -> Option<Duration> {
        self.lock()
            .get(key)
            .filter(|w| now < w.reset_at)
            .map(|w| w.reset_at - now)
    }

    /// Forget the window for one key.
    pub fn reset(&self, key: &str) {
        self.lock().remove(key);
    }

    /// Forget every window.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Drop windows whose reset time has passed. Returns how many were removed.
    pub fn purge_expired(&self, now: Instant) -> usize {
        let mut windows = self.lock();
        let before = windows.len();
        windows.retain(|_, w| now < w.reset_at);
        before - windows.len()
    }

    pub fn tracked_keys(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Window>> {
        // A panic while holding the lock leaves only counters behind; keep going.
        self.windows.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
