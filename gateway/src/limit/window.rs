//! Fixed-window request counter keyed by identity.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

/// Counter state observed right after an increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSnapshot {
    /// Requests counted in the current window, including this one
    pub count: u32,
    /// Instant at which the current window ends
    pub reset_at: Instant,
}

impl WindowSnapshot {
    /// Time left in the window as seen from `now`.
    pub fn remaining_window(&self, now: Instant) -> Duration {
        self.reset_at.saturating_duration_since(now)
    }
}

#[derive(Debug)]
struct IdentityWindow {
    count: u32,
    reset_at: Instant,
}

/// Per-identity fixed-window counters.
///
/// Windows are created lazily on the first request from an identity. A
/// request arriving exactly at `reset_at` opens a new window.
#[derive(Debug, Clone, Default)]
pub struct RateWindowCounter {
    windows: Arc<Mutex<HashMap<String, IdentityWindow>>>,
}

impl RateWindowCounter {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, IdentityWindow>> {
        self.windows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Count one request for `identity` in a window of length `window`.
    ///
    /// The window length only matters when a new window is opened.
    pub fn increment(&self, identity: &str, window: Duration) -> WindowSnapshot {
        let now = Instant::now();
        let mut windows = self.lock();

        let entry = windows
            .entry(identity.to_string())
            .or_insert_with(|| IdentityWindow {
                count: 0,
                reset_at: now + window,
            });

        if now >= entry.reset_at {
            entry.count = 0;
            entry.reset_at = now + window;
        }

        entry.count = entry.count.saturating_add(1);

        WindowSnapshot {
            count: entry.count,
            reset_at: entry.reset_at,
        }
    }

    /// Give back one slot, e.g. for a request rejected before being served.
    pub fn decrement(&self, identity: &str) {
        if let Some(entry) = self.lock().get_mut(identity) {
            entry.count = entry.count.saturating_sub(1);
        }
    }

    /// Forget `identity`'s window immediately. Returns whether one existed.
    pub fn reset(&self, identity: &str) -> bool {
        self.lock().remove(identity).is_some()
    }

    /// Current state for `identity`, if it has a live window.
    pub fn peek(&self, identity: &str) -> Option<WindowSnapshot> {
        let now = Instant::now();
        self.lock()
            .get(identity)
            .filter(|w| now < w.reset_at)
            .map(|w| WindowSnapshot {
                count: w.count,
                reset_at: w.reset_at,
            })
    }

    /// Drop windows that ended more than `grace` ago. Returns how many went.
    pub fn sweep_expired(&self, grace: Duration) -> usize {
        let now = Instant::now();
        let mut windows = self.lock();
        let before = windows.len();

        windows.retain(|_, w| now < w.reset_at + grace);

        let removed = before - windows.len();
        if removed > 0 {
            debug!(removed = removed, tracked = windows.len(), "rate_windows_swept");
        }
        removed
    }

    /// Number of identities currently tracked.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
