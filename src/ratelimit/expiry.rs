//! Per-limiter table of window expiries.

use std::collections::HashMap;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;

/// Maps each key to the end of the window this node last opened or observed.
///
/// Scoped to one limiter, so independent limiters in the same process never
/// see each other's windows. The lock is never held across an await.
///
/// Entries are kept for `retention` past their expiry, then dropped by a
/// sweep that runs from [`record`](Self::record) at most once per
/// `retention`.
#[derive(Debug)]
pub struct ExpiryTable {
    retention: TimeDelta,
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    windows: HashMap<String, DateTime<Utc>>,
    next_sweep: Option<DateTime<Utc>>,
}

impl Inner {
    fn sweep(&mut self, now: DateTime<Utc>, retention: TimeDelta) {
        if self.next_sweep.is_some_and(|at| now < at) {
            return;
        }

        self.windows.retain(|_, expire_at| {
            expire_at
                .checked_add_signed(retention)
                .map_or(true, |end| end > now)
        });
        self.next_sweep = now.checked_add_signed(retention);
    }
}

impl ExpiryTable {
    pub fn new(retention: TimeDelta) -> Self {
        Self {
            retention,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Remember the expiry of the window for `key`, replacing any older one.
    ///
    /// `now` drives the sweep of windows that ended more than `retention`
    /// ago.
    pub fn record(&self, key: &str, expire_at: DateTime<Utc>, now: DateTime<Utc>) {
        let mut inner = self.inner.lock();
        inner.sweep(now, self.retention);
        inner.windows.insert(key.to_string(), expire_at);
    }

    pub fn lookup(&self, key: &str) -> Option<DateTime<Utc>> {
        self.inner.lock().windows.get(key).copied()
    }

    /// Number of keys with a recorded expiry.
    pub fn len(&self) -> usize {
        self.inner.lock().windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
