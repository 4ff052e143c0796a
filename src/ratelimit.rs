//! Per-sender throttle for the inbound webhook
//!
//! Explicit, injected state rather than ambient process globals: the
//! webhook runs as short-lived stateless jobs, so this table is handed in
//! by the host. Best-effort only - losing it on restart drops throttling,
//! never correctness.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

/// Sliding-window counter keyed by sender identifier
pub struct RateLimiter {
    max_per_window: u32,
    window: Duration,
    hits: HashMap<String, Vec<DateTime<Utc>>>,
}

impl RateLimiter {
    pub fn new(max_per_window: u32, window_secs: i64) -> Self {
        Self {
            max_per_window,
            window: Duration::seconds(window_secs),
            hits: HashMap::new(),
        }
    }

    /// Record a hit; false means the sender is over the limit and the
    /// message should be dropped after acknowledgment.
    pub fn allow(&mut self, key: &str, now: DateTime<Utc>) -> bool {
        let cutoff = now - self.window;
        let hits = self.hits.entry(key.to_string()).or_default();
        hits.retain(|t| *t > cutoff);

        if hits.len() >= self.max_per_window as usize {
            return false;
        }
        hits.push(now);
        true
    }

    /// Drop stale keys so the table doesn't grow unbounded
    pub fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - self.window;
        self.hits.retain(|_, hits| {
            hits.retain(|t| *t > cutoff);
            !hits.is_empty()
        });
    }

    pub fn tracked_keys(&self) -> usize {
        self.hits.len()
    }
}
