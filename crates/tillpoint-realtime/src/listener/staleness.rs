//! Per-order suppression of rapid repeat notifications.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

/// Entries are pruned once the map grows past this size.
const PRUNE_THRESHOLD: usize = 256;

/// Drops a notification when the previous accepted one for the same id is
/// younger than the window.
#[derive(Debug)]
pub(crate) struct StalenessFilter {
    window: Duration,
    last_seen: HashMap<String, Instant>,
}

impl StalenessFilter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_seen: HashMap::new(),
        }
    }

    /// Accept or drop a notification for `id` seen at `now`.
    ///
    /// Dropped notifications do not extend the window.
    pub fn admit(&mut self, id: &str, now: Instant) -> bool {
        if let Some(&seen) = self.last_seen.get(id) {
            if now.duration_since(seen) < self.window {
                return false;
            }
        }
        if self.last_seen.len() >= PRUNE_THRESHOLD {
            self.prune(now);
        }
        self.last_seen.insert(id.to_string(), now);
        true
    }

    /// Forget ids whose window has passed.
    pub fn prune(&mut self, now: Instant) {
        let window = self.window;
        self.last_seen
            .retain(|_, seen| now.duration_since(*seen) < window);
    }

    pub fn clear(&mut self) {
        self.last_seen.clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.last_seen.len()
    }
}
