//! Reconnect delay computation.
//!
//! Delays grow exponentially from the initial delay, gain a random jitter of
//! up to `jitter_ratio` of the base, and are clamped to the maximum. Since the
//! ratio is below 1, a jittered delay never exceeds the next attempt's base,
//! so consecutive delays never shrink.

use std::time::Duration;

use crate::config::RealtimeConfig;

/// Delay chosen for one reconnect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPlan {
    /// How long to wait before the attempt.
    pub delay: Duration,
    /// Whether the resource cooldown floor applied.
    pub resource_constrained: bool,
}

/// Reconnect policy derived from a [`RealtimeConfig`].
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    initial: Duration,
    max: Duration,
    jitter_ratio: f64,
    max_attempts: u32,
    min_spacing: Duration,
    resource_cooldown: Duration,
    resource_markers: Vec<String>,
}

impl ReconnectPolicy {
    pub fn from_config(config: &RealtimeConfig) -> Self {
        Self {
            initial: config.initial_reconnect_delay,
            max: config.max_reconnect_delay,
            jitter_ratio: config.jitter_ratio,
            max_attempts: config.max_reconnect_attempts,
            min_spacing: config.min_reconnect_spacing,
            resource_cooldown: config.resource_cooldown,
            resource_markers: config
                .resource_markers
                .iter()
                .map(|m| m.to_lowercase())
                .collect(),
        }
    }

    /// Base delay of the zero-based `attempt`, before jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.initial.saturating_mul(factor).min(self.max)
    }

    /// Delay of `attempt` with `sample` in `[0, 1)` scaling the jitter.
    pub fn jittered_delay(&self, attempt: u32, sample: f64) -> Duration {
        let base = self.base_delay(attempt);
        let sample = sample.clamp(0.0, 1.0);
        let jitter = base.mul_f64(self.jitter_ratio * sample);
        base.saturating_add(jitter).min(self.max)
    }

    /// Whether an error text reports server-side resource exhaustion.
    pub fn is_resource_exhausted(&self, error: &str) -> bool {
        let error = error.to_lowercase();
        self.resource_markers.iter().any(|m| error.contains(m.as_str()))
    }

    /// Plan the delay before `attempt`.
    ///
    /// `since_connected` is the time since the last successful connect, if
    /// any. The delay is raised to the resource cooldown when `error` reports
    /// exhaustion, and to whatever remains of the minimum spacing.
    pub fn plan(
        &self,
        attempt: u32,
        error: Option<&str>,
        since_connected: Option<Duration>,
        sample: f64,
    ) -> RetryPlan {
        let mut delay = self.jittered_delay(attempt, sample);

        let resource_constrained = error.is_some_and(|e| self.is_resource_exhausted(e));
        if resource_constrained {
            delay = delay.max(self.resource_cooldown);
        }

        if let Some(elapsed) = since_connected {
            delay = delay.max(self.min_spacing.saturating_sub(elapsed));
        }

        RetryPlan {
            delay,
            resource_constrained,
        }
    }

    /// Whether `attempts` consecutive failures exhaust the budget.
    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}
