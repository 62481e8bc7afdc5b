//! Realtime configuration.

use std::time::Duration;

use tillpoint_proto::{ORDERS_TABLE, ORDER_ITEMS_TABLE};

use crate::error::Error;
use crate::listener::UpdateGatePolicy;

/// Default name of the shared realtime channel.
pub const DEFAULT_CHANNEL_NAME: &str = "tillpoint-realtime";

/// Default delay before the first reconnect attempt.
pub const DEFAULT_INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Default ceiling for the reconnect delay.
pub const DEFAULT_MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Default upper bound of the random jitter, as a fraction of the base delay.
pub const DEFAULT_JITTER_RATIO: f64 = 0.2;

/// Default number of consecutive failures after which reconnecting stops.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Default quiet period after which failures no longer count as consecutive.
pub const DEFAULT_ATTEMPT_RESET_AFTER: Duration = Duration::from_secs(300);

/// Default minimum spacing between a successful connect and the next attempt.
pub const DEFAULT_MIN_RECONNECT_SPACING: Duration = Duration::from_secs(2);

/// Default cooldown floor when the server reports resource exhaustion.
pub const DEFAULT_RESOURCE_COOLDOWN: Duration = Duration::from_secs(30);

/// Default bound on waiting for the channel's `Subscribed` acknowledgment.
pub const DEFAULT_SETUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Default delay before tearing down a channel with no subscriptions left.
pub const DEFAULT_TEARDOWN_GRACE: Duration = Duration::from_secs(1);

/// Default number of live subscriptions above which `subscribe` pauses.
pub const DEFAULT_SUBSCRIPTION_CEILING: usize = 20;

/// Default pause applied to `subscribe` above the ceiling.
pub const DEFAULT_BACKPRESSURE_PAUSE: Duration = Duration::from_millis(100);

/// Error fragments that identify a server-side resource exhaustion.
pub const DEFAULT_RESOURCE_MARKERS: &[&str] = &[
    "too many connections",
    "too_many_connections",
    "too many channels",
    "too_many_channels",
    "resource exhausted",
    "connection limit",
];

/// Configuration of the channel connection manager.
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Name of the single multiplexed channel.
    pub channel_name: String,
    /// Schema used by subscriptions that do not name one.
    pub schema: String,
    /// Delay before the first reconnect attempt; doubles per attempt.
    pub initial_reconnect_delay: Duration,
    /// Upper bound of the computed reconnect delay.
    pub max_reconnect_delay: Duration,
    /// Upper bound of the random jitter added to each delay, as a fraction of
    /// the base delay. Must be below 1.
    pub jitter_ratio: f64,
    /// Consecutive failures after which the manager stops reconnecting.
    pub max_reconnect_attempts: u32,
    /// Failures further apart than this are not consecutive.
    pub attempt_reset_after: Duration,
    /// Minimum time between a successful connect and the next attempt.
    pub min_reconnect_spacing: Duration,
    /// Minimum delay once the server reports resource exhaustion.
    pub resource_cooldown: Duration,
    /// Case-insensitive error fragments that signal resource exhaustion.
    pub resource_markers: Vec<String>,
    /// Bound on waiting for the `Subscribed` acknowledgment.
    pub setup_timeout: Duration,
    /// Delay before tearing down an unused channel.
    pub teardown_grace: Duration,
    /// Live subscription count at which `subscribe` starts pausing.
    pub subscription_ceiling: usize,
    /// Pause applied to `subscribe` at or above the ceiling.
    pub backpressure_pause: Duration,
}

impl RealtimeConfig {
    /// Create a configuration with default settings.
    pub fn new() -> Self {
        Self {
            channel_name: DEFAULT_CHANNEL_NAME.to_string(),
            schema: tillpoint_proto::DEFAULT_SCHEMA.to_string(),
            initial_reconnect_delay: DEFAULT_INITIAL_RECONNECT_DELAY,
            max_reconnect_delay: DEFAULT_MAX_RECONNECT_DELAY,
            jitter_ratio: DEFAULT_JITTER_RATIO,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            attempt_reset_after: DEFAULT_ATTEMPT_RESET_AFTER,
            min_reconnect_spacing: DEFAULT_MIN_RECONNECT_SPACING,
            resource_cooldown: DEFAULT_RESOURCE_COOLDOWN,
            resource_markers: DEFAULT_RESOURCE_MARKERS
                .iter()
                .map(|m| m.to_string())
                .collect(),
            setup_timeout: DEFAULT_SETUP_TIMEOUT,
            teardown_grace: DEFAULT_TEARDOWN_GRACE,
            subscription_ceiling: DEFAULT_SUBSCRIPTION_CEILING,
            backpressure_pause: DEFAULT_BACKPRESSURE_PAUSE,
        }
    }

    /// Set the channel name.
    pub fn with_channel_name(mut self, name: impl Into<String>) -> Self {
        self.channel_name = name.into();
        self
    }

    /// Set the default schema.
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    /// Set the initial and maximum reconnect delays.
    pub fn with_reconnect_delays(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_reconnect_delay = initial;
        self.max_reconnect_delay = max;
        self
    }

    /// Set the jitter ratio.
    pub fn with_jitter_ratio(mut self, ratio: f64) -> Self {
        self.jitter_ratio = ratio;
        self
    }

    /// Set the maximum number of consecutive reconnect attempts.
    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    /// Set the quiet period after which the attempt counter resets.
    pub fn with_attempt_reset_after(mut self, period: Duration) -> Self {
        self.attempt_reset_after = period;
        self
    }

    /// Set the minimum spacing after a successful connect.
    pub fn with_min_reconnect_spacing(mut self, spacing: Duration) -> Self {
        self.min_reconnect_spacing = spacing;
        self
    }

    /// Set the resource exhaustion cooldown floor.
    pub fn with_resource_cooldown(mut self, cooldown: Duration) -> Self {
        self.resource_cooldown = cooldown;
        self
    }

    /// Set the channel setup timeout.
    pub fn with_setup_timeout(mut self, timeout: Duration) -> Self {
        self.setup_timeout = timeout;
        self
    }

    /// Set the teardown grace delay.
    pub fn with_teardown_grace(mut self, grace: Duration) -> Self {
        self.teardown_grace = grace;
        self
    }

    /// Set the subscription ceiling and the pause applied above it.
    pub fn with_backpressure(mut self, ceiling: usize, pause: Duration) -> Self {
        self.subscription_ceiling = ceiling;
        self.backpressure_pause = pause;
        self
    }

    /// Check the configuration for values the reconnect loop cannot work with.
    pub fn validate(&self) -> Result<(), Error> {
        if self.channel_name.is_empty() {
            return Err(Error::Config("channel name must not be empty".to_string()));
        }
        if self.initial_reconnect_delay.is_zero() {
            return Err(Error::Config(
                "initial reconnect delay must be positive".to_string(),
            ));
        }
        if self.initial_reconnect_delay > self.max_reconnect_delay {
            return Err(Error::Config(format!(
                "initial reconnect delay {:?} exceeds maximum {:?}",
                self.initial_reconnect_delay, self.max_reconnect_delay
            )));
        }
        if !(0.0..1.0).contains(&self.jitter_ratio) {
            return Err(Error::Config(format!(
                "jitter ratio must be in [0, 1), got {}",
                self.jitter_ratio
            )));
        }
        if self.max_reconnect_attempts == 0 {
            return Err(Error::Config(
                "max reconnect attempts must be at least 1".to_string(),
            ));
        }
        if self.setup_timeout.is_zero() {
            return Err(Error::Config("setup timeout must be positive".to_string()));
        }
        if self.attempt_reset_after.is_zero() {
            return Err(Error::Config(
                "attempt reset period must be positive".to_string(),
            ));
        }
        if self.subscription_ceiling == 0 {
            return Err(Error::Config(
                "subscription ceiling must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Where the order stream fetches full orders from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HydrationSource {
    /// A single-row table query with the given select list.
    Query { select: String },
    /// A stored procedure taking the order id as a named argument.
    Procedure { name: String, id_arg: String },
}

impl Default for HydrationSource {
    fn default() -> Self {
        HydrationSource::Query {
            select: format!("*, {}(*)", ORDER_ITEMS_TABLE),
        }
    }
}

/// Default window within which repeated notifications for one order are dropped.
pub const DEFAULT_STALENESS_WINDOW: Duration = Duration::from_millis(500);

/// Default timeout of one hydration fetch.
pub const DEFAULT_HYDRATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Default number of hydration retries after the first attempt.
pub const DEFAULT_HYDRATION_RETRIES: u32 = 2;

/// Default pause between hydration attempts; grows linearly per retry.
pub const DEFAULT_HYDRATION_BACKOFF: Duration = Duration::from_millis(250);

/// Configuration of an order stream.
#[derive(Debug, Clone)]
pub struct OrderStreamConfig {
    /// Table carrying orders.
    pub table: String,
    /// Column holding the tenant scope.
    pub scope_column: String,
    /// Window within which a second notification for the same order is dropped.
    pub staleness_window: Duration,
    /// Timeout of one hydration fetch.
    pub hydration_timeout: Duration,
    /// Hydration retries after the first attempt.
    pub hydration_retries: u32,
    /// Pause between hydration attempts.
    pub hydration_backoff: Duration,
    /// Where full orders come from.
    pub hydration: HydrationSource,
    /// Which updates reach the feature.
    pub gate: UpdateGatePolicy,
}

impl OrderStreamConfig {
    /// Create a configuration with default settings.
    pub fn new() -> Self {
        Self {
            table: ORDERS_TABLE.to_string(),
            scope_column: "franchise_id".to_string(),
            staleness_window: DEFAULT_STALENESS_WINDOW,
            hydration_timeout: DEFAULT_HYDRATION_TIMEOUT,
            hydration_retries: DEFAULT_HYDRATION_RETRIES,
            hydration_backoff: DEFAULT_HYDRATION_BACKOFF,
            hydration: HydrationSource::default(),
            gate: UpdateGatePolicy::default(),
        }
    }

    /// Set the scope column.
    pub fn with_scope_column(mut self, column: impl Into<String>) -> Self {
        self.scope_column = column.into();
        self
    }

    /// Set the staleness window.
    pub fn with_staleness_window(mut self, window: Duration) -> Self {
        self.staleness_window = window;
        self
    }

    /// Set the hydration timeout, retry budget and backoff.
    pub fn with_hydration_retry(mut self, timeout: Duration, retries: u32, backoff: Duration) -> Self {
        self.hydration_timeout = timeout;
        self.hydration_retries = retries;
        self.hydration_backoff = backoff;
        self
    }

    /// Hydrate through a stored procedure instead of a table query.
    pub fn with_procedure_hydration(mut self, name: impl Into<String>, id_arg: impl Into<String>) -> Self {
        self.hydration = HydrationSource::Procedure {
            name: name.into(),
            id_arg: id_arg.into(),
        };
        self
    }

    /// Set the update gate policy.
    pub fn with_gate(mut self, gate: UpdateGatePolicy) -> Self {
        self.gate = gate;
        self
    }
}

impl Default for OrderStreamConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Realtime command line arguments, meant to be flattened into a host
/// application's own parser.
#[derive(Debug, Clone, clap::Args)]
pub struct RealtimeArgs {
    /// Name of the shared realtime channel.
    #[arg(long, default_value = DEFAULT_CHANNEL_NAME)]
    pub realtime_channel: String,

    /// Delay (ms) before the first reconnect attempt.
    #[arg(long, default_value_t = 1_000)]
    pub reconnect_initial_delay_ms: u64,

    /// Maximum reconnect delay (ms).
    #[arg(long, default_value_t = 30_000)]
    pub reconnect_max_delay_ms: u64,

    /// Consecutive failures after which reconnecting stops.
    #[arg(long, default_value_t = DEFAULT_MAX_RECONNECT_ATTEMPTS)]
    pub reconnect_max_attempts: u32,

    /// Timeout (ms) for the channel's subscribe acknowledgment.
    #[arg(long, default_value_t = 10_000)]
    pub channel_setup_timeout_ms: u64,

    /// Live subscriptions at which new subscriptions are paused.
    #[arg(long, default_value_t = DEFAULT_SUBSCRIPTION_CEILING)]
    pub subscription_ceiling: usize,

    /// Window (ms) within which repeated order notifications are dropped.
    #[arg(long, default_value_t = 500)]
    pub staleness_window_ms: u64,

    /// Timeout (ms) of one order hydration fetch.
    #[arg(long, default_value_t = 5_000)]
    pub hydration_timeout_ms: u64,

    /// Hydration retries after the first attempt.
    #[arg(long, default_value_t = DEFAULT_HYDRATION_RETRIES)]
    pub hydration_retries: u32,
}

impl From<&RealtimeArgs> for RealtimeConfig {
    fn from(args: &RealtimeArgs) -> Self {
        RealtimeConfig::new()
            .with_channel_name(args.realtime_channel.clone())
            .with_reconnect_delays(
                Duration::from_millis(args.reconnect_initial_delay_ms),
                Duration::from_millis(args.reconnect_max_delay_ms),
            )
            .with_max_reconnect_attempts(args.reconnect_max_attempts)
            .with_setup_timeout(Duration::from_millis(args.channel_setup_timeout_ms))
            .with_backpressure(args.subscription_ceiling, DEFAULT_BACKPRESSURE_PAUSE)
    }
}

impl From<&RealtimeArgs> for OrderStreamConfig {
    fn from(args: &RealtimeArgs) -> Self {
        OrderStreamConfig::new()
            .with_staleness_window(Duration::from_millis(args.staleness_window_ms))
            .with_hydration_retry(
                Duration::from_millis(args.hydration_timeout_ms),
                args.hydration_retries,
                DEFAULT_HYDRATION_BACKOFF,
            )
    }
}
