#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::time::Duration;

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};

const DEFAULT_WARN_PER_SECOND: usize = 10;
const DEFAULT_CRASH_PER_SECOND: usize = 20;
const DEFAULT_RATE_INTERVAL_DURATION: Duration = Duration::from_secs(1);
const DEFAULT_HEARTBEAT_INTERVAL_DURATION: Duration = Duration::from_secs(30);
const DEFAULT_HEARTBEAT_TIMEOUT_DURATION: Duration = Duration::from_secs(10);
const DEFAULT_AUTH_RETRY_INTERVAL_DURATION: Duration = Duration::from_secs(5);
const DEFAULT_RECONNECT_DELAY_DURATION: Duration = Duration::from_secs(5);
const DEFAULT_REFRESH_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_REFRESH_INITIAL_BACKOFF_DURATION: Duration = Duration::from_secs(1);
const DEFAULT_REFRESH_MAX_BACKOFF_DURATION: Duration = Duration::from_secs(10);
const DEFAULT_REFRESH_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Configuration for the realtime client.
#[derive(Debug, Clone)]
pub struct Config {
    /// Outbound messages per rate interval before a warning is logged
    pub warn_per_second: usize,
    /// Outbound messages per rate interval before the process is terminated
    pub crash_per_second: usize,
    /// Width of the sliding rate window
    pub rate_interval: Duration,
    /// Interval for sending protocol-level pings
    pub heartbeat_interval: Duration,
    /// Maximum time to wait for a pong before the connection is considered dead
    pub heartbeat_timeout: Duration,
    /// How long to wait for an auth verdict before resending credentials
    pub auth_retry_interval: Duration,
    /// Delay between internally-initiated reconnect attempts
    pub reconnect_delay: Duration,
    /// Retry policy for the initial full-state refresh
    pub refresh: RefreshConfig,
    /// Subscribe to the controller's event stream as part of connecting
    pub auto_subscribe_events: bool,
    /// Run service discovery as part of connecting
    pub build_service_proxy: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            warn_per_second: DEFAULT_WARN_PER_SECOND,
            crash_per_second: DEFAULT_CRASH_PER_SECOND,
            rate_interval: DEFAULT_RATE_INTERVAL_DURATION,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL_DURATION,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT_DURATION,
            auth_retry_interval: DEFAULT_AUTH_RETRY_INTERVAL_DURATION,
            reconnect_delay: DEFAULT_RECONNECT_DELAY_DURATION,
            refresh: RefreshConfig::default(),
            auto_subscribe_events: true,
            build_service_proxy: true,
        }
    }
}

/// Retry policy for the full-state refresh on the non-realtime channel.
///
/// Unlike reconnection, refresh retries are bounded: the application cannot
/// run without a state baseline, so exhausting the budget is fatal.
#[derive(Debug, Clone)]
pub struct RefreshConfig {
    /// Attempts before the refresh is declared exhausted
    pub max_attempts: u32,
    /// Initial backoff duration for the first retry
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_REFRESH_MAX_ATTEMPTS,
            initial_backoff: DEFAULT_REFRESH_INITIAL_BACKOFF_DURATION,
            max_backoff: DEFAULT_REFRESH_MAX_BACKOFF_DURATION,
            backoff_multiplier: DEFAULT_REFRESH_BACKOFF_MULTIPLIER,
        }
    }
}

impl From<RefreshConfig> for ExponentialBackoff {
    fn from(config: RefreshConfig) -> Self {
        ExponentialBackoffBuilder::default()
            .with_initial_interval(config.initial_backoff)
            .with_max_interval(config.max_backoff)
            .with_multiplier(config.backoff_multiplier)
            .with_max_elapsed_time(None) // We handle max attempts separately
            .build()
    }
}
