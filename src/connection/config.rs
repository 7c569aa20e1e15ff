#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::time::Duration;

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use bon::Builder;

const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);
const DEFAULT_MAX_BACKOFF_DURATION: Duration = Duration::from_secs(60);
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Per-connection behavior. Immutable once the manager is constructed.
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct ConnectionOptions {
    /// Reconnect automatically after an abnormal closure
    #[builder(default = true)]
    pub auto_reconnect: bool,
    /// Pause before the first reconnection attempt
    #[builder(default = DEFAULT_RECONNECT_DELAY)]
    pub reconnect_delay: Duration,
    /// Send keep-alive frames while connected
    #[builder(default = true)]
    pub keep_alive: bool,
    /// Interval between keep-alive frames
    #[builder(default = DEFAULT_KEEP_ALIVE_INTERVAL)]
    pub keep_alive_interval: Duration,
    /// Escalation policy for repeated reconnection attempts
    #[builder(default)]
    pub reconnect: ReconnectConfig,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ConnectionOptions {
    /// Backoff driving reconnection attempts, seeded with the configured
    /// reconnect delay.
    #[must_use]
    pub(crate) fn reconnect_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::default()
            .with_initial_interval(self.reconnect_delay)
            .with_max_interval(self.reconnect.max_backoff)
            .with_multiplier(self.reconnect.backoff_multiplier)
            .with_max_elapsed_time(None) // We handle max attempts separately
            .build()
    }
}

/// Configuration for automatic reconnection behavior.
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts before giving up.
    /// `None` means infinite retries.
    pub max_attempts: Option<u32>,
    /// Maximum backoff duration
    #[builder(default = DEFAULT_MAX_BACKOFF_DURATION)]
    pub max_backoff: Duration,
    /// Multiplier for exponential backoff
    #[builder(default = DEFAULT_BACKOFF_MULTIPLIER)]
    pub backoff_multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}
