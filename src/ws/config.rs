#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::time::Duration;

use backoff::backoff::Backoff;
use bon::Builder;

/// Reserved heartbeat channel. Inbound frames on it are ignored.
pub const DEFAULT_CHANNEL: &str = "default";
/// Reserved channel on which the server forces the current session out.
pub const KICK_OFF_CHANNEL: &str = "kick_off";
/// Prefix of every topic the client publishes to, e.g. `socket.chat`.
pub const TOPIC_PREFIX: &str = "socket";

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_BACKOFF_UNIT_DURATION: Duration = Duration::from_secs(5);

/// Configuration for the channel socket client.
///
/// ```
/// use std::time::Duration;
/// use channel_socket::ws::config::{Config, ReconnectConfig};
///
/// let config = Config::builder()
///     .kick_off_channel("logout")
///     .reconnect(ReconnectConfig::builder().max_attempts(5).build())
///     .heartbeat_interval(Duration::from_secs(30))
///     .build();
///
/// assert_eq!(config.default_channel, "default");
/// assert_eq!(config.reconnect.max_attempts, 5);
/// ```
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct Config {
    /// Channel used for outgoing frames when none is given, and for heartbeats
    #[builder(into, default = DEFAULT_CHANNEL.to_owned())]
    pub default_channel: String,
    /// Channel whose frames terminate the session
    #[builder(into, default = KICK_OFF_CHANNEL.to_owned())]
    pub kick_off_channel: String,
    /// Prefix of published topics
    #[builder(into, default = TOPIC_PREFIX.to_owned())]
    pub topic_prefix: String,
    /// Reconnection strategy configuration
    #[builder(default)]
    pub reconnect: ReconnectConfig,
    /// Interval for heartbeat envelopes on the default channel. `None` disables them.
    pub heartbeat_interval: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Configuration for automatic reconnection behavior.
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct ReconnectConfig {
    /// Maximum number of consecutive reconnection attempts before giving up
    #[builder(default = DEFAULT_MAX_ATTEMPTS)]
    pub max_attempts: u32,
    /// Delay multiplier: attempt `n` waits `n * backoff_unit`
    #[builder(default = DEFAULT_BACKOFF_UNIT_DURATION)]
    pub backoff_unit: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Linear backoff bounded by a maximum number of attempts.
///
/// Attempt `n` (starting at 1) yields `n * unit`. Once `max_attempts` delays have been
/// handed out, [`Backoff::next_backoff`] returns `None` until [`Backoff::reset`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearBackoff {
    unit: Duration,
    max_attempts: u32,
    attempts: u32,
}

impl LinearBackoff {
    #[must_use]
    pub const fn new(unit: Duration, max_attempts: u32) -> Self {
        Self {
            unit,
            max_attempts,
            attempts: 0,
        }
    }

    /// Number of delays handed out since the last reset.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

impl Backoff for LinearBackoff {
    fn next_backoff(&mut self) -> Option<Duration> {
        if self.attempts >= self.max_attempts {
            return None;
        }
        self.attempts += 1;
        Some(self.unit.saturating_mul(self.attempts))
    }

    fn reset(&mut self) {
        self.attempts = 0;
    }
}

impl From<ReconnectConfig> for LinearBackoff {
    fn from(config: ReconnectConfig) -> Self {
        Self::new(config.backoff_unit, config.max_attempts)
    }
}
