use std::env;
use std::time::Duration;

use backoff::backoff::Constant;
use bon::Builder;
use strum_macros::{Display, EnumString};

use crate::Result;
use crate::error::Error;

/// Environment variable overriding the realtime endpoint.
pub const ENDPOINT_VAR: &str = "CHAT_REALTIME_WS_URL";
/// Environment variable selecting the token escaping convention (`ios`, `android`, `web`).
pub const PLATFORM_VAR: &str = "CHAT_REALTIME_PLATFORM";

pub const DEFAULT_ENDPOINT: &str = "ws://localhost:8080/cable";
const DEFAULT_HANDSHAKE_TIMEOUT_DURATION: Duration = Duration::from_secs(5);
const DEFAULT_POLL_INTERVAL_DURATION: Duration = Duration::from_millis(100);
const DEFAULT_WAIT_TIMEOUT_DURATION: Duration = Duration::from_secs(5);
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_DELAY_DURATION: Duration = Duration::from_secs(1);

/// Configuration for the connection manager.
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct Config {
    /// Base realtime URL; the token is appended as a `token` query parameter
    #[builder(into, default = DEFAULT_ENDPOINT.to_owned())]
    pub endpoint: String,
    /// Decides how the token is escaped into the endpoint
    #[builder(default)]
    pub platform: Platform,
    /// Maximum time for the socket handshake before the attempt is abandoned
    #[builder(default = DEFAULT_HANDSHAKE_TIMEOUT_DURATION)]
    pub handshake_timeout: Duration,
    /// Sleep between readiness checks in `wait_for_connection`
    #[builder(default = DEFAULT_POLL_INTERVAL_DURATION)]
    pub poll_interval: Duration,
    /// Timeout used by `wait_for_connection_default`
    #[builder(default = DEFAULT_WAIT_TIMEOUT_DURATION)]
    pub wait_timeout: Duration,
    /// Retry strategy for failed connection attempts
    #[builder(default)]
    pub retry: RetryPolicy,
    /// Which socket adapter `ConnectionManager::new` opens
    #[builder(default)]
    pub transport: TransportKind,
}

impl Default for Config {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Config {
    /// Reads [`ENDPOINT_VAR`] and [`PLATFORM_VAR`], keeping defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let endpoint = env::var(ENDPOINT_VAR).unwrap_or_else(|_| DEFAULT_ENDPOINT.to_owned());
        let platform = match env::var(PLATFORM_VAR) {
            Ok(value) => value
                .parse::<Platform>()
                .map_err(|e| Error::validation(format!("{PLATFORM_VAR}={value}: {e}")))?,
            Err(_) => Platform::default(),
        };

        let config = Self::builder()
            .endpoint(endpoint)
            .platform(platform)
            .build();
        config.validate()?;
        Ok(config)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        let url = url::Url::parse(&self.endpoint)?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(Error::validation(format!(
                "endpoint must use ws or wss, got {}",
                url.scheme()
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::validation("retry.max_attempts must be at least 1"));
        }
        Ok(())
    }
}

/// Host platform; decides the endpoint escaping convention.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Platform {
    /// Token appended verbatim
    Ios,
    /// `encodeURI` on the base, `encodeURIComponent` on the token
    #[default]
    Android,
    /// Same escaping as [`Platform::Android`]
    Web,
}

/// Socket adapter selection.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum TransportKind {
    /// Plain WebSocket, frames passed through untouched (requires the `raw` feature)
    #[default]
    Raw,
    /// ActionCable consumer semantics (requires the `cable` feature)
    Cable,
}

/// Bounded, fixed-delay retry of failed connection attempts.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per connection cycle, the first one included
    pub max_attempts: u32,
    /// Pause before each retry
    pub delay: Duration,
}

impl RetryPolicy {
    #[must_use]
    pub const fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_DELAY_DURATION)
    }
}

impl From<RetryPolicy> for Constant {
    fn from(policy: RetryPolicy) -> Self {
        Constant::new(policy.delay)
    }
}
