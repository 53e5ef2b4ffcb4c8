//! HA manager configuration
//!
//! Plain serde structs; loading them from a file is left to the embedding
//! process. Durations are written the way Consul expects them (`"5s"`,
//! `"500ms"`, `"1m30s"`) and parsed once here, keeping the textual form for the
//! provider and the [`Duration`] for local timing.

use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::time::Duration;

use hamgr_consul_client::ConsulClientConfig;
use serde::{Deserialize, Deserializer, Serialize};

/// Interval between two heartbeat iterations
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3);

/// Extra wait after check registration so the first check run can complete
pub const CHECK_PROPAGATION_MARGIN: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid duration '{0}'")]
pub struct DurationParseError(String);

/// Duration written as a Consul/Go duration string
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "DurationRepr", into = "String")]
pub struct ConsulDuration {
    duration: Duration,
    text: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DurationRepr {
    Text(String),
    Seconds(u64),
}

impl TryFrom<DurationRepr> for ConsulDuration {
    type Error = DurationParseError;

    fn try_from(value: DurationRepr) -> Result<Self, Self::Error> {
        match value {
            DurationRepr::Text(s) => s.parse(),
            DurationRepr::Seconds(secs) => Ok(ConsulDuration::from_secs(secs)),
        }
    }
}

impl From<ConsulDuration> for String {
    fn from(value: ConsulDuration) -> Self {
        value.text
    }
}

impl ConsulDuration {
    pub fn from_secs(secs: u64) -> Self {
        Self {
            duration: Duration::from_secs(secs),
            text: format!("{}s", secs),
        }
    }

    pub fn as_duration(&self) -> Duration {
        self.duration
    }

    /// Textual form sent to the provider
    pub fn as_str(&self) -> &str {
        &self.text
    }
}

impl Display for ConsulDuration {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.text)
    }
}

impl FromStr for ConsulDuration {
    type Err = DurationParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(DurationParseError(s.to_string()));
        }

        // Bare numbers are seconds
        if let Ok(secs) = trimmed.parse::<u64>() {
            return Ok(ConsulDuration::from_secs(secs));
        }

        let mut total = Duration::ZERO;
        let mut rest = trimmed;
        while !rest.is_empty() {
            let digits = rest
                .find(|c: char| !c.is_ascii_digit())
                .ok_or_else(|| DurationParseError(s.to_string()))?;
            if digits == 0 {
                return Err(DurationParseError(s.to_string()));
            }
            let value: u64 = rest[..digits]
                .parse()
                .map_err(|_| DurationParseError(s.to_string()))?;
            rest = &rest[digits..];

            let unit_len = rest
                .find(|c: char| c.is_ascii_digit())
                .unwrap_or(rest.len());
            let unit = match &rest[..unit_len] {
                "ms" => Some(Duration::from_millis(value)),
                "s" => Some(Duration::from_secs(value)),
                "m" => value.checked_mul(60).map(Duration::from_secs),
                "h" => value.checked_mul(3600).map(Duration::from_secs),
                _ => None,
            }
            .ok_or_else(|| DurationParseError(s.to_string()))?;
            total = total
                .checked_add(unit)
                .ok_or_else(|| DurationParseError(s.to_string()))?;
            rest = &rest[unit_len..];
        }

        Ok(ConsulDuration {
            duration: total,
            text: trimmed.to_string(),
        })
    }
}

/// Health check the lock provider runs against this instance
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    /// Scheme and authority the provider uses, e.g. `http://10.0.0.1:8080`
    pub host: String,
    /// Path served locally, never proxied
    pub path: String,
    pub timeout: ConsulDuration,
    pub interval: ConsulDuration,
}

impl HealthCheckConfig {
    pub fn url(&self) -> String {
        format!("{}{}", self.host.trim_end_matches('/'), self.path)
    }
}

/// Header names allowed across the proxy boundary
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HttpHeaders {
    #[serde(default)]
    pub request: Vec<String>,
    #[serde(default)]
    pub response: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HaManagerConfig {
    pub health_check: HealthCheckConfig,
    #[serde(default)]
    pub http_headers: HttpHeaders,
    #[serde(
        default = "default_heartbeat_interval",
        deserialize_with = "non_zero_interval"
    )]
    pub heartbeat_interval: ConsulDuration,
    /// Fail `setup` when check registration fails instead of carrying on to
    /// session creation
    #[serde(default)]
    pub strict_setup: bool,
}

fn default_heartbeat_interval() -> ConsulDuration {
    ConsulDuration::from_secs(DEFAULT_HEARTBEAT_INTERVAL.as_secs())
}

// A zero period would spin the heartbeat against the provider
fn non_zero_interval<'de, D>(deserializer: D) -> Result<ConsulDuration, D::Error>
where
    D: Deserializer<'de>,
{
    let interval = ConsulDuration::deserialize(deserializer)?;
    if interval.as_duration().is_zero() {
        return Err(serde::de::Error::custom(
            "heartbeat_interval must be greater than zero",
        ));
    }
    Ok(interval)
}

/// Lock provider connection settings
#[derive(Clone, Serialize, Deserialize)]
pub struct ConsulConfig {
    #[serde(default)]
    pub region: String,
    pub addr: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,
    #[serde(default)]
    pub read_timeout_ms: Option<u64>,
    #[serde(default)]
    pub lock_delay: Option<ConsulDuration>,
}

// The ACL token never reaches the logs
impl std::fmt::Debug for ConsulConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsulConfig")
            .field("region", &self.region)
            .field("addr", &self.addr)
            .field("token", &self.token.as_ref().map(|_| "***"))
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("read_timeout_ms", &self.read_timeout_ms)
            .field("lock_delay", &self.lock_delay)
            .finish()
    }
}

impl ConsulConfig {
    pub fn to_client_config(&self) -> ConsulClientConfig {
        let mut config = ConsulClientConfig::new(&self.region, &self.addr);
        if let Some(ref token) = self.token {
            config = config.with_token(token);
        }
        let connect_ms = self.connect_timeout_ms.unwrap_or(config.connect_timeout_ms);
        let read_ms = self.read_timeout_ms.unwrap_or(config.read_timeout_ms);
        config = config.with_timeouts(connect_ms, read_ms);
        if let Some(ref lock_delay) = self.lock_delay {
            config = config.with_lock_delay(lock_delay.as_str());
        }
        config
    }
}
