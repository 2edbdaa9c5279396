//! Environment configuration. `.env` is loaded by `main` before `HubConfig::from_env`.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3000";
const DEFAULT_OUTBOUND_CAPACITY: usize = 256;
const DEFAULT_PING_INTERVAL_SECS: u64 = 30;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{var} is invalid: {reason}")]
    Invalid { var: &'static str, reason: String },
}

/// Settings the hub itself needs; the rest of `HubConfig` is process wiring.
#[derive(Debug, Clone)]
pub struct HubSettings {
    /// Bounded capacity of every connection's outbound queue.
    pub outbound_capacity: usize,
    pub ping_interval: Duration,
    /// No inbound frame (pongs included) for this long tears the connection down.
    pub idle_timeout: Duration,
    pub echo_group_to_sender: bool,
    pub require_group_membership: bool,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            ping_interval: Duration::from_secs(DEFAULT_PING_INTERVAL_SECS),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            echo_group_to_sender: false,
            require_group_membership: true,
        }
    }
}

impl HubSettings {
    /// Reject values the hub cannot run with. Errors name the environment variable that
    /// carries the setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.outbound_capacity == 0 {
            return Err(ConfigError::Invalid {
                var: "HUB_OUTBOUND_CAPACITY",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.ping_interval.is_zero() {
            return Err(ConfigError::Invalid {
                var: "HUB_PING_INTERVAL_SECS",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.idle_timeout <= self.ping_interval {
            return Err(ConfigError::Invalid {
                var: "HUB_IDLE_TIMEOUT_SECS",
                reason: format!(
                    "must exceed the ping interval ({}s <= {}s)",
                    self.idle_timeout.as_secs(),
                    self.ping_interval.as_secs()
                ),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub bind_addr: SocketAddr,
    /// Absent means the in-process storage adapter is used.
    pub database_url: Option<String>,
    pub jwt_secret: String,
    pub hub: HubSettings,
}

impl HubConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from an arbitrary key lookup (the process environment in production).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let bind_addr = parse_or(&lookup, "BIND_ADDR", || {
            SocketAddr::from_str(DEFAULT_BIND_ADDR).map_err(|e| ConfigError::Invalid {
                var: "BIND_ADDR",
                reason: e.to_string(),
            })
        })?;
        let database_url = lookup("DATABASE_URL").filter(|s| !s.trim().is_empty());
        let jwt_secret = lookup("JWT_SECRET")
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::Missing("JWT_SECRET"))?;

        let outbound_capacity =
            parse_or(&lookup, "HUB_OUTBOUND_CAPACITY", || Ok(DEFAULT_OUTBOUND_CAPACITY))?;
        let ping_secs: u64 =
            parse_or(&lookup, "HUB_PING_INTERVAL_SECS", || Ok(DEFAULT_PING_INTERVAL_SECS))?;
        let idle_secs: u64 =
            parse_or(&lookup, "HUB_IDLE_TIMEOUT_SECS", || Ok(DEFAULT_IDLE_TIMEOUT_SECS))?;
        let echo_group_to_sender = parse_or(&lookup, "HUB_ECHO_GROUP_TO_SENDER", || Ok(false))?;
        let require_group_membership =
            parse_or(&lookup, "HUB_REQUIRE_GROUP_MEMBERSHIP", || Ok(true))?;

        let hub = HubSettings {
            outbound_capacity,
            ping_interval: Duration::from_secs(ping_secs),
            idle_timeout: Duration::from_secs(idle_secs),
            echo_group_to_sender,
            require_group_membership,
        };
        hub.validate()?;

        Ok(Self {
            bind_addr,
            database_url,
            jwt_secret,
            hub,
        })
    }
}

fn parse_or<T, F, D>(lookup: &F, var: &'static str, default: D) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
    D: FnOnce() -> Result<T, ConfigError>,
{
    match lookup(var) {
        Some(raw) if !raw.trim().is_empty() => {
            raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                var,
                reason: e.to_string(),
            })
        }
        _ => default(),
    }
}
