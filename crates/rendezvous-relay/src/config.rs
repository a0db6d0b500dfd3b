//! Rendezvous relay configuration.
//!
//! Configuration is loaded from environment variables with sensible
//! defaults; nothing is required, so a bare `rendezvous-relay` invocation
//! starts a working server.

use std::collections::HashMap;
use std::env;
use thiserror::Error;

/// Default WebSocket bind address.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:9301";

/// Default health endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8081";

/// Default event name under which forwarded messages are delivered.
///
/// Each connection may override this with the `msgEvent` query parameter.
pub const DEFAULT_MESSAGE_EVENT: &str = "relay-message";

/// Default number of rejected password attempts before a connection is
/// short-circuited with `max-tries-exceeded`.
pub const DEFAULT_MAX_PASSWORD_TRIES: u32 = 3;

/// Default number of one-second ticks a pending join waits for its target.
pub const DEFAULT_JOIN_RETRY_TICKS: u32 = 120;

/// Default interval between join retry ticks in milliseconds.
pub const DEFAULT_JOIN_RETRY_INTERVAL_MS: u64 = 1000;

/// Default relay instance ID prefix.
pub const DEFAULT_RELAY_ID_PREFIX: &str = "relay";

/// Rendezvous relay configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// WebSocket server bind address (default: "0.0.0.0:9301").
    pub bind_address: String,

    /// Health endpoint bind address (default: "0.0.0.0:8081").
    pub health_bind_address: String,

    /// Unique identifier for this relay instance.
    pub relay_id: String,

    /// Default message event name for connections that do not set one.
    pub message_event: String,

    /// Rejected password attempts allowed before short-circuiting.
    pub max_password_tries: u32,

    /// Ticks a pending join waits for its target before timing out.
    pub join_retry_ticks: u32,

    /// Interval between join retry ticks in milliseconds.
    pub join_retry_interval_ms: u64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let bind_address = vars
            .get("RELAY_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let health_bind_address = vars
            .get("RELAY_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let message_event = vars
            .get("RELAY_MESSAGE_EVENT")
            .cloned()
            .unwrap_or_else(|| DEFAULT_MESSAGE_EVENT.to_string());

        let max_password_tries = parse_var(
            vars,
            "RELAY_MAX_PASSWORD_TRIES",
            DEFAULT_MAX_PASSWORD_TRIES,
        )?;

        let join_retry_ticks =
            parse_var(vars, "RELAY_JOIN_RETRY_TICKS", DEFAULT_JOIN_RETRY_TICKS)?;
        if join_retry_ticks == 0 {
            return Err(ConfigError::InvalidValue(
                "RELAY_JOIN_RETRY_TICKS must be at least 1".to_string(),
            ));
        }

        let join_retry_interval_ms = parse_var(
            vars,
            "RELAY_JOIN_RETRY_INTERVAL_MS",
            DEFAULT_JOIN_RETRY_INTERVAL_MS,
        )?;
        if join_retry_interval_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "RELAY_JOIN_RETRY_INTERVAL_MS must be at least 1".to_string(),
            ));
        }

        // Generate relay instance ID
        let relay_id = vars.get("RELAY_ID").cloned().unwrap_or_else(|| {
            let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
            let uuid_suffix = uuid::Uuid::new_v4().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_RELAY_ID_PREFIX}-{hostname}-{short_suffix}")
        });

        Ok(Config {
            bind_address,
            health_bind_address,
            relay_id,
            message_event,
            max_password_tries,
            join_retry_ticks,
            join_retry_interval_ms,
        })
    }
}

fn parse_var<T: std::str::FromStr>(
    vars: &HashMap<String, String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(key) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{key}={raw}"))),
    }
}
