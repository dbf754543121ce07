//! Server configuration for `ZVault`.
//!
//! Loads configuration from environment variables with sensible defaults.
//! All settings can be overridden via `ZVAULT_*` environment variables.

use std::net::SocketAddr;
use std::time::Duration;

use zvault_core::HaTiming;

/// Errors from parsing configuration values.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A variable is set but its value cannot be parsed.
    #[error("invalid value '{value}' for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the HTTP listener to. The cluster listener binds
    /// the same IP at the next port.
    pub bind_addr: SocketAddr,
    /// Address advertised to clients when this node is active.
    pub advertise_addr: String,
    /// Cluster address advertised to standbys (defaults to the bound one).
    pub cluster_addr: Option<String>,
    /// Cluster name recorded on first unseal.
    pub cluster_name: Option<String>,
    /// Whether to run leader election.
    pub ha_enabled: bool,
    /// Log level filter (e.g., `info`, `debug`, `warn`).
    pub log_level: String,
    pub lock_ttl: Duration,
    pub lock_retry_interval: Duration,
    pub step_down_cooldown: Duration,
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `ZVAULT_BIND_ADDR` — HTTP bind address (default: `127.0.0.1:8200`)
    /// - `ZVAULT_ADVERTISE_ADDR` — client-facing address (default: the bind address)
    /// - `ZVAULT_CLUSTER_ADDR` — cluster address for standbys (default: bind port + 1)
    /// - `ZVAULT_CLUSTER_NAME` — cluster name (default: generated)
    /// - `ZVAULT_HA_ENABLED` — enable leader election (default: `true`)
    /// - `ZVAULT_LOG_LEVEL` — log filter (default: `info`)
    /// - `ZVAULT_LOCK_TTL_SECS` — HA lock TTL (default: `15`)
    /// - `ZVAULT_LOCK_RETRY_SECS` — standby retry interval (default: `10`)
    /// - `ZVAULT_STEP_DOWN_COOLDOWN_SECS` — step-down cooldown (default: `10`)
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if a variable is set to an
    /// unparseable value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load configuration through `lookup`, which returns the value of an
    /// environment-style variable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for unparseable values.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind_addr = match lookup("ZVAULT_BIND_ADDR") {
            Some(value) => value.parse().map_err(|e: std::net::AddrParseError| {
                ConfigError::Invalid {
                    var: "ZVAULT_BIND_ADDR",
                    value: value.clone(),
                    reason: e.to_string(),
                }
            })?,
            None => SocketAddr::from(([127, 0, 0, 1], 8200)),
        };

        let advertise_addr = lookup("ZVAULT_ADVERTISE_ADDR").unwrap_or_else(|| bind_addr.to_string());

        let ha_enabled = match lookup("ZVAULT_HA_ENABLED") {
            Some(v) => parse_bool("ZVAULT_HA_ENABLED", &v)?,
            None => true,
        };

        let defaults = HaTiming::default();
        let lock_ttl = secs(&lookup, "ZVAULT_LOCK_TTL_SECS", defaults.lock_ttl)?;
        let lock_retry_interval = secs(&lookup, "ZVAULT_LOCK_RETRY_SECS", defaults.lock_retry_interval)?;
        let step_down_cooldown = secs(
            &lookup,
            "ZVAULT_STEP_DOWN_COOLDOWN_SECS",
            defaults.step_down_cooldown,
        )?;

        Ok(Self {
            bind_addr,
            advertise_addr,
            cluster_addr: lookup("ZVAULT_CLUSTER_ADDR"),
            cluster_name: lookup("ZVAULT_CLUSTER_NAME"),
            ha_enabled,
            log_level: lookup("ZVAULT_LOG_LEVEL").unwrap_or_else(|| "info".to_owned()),
            lock_ttl,
            lock_retry_interval,
            step_down_cooldown,
        })
    }

    /// HA timing derived from this configuration. Heartbeats run at a third
    /// of the lock TTL.
    #[must_use]
    pub fn ha_timing(&self) -> HaTiming {
        HaTiming {
            lock_ttl: self.lock_ttl,
            heartbeat_interval: self.lock_ttl / 3,
            lock_retry_interval: self.lock_retry_interval,
            step_down_cooldown: self.step_down_cooldown,
            ..HaTiming::default()
        }
    }
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(ConfigError::Invalid {
            var,
            value: value.to_owned(),
            reason: "expected true or false".to_owned(),
        }),
    }
}

fn secs(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    let Some(value) = lookup(var) else {
        return Ok(default);
    };
    match value.parse::<u64>() {
        Ok(0) => Err(ConfigError::Invalid {
            var,
            value,
            reason: "must be at least 1 second".to_owned(),
        }),
        Ok(n) => Ok(Duration::from_secs(n)),
        Err(e) => Err(ConfigError::Invalid {
            var,
            value,
            reason: e.to_string(),
        }),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<ServerConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        ServerConfig::from_lookup(|k| vars.get(k).cloned())
    }

    #[test]
    fn defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.bind_addr, SocketAddr::from(([127, 0, 0, 1], 8200)));
        assert_eq!(config.advertise_addr, "127.0.0.1:8200");
        assert!(config.ha_enabled);
        assert_eq!(config.log_level, "info");
        assert!(config.cluster_addr.is_none());

        let timing = config.ha_timing();
        assert_eq!(timing.lock_ttl, Duration::from_secs(15));
        assert_eq!(timing.heartbeat_interval, Duration::from_secs(5));
    }

    #[test]
    fn overrides() {
        let config = load(&[
            ("ZVAULT_BIND_ADDR", "0.0.0.0:9200"),
            ("ZVAULT_ADVERTISE_ADDR", "vault-1.internal:9200"),
            ("ZVAULT_HA_ENABLED", "false"),
            ("ZVAULT_LOCK_TTL_SECS", "30"),
            ("ZVAULT_STEP_DOWN_COOLDOWN_SECS", "3"),
        ])
        .unwrap();
        assert_eq!(config.bind_addr.port(), 9200);
        assert_eq!(config.advertise_addr, "vault-1.internal:9200");
        assert!(!config.ha_enabled);
        assert_eq!(config.ha_timing().heartbeat_interval, Duration::from_secs(10));
        assert_eq!(config.step_down_cooldown, Duration::from_secs(3));
    }

    #[test]
    fn bad_values_are_rejected() {
        assert!(load(&[("ZVAULT_BIND_ADDR", "nope")]).is_err());
        assert!(load(&[("ZVAULT_HA_ENABLED", "maybe")]).is_err());
        assert!(load(&[("ZVAULT_LOCK_TTL_SECS", "0")]).is_err());
        assert!(load(&[("ZVAULT_LOCK_RETRY_SECS", "-1")]).is_err());
    }
}
