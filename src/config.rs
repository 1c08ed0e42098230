#![forbid(unsafe_code)]

// Server configuration from environment variables

use anyhow::Context;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

/// Source of configuration values, keyed by variable name
pub type Lookup<'a> = dyn Fn(&str) -> Option<String> + 'a;

/// Parses `key` with `T::from_str`, falling back to `default` when unset or blank
pub fn lookup_parsed<T>(lookup: &Lookup<'_>, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid {key}: {raw}")),
        _ => Ok(default),
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub max_connections: usize,
    /// Close a socket that sends nothing for this long
    pub idle_timeout: Duration,
    pub max_message_size: usize,
    /// Inbound frames per second (token bucket, burst of the same size)
    pub rate_limit_per_sec: u64,
    pub max_consumers_per_peer: usize,
    /// Send `session-replaced` to a connection evicted by a newer one for the same user
    pub notify_replaced_session: bool,
    /// Bearer token guarding `/metrics`
    pub metrics_token: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3000,
            max_connections: 10_000,
            idle_timeout: Duration::from_secs(300),
            max_message_size: 65_536,
            rate_limit_per_sec: 100,
            max_consumers_per_peer: 64,
            notify_replaced_session: true,
            metrics_token: None,
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(&|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: &Lookup<'_>) -> anyhow::Result<Self> {
        let defaults = Self::default();

        let mut max_connections =
            lookup_parsed(lookup, "MAX_CONNECTIONS", defaults.max_connections)?;
        if max_connections == 0 {
            warn!(
                "MAX_CONNECTIONS=0 would reject all connections, using default {}",
                defaults.max_connections
            );
            max_connections = defaults.max_connections;
        }

        let mut idle_timeout_secs =
            lookup_parsed(lookup, "IDLE_TIMEOUT_SECS", defaults.idle_timeout.as_secs())?;
        if idle_timeout_secs == 0 {
            warn!(
                "IDLE_TIMEOUT_SECS=0 would drop every socket at once, using default {}",
                defaults.idle_timeout.as_secs()
            );
            idle_timeout_secs = defaults.idle_timeout.as_secs();
        }

        let rate_limit_per_sec =
            lookup_parsed(lookup, "RATE_LIMIT_PER_SEC", defaults.rate_limit_per_sec)?.max(1);

        let config = Self {
            port: lookup_parsed(lookup, "PORT", defaults.port)?,
            max_connections,
            idle_timeout: Duration::from_secs(idle_timeout_secs),
            max_message_size: lookup_parsed(lookup, "MAX_MESSAGE_SIZE", defaults.max_message_size)?,
            rate_limit_per_sec,
            max_consumers_per_peer: lookup_parsed(
                lookup,
                "MAX_CONSUMERS_PER_PEER",
                defaults.max_consumers_per_peer,
            )?,
            notify_replaced_session: lookup_parsed(
                lookup,
                "NOTIFY_REPLACED_SESSION",
                defaults.notify_replaced_session,
            )?,
            metrics_token: lookup("METRICS_TOKEN").filter(|t| !t.is_empty()),
        };

        info!(
            "Config: port={} max_connections={} max_consumers_per_peer={}",
            config.port, config.max_connections, config.max_consumers_per_peer
        );
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_map(vars: &[(&str, &str)]) -> anyhow::Result<Config> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(&|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = from_map(&[]).unwrap();
        assert_eq!(config.port, 3000);
        assert_eq!(config.max_connections, 10_000);
        assert_eq!(config.idle_timeout, Duration::from_secs(300));
        assert!(config.notify_replaced_session);
        assert!(config.metrics_token.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = from_map(&[
            ("PORT", "8080"),
            ("MAX_CONSUMERS_PER_PEER", "4"),
            ("NOTIFY_REPLACED_SESSION", "false"),
            ("METRICS_TOKEN", "s3cret"),
        ])
        .unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.max_consumers_per_peer, 4);
        assert!(!config.notify_replaced_session);
        assert_eq!(config.metrics_token.as_deref(), Some("s3cret"));
    }

    #[test]
    fn test_zero_max_connections_falls_back() {
        let config = from_map(&[("MAX_CONNECTIONS", "0")]).unwrap();
        assert_eq!(config.max_connections, 10_000);
    }

    #[test]
    fn test_zero_idle_timeout_falls_back() {
        let config = from_map(&[("IDLE_TIMEOUT_SECS", "0")]).unwrap();
        assert_eq!(config.idle_timeout, Duration::from_secs(300));

        let config = from_map(&[("IDLE_TIMEOUT_SECS", "45")]).unwrap();
        assert_eq!(config.idle_timeout, Duration::from_secs(45));
    }

    #[test]
    fn test_invalid_value_is_an_error() {
        let err = from_map(&[("PORT", "not-a-port")]).unwrap_err();
        assert!(err.to_string().contains("PORT"));
    }
}
