//! Swarm configuration.
//!
//! Loading (files, environment, flags) is left to the embedding broker;
//! this type only describes and validates the cluster section.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SwarmError;

/// Cluster configuration for a swarm.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SwarmConfig {
    /// Address to bind the transport to. `public` is replaced with the
    /// node's external address; a leading `:` binds all interfaces.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Address advertised to other nodes, same substitution rules.
    #[serde(default = "default_advertise_addr")]
    pub advertise_addr: String,
    /// Shared secret for transport authentication.
    #[serde(default)]
    pub passphrase: Option<String>,
    /// Explicit node name (`aa:bb:cc:dd:ee:ff`). Derived from hardware when absent.
    #[serde(default)]
    pub node_name: Option<String>,
    /// Interval between reinforcement sweeps in seconds.
    #[serde(default = "default_reinforce_interval_secs")]
    pub reinforce_interval_secs: u64,
    /// Interval between outbound frame flushes in milliseconds.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// Maximum number of transport connections.
    #[serde(default = "default_conn_limit")]
    pub conn_limit: usize,
}

fn default_listen_addr() -> String {
    ":4000".to_string()
}

fn default_advertise_addr() -> String {
    "public:4000".to_string()
}

fn default_reinforce_interval_secs() -> u64 {
    5
}

fn default_flush_interval_ms() -> u64 {
    5
}

fn default_conn_limit() -> usize {
    128
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            advertise_addr: default_advertise_addr(),
            passphrase: None,
            node_name: None,
            reinforce_interval_secs: default_reinforce_interval_secs(),
            flush_interval_ms: default_flush_interval_ms(),
            conn_limit: default_conn_limit(),
        }
    }
}

impl std::fmt::Debug for SwarmConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwarmConfig")
            .field("listen_addr", &self.listen_addr)
            .field("advertise_addr", &self.advertise_addr)
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .field("node_name", &self.node_name)
            .field("reinforce_interval_secs", &self.reinforce_interval_secs)
            .field("flush_interval_ms", &self.flush_interval_ms)
            .field("conn_limit", &self.conn_limit)
            .finish()
    }
}

impl SwarmConfig {
    /// Sets the listen and advertise addresses.
    #[must_use]
    pub fn with_addrs(mut self, listen: impl Into<String>, advertise: impl Into<String>) -> Self {
        self.listen_addr = listen.into();
        self.advertise_addr = advertise.into();
        self
    }

    /// Sets an explicit node name.
    #[must_use]
    pub fn with_node_name(mut self, name: impl Into<String>) -> Self {
        self.node_name = Some(name.into());
        self
    }

    /// Sets the transport passphrase.
    #[must_use]
    pub fn with_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = Some(passphrase.into());
        self
    }

    /// Returns the reinforcement interval.
    #[must_use]
    pub const fn reinforce_interval(&self) -> Duration {
        Duration::from_secs(self.reinforce_interval_secs)
    }

    /// Returns the flush interval.
    #[must_use]
    pub const fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<(), SwarmError> {
        if self.listen_addr.trim().is_empty() {
            return Err(SwarmError::Config("listen address cannot be empty".to_string()));
        }

        if self.advertise_addr.trim().is_empty() {
            return Err(SwarmError::Config(
                "advertise address cannot be empty".to_string(),
            ));
        }

        if self.reinforce_interval_secs == 0 {
            return Err(SwarmError::Config(
                "reinforce interval must be greater than 0".to_string(),
            ));
        }

        if self.flush_interval_ms == 0 {
            return Err(SwarmError::Config(
                "flush interval must be greater than 0".to_string(),
            ));
        }

        if self.conn_limit == 0 {
            return Err(SwarmError::Config(
                "connection limit must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = SwarmConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.reinforce_interval(), Duration::from_secs(5));
        assert_eq!(config.flush_interval(), Duration::from_millis(5));
        assert_eq!(config.conn_limit, 128);
    }

    #[test]
    fn deserialize_fills_defaults() {
        let config: SwarmConfig =
            serde_json::from_str(r#"{"node_name": "00:00:00:00:00:01", "passphrase": "s3cret"}"#)
                .expect("valid json");
        assert_eq!(config.listen_addr, ":4000");
        assert_eq!(config.advertise_addr, "public:4000");
        assert_eq!(config.node_name.as_deref(), Some("00:00:00:00:00:01"));
        assert_eq!(config.reinforce_interval_secs, 5);
    }

    #[test]
    fn validate_rejects_empty_listen_addr() {
        let config = SwarmConfig::default().with_addrs("", ":4000");
        assert!(matches!(config.validate(), Err(SwarmError::Config(_))));
    }

    #[test]
    fn validate_rejects_empty_advertise_addr() {
        let config = SwarmConfig::default().with_addrs(":4000", "  ");
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_intervals() {
        let config = SwarmConfig {
            reinforce_interval_secs: 0,
            ..SwarmConfig::default()
        };
        assert!(config.validate().is_err());

        let config = SwarmConfig {
            flush_interval_ms: 0,
            ..SwarmConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_conn_limit() {
        let config = SwarmConfig {
            conn_limit: 0,
            ..SwarmConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn debug_redacts_passphrase() {
        let config = SwarmConfig::default().with_passphrase("s3cret");
        assert!(!format!("{config:?}").contains("s3cret"));
    }
}
