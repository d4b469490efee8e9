//! Runtime configuration for discovery and the client connector.
//!
//! Every struct has a usable `Default` and can be loaded from TOML. Durations
//! are written as integer milliseconds (`ping_interval_ms = 500`); any key
//! left out keeps its default.
//!
//! ```toml
//! system_name = "studio-*"
//! inactivity_interval_ms = 2000
//! reconnect = "manual"          # or a delay in ms; 0 disables retry
//!
//! [discovery]
//! ping_interval_ms = 500
//! unicast_targets = ["10.0.0.5:7770"]
//! ```

use std::fs;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use thiserror::Error;

use crate::filter::QueryFilter;
use crate::net::Endpoint;
use crate::net::endpoint::{DEFAULT_DISCOVERY_GROUP, DEFAULT_DISCOVERY_PORT};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

/// Discovery probing parameters.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DiscoveryConfig {
    /// Multicast group probes are sent to.
    pub group: Ipv4Addr,
    /// UDP port servers listen on for probes.
    pub port: u16,
    /// Send probes to the multicast group. Unicast targets are probed either way.
    pub multicast: bool,
    /// Probe period; zero leaves discovery inactive.
    #[serde(rename = "ping_interval_ms", deserialize_with = "millis")]
    pub ping_interval: Duration,
    pub multicast_ttl: u32,
    /// Probe only from these local addresses instead of every interface.
    pub interfaces: Option<Vec<Ipv4Addr>>,
    /// Extra probe destinations for networks that drop multicast.
    pub unicast_targets: Vec<SocketAddr>,
    /// How often the interface list is re-read to catch roaming and VPN changes.
    #[serde(rename = "interface_rescan_ms", deserialize_with = "millis")]
    pub interface_rescan: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            group: DEFAULT_DISCOVERY_GROUP,
            port: DEFAULT_DISCOVERY_PORT,
            multicast: true,
            ping_interval: Duration::from_secs(1),
            multicast_ttl: 4,
            interfaces: None,
            unicast_targets: Vec::new(),
            interface_rescan: Duration::from_secs(5),
        }
    }
}

impl DiscoveryConfig {
    /// # Errors
    ///
    /// Returns [`ConfigError`] on malformed TOML or invalid values.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.group.is_multicast() {
            return Err(ConfigError::Invalid("discovery group must be a multicast address"));
        }
        if self.port == 0 {
            return Err(ConfigError::Invalid("discovery port must be nonzero"));
        }
        if !self.multicast && self.unicast_targets.is_empty() && !self.ping_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "discovery needs multicast or at least one unicast target",
            ));
        }
        Ok(())
    }

    /// Expiry horizon for a peer that stops answering.
    #[must_use]
    pub fn result_lifetime(&self) -> Duration {
        self.ping_interval * 3
    }

    /// Every destination a probe round is sent to.
    #[must_use]
    pub fn probe_destinations(&self) -> Vec<Endpoint> {
        let mut out = Vec::with_capacity(self.unicast_targets.len() + 1);
        if self.multicast {
            out.push(Endpoint::new(self.group.into(), self.port));
        }
        out.extend(self.unicast_targets.iter().copied().map(Endpoint::from));
        out
    }
}

/// What the connector does after a session ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPolicy {
    /// Wait, then rediscover and reconnect.
    After(Duration),
    /// Stay disconnected until [`crate::connector::ClientConnector::reconnect`].
    Disabled,
    /// Same as `Disabled`; kept distinct so hosts can tell "never configured"
    /// from "explicitly turned off".
    Manual,
}

impl ReconnectPolicy {
    #[must_use]
    pub const fn delay(&self) -> Option<Duration> {
        match self {
            Self::After(d) => Some(*d),
            Self::Disabled | Self::Manual => None,
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::After(Duration::from_secs(1))
    }
}

impl<'de> Deserialize<'de> for ReconnectPolicy {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Millis(u64),
            Keyword(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Millis(0) => Ok(Self::Disabled),
            Raw::Millis(ms) => Ok(Self::After(Duration::from_millis(ms))),
            Raw::Keyword(k) if k == "manual" || k == "never" => Ok(Self::Manual),
            Raw::Keyword(k) if k == "disabled" => Ok(Self::Disabled),
            Raw::Keyword(k) => Err(serde::de::Error::custom(format!(
                "unknown reconnect policy {k:?}"
            ))),
        }
    }
}

/// Client connector parameters. Two configs that compare equal describe the
/// same connection, which is what makes a repeated `start` a no-op.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectorConfig {
    pub discovery: DiscoveryConfig,
    /// Wildcard pattern the server's signature must match.
    pub signature: String,
    /// Wildcard pattern the server's system name must match.
    pub system_name: String,
    /// Extra filter applied to discovery replies.
    pub filter: Option<QueryFilter>,
    /// Idle time before a keep-alive ping is sent. The session is dropped
    /// after [`KEEPALIVE_MISSES`] such intervals without any data.
    #[serde(rename = "inactivity_interval_ms", deserialize_with = "millis")]
    pub inactivity_interval: Duration,
    pub reconnect: ReconnectPolicy,
    #[serde(rename = "connect_timeout_ms", deserialize_with = "millis")]
    pub connect_timeout: Duration,
    /// Time-sync ping period on wired links.
    #[serde(rename = "time_sync_interval_ms", deserialize_with = "millis")]
    pub time_sync_interval: Duration,
    /// Time-sync ping period on wireless links and after a missed keep-alive.
    #[serde(rename = "time_sync_fast_interval_ms", deserialize_with = "millis")]
    pub time_sync_fast_interval: Duration,
    /// Number of round-trip samples averaged by the clock estimate.
    pub clock_window: usize,
}

/// Inactivity intervals without any received data before the connector
/// assumes the link is gone.
pub const KEEPALIVE_MISSES: u32 = 5;

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            discovery: DiscoveryConfig::default(),
            signature: "*".into(),
            system_name: "*".into(),
            filter: None,
            inactivity_interval: Duration::from_secs(1),
            reconnect: ReconnectPolicy::default(),
            connect_timeout: Duration::from_secs(5),
            time_sync_interval: Duration::from_secs(1),
            time_sync_fast_interval: Duration::from_millis(100),
            clock_window: 10,
        }
    }
}

impl ConnectorConfig {
    /// # Errors
    ///
    /// Returns [`ConfigError`] on malformed TOML or invalid values.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::from_toml_str(&fs::read_to_string(path)?)
    }

    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.discovery.validate()?;
        if self.discovery.ping_interval.is_zero() {
            return Err(ConfigError::Invalid("connector discovery needs a ping interval"));
        }
        if self.inactivity_interval.is_zero() {
            return Err(ConfigError::Invalid("inactivity interval must be nonzero"));
        }
        if self.time_sync_interval.is_zero() || self.time_sync_fast_interval.is_zero() {
            return Err(ConfigError::Invalid("time-sync intervals must be nonzero"));
        }
        if self.clock_window == 0 {
            return Err(ConfigError::Invalid("clock window must hold at least one sample"));
        }
        Ok(())
    }

    /// Silence after which the session is force-disconnected.
    #[must_use]
    pub fn dead_link_timeout(&self) -> Duration {
        self.inactivity_interval * KEEPALIVE_MISSES
    }
}

fn millis<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_gives_defaults() {
        assert_eq!(
            ConnectorConfig::from_toml_str("").unwrap(),
            ConnectorConfig::default()
        );
        assert_eq!(
            DiscoveryConfig::from_toml_str("").unwrap(),
            DiscoveryConfig::default()
        );
    }

    #[test]
    fn parses_overrides() {
        let config = ConnectorConfig::from_toml_str(
            r#"
            system_name = "studio-*"
            inactivity_interval_ms = 250
            reconnect = 2000
            clock_window = 4

            [discovery]
            ping_interval_ms = 100
            multicast = false
            interfaces = ["127.0.0.1"]
            unicast_targets = ["127.0.0.1:7770"]
            "#,
        )
        .unwrap();
        assert_eq!(config.system_name, "studio-*");
        assert_eq!(config.inactivity_interval, Duration::from_millis(250));
        assert_eq!(config.dead_link_timeout(), Duration::from_millis(1250));
        assert_eq!(config.reconnect, ReconnectPolicy::After(Duration::from_secs(2)));
        assert_eq!(config.discovery.ping_interval, Duration::from_millis(100));
        assert_eq!(config.discovery.result_lifetime(), Duration::from_millis(300));
        assert_eq!(
            config.discovery.probe_destinations(),
            vec![Endpoint::localhost(7770)]
        );
    }

    #[test]
    fn reconnect_keywords() {
        let parse = |s: &str| ConnectorConfig::from_toml_str(s).map(|c| c.reconnect);
        assert_eq!(parse("reconnect = 0").unwrap(), ReconnectPolicy::Disabled);
        assert_eq!(parse("reconnect = \"manual\"").unwrap(), ReconnectPolicy::Manual);
        assert!(parse("reconnect = \"sometimes\"").is_err());
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(matches!(
            ConnectorConfig::from_toml_str("clock_window = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            DiscoveryConfig::from_toml_str("group = \"10.0.0.1\""),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            DiscoveryConfig::from_toml_str("bogus = 1"),
            Err(ConfigError::Parse(_))
        ));
    }
}
