//! Configuration for the replicator.
//!
//! Configuration is passed to [`Replicator::new()`](crate::Replicator::new)
//! and can be constructed programmatically or deserialized from JSON/YAML.
//!
//! # Quick Start
//!
//! ```rust
//! use meshmap::config::{ReplicatorConfig, PeerAddress};
//!
//! let config = ReplicatorConfig {
//!     identifier: 1,
//!     listen_port: Some(8076),
//!     peers: vec![PeerAddress::new("10.0.0.2", 8076)],
//!     ..ReplicatorConfig::for_testing(1)
//! };
//! ```
//!
//! # JSON Example
//!
//! ```json
//! {
//!   "identifier": 1,
//!   "listen_port": 8076,
//!   "peers": [ { "host": "10.0.0.2", "port": 8076 } ],
//!   "entry_max_size": 1024,
//!   "packet_size": 8192,
//!   "heartbeat_interval": "10s",
//!   "udp": { "port": 8077, "broadcast_address": "255.255.255.255:8077" }
//! }
//! ```

use crate::entry::{identifier_in_range, MAX_IDENTIFIER, MIN_IDENTIFIER};
use crate::error::{ReplicationError, Result};
use crate::resilience::RetryConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Outbound peer address: one entry per remote node we dial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddress {
    /// Hostname or IP address.
    pub host: String,
    /// TCP port the peer listens on.
    pub port: u16,
}

impl PeerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Optional best-effort datagram channel.
///
/// Packets on this channel are lossy: no retransmit, no acknowledgment.
/// Convergence is guaranteed only if the reliable mesh is also configured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UdpConfig {
    /// UDP port to bind locally (0 for ephemeral).
    pub port: u16,
    /// Address datagrams are sent to (typically a broadcast address).
    pub broadcast_address: SocketAddr,
}

/// The top-level config object passed to `Replicator::new()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicatorConfig {
    /// This node's mesh identifier, `1..=127`. Required, unique in the mesh,
    /// embedded in every outgoing welcome.
    pub identifier: u8,

    /// TCP port to listen on (`Some(0)` binds an ephemeral port).
    /// `None` disables the listener for an outbound-only node.
    #[serde(default)]
    pub listen_port: Option<u16>,

    /// Remote nodes to dial. Each address gets a dedicated connector with
    /// bounded exponential backoff.
    #[serde(default)]
    pub peers: Vec<PeerAddress>,

    /// Maximum serialized size of a single entry, in bytes.
    /// Entries larger than this are rejected by the map at write time.
    #[serde(default = "default_entry_max_size")]
    pub entry_max_size: usize,

    /// Estimated transport packet size; together with `entry_max_size` this
    /// bounds every per-session buffer (`packet_size + entry_max_size`).
    #[serde(default = "default_packet_size")]
    pub packet_size: usize,

    /// Heartbeat interval as a duration string (e.g. `"10s"`).
    ///
    /// A session idle on the write side for this long sends a zero-length
    /// record; a session that has read nothing for twice this long closes.
    /// Absent disables heartbeats.
    #[serde(default)]
    pub heartbeat_interval: Option<String>,

    /// Optional datagram channel.
    #[serde(default)]
    pub udp: Option<UdpConfig>,

    /// Connector backoff. Programmatic only (not deserialized).
    #[serde(skip)]
    pub retry: RetryConfig,
}

fn default_entry_max_size() -> usize {
    1024
}

fn default_packet_size() -> usize {
    8192
}

impl ReplicatorConfig {
    /// Create a minimal config for testing: ephemeral listen port, no peers,
    /// no heartbeat, fast connector backoff.
    pub fn for_testing(identifier: u8) -> Self {
        Self {
            identifier,
            listen_port: Some(0),
            peers: Vec::new(),
            entry_max_size: default_entry_max_size(),
            packet_size: default_packet_size(),
            heartbeat_interval: None,
            udp: None,
            retry: RetryConfig::testing(),
        }
    }

    /// Parse `heartbeat_interval`, if configured.
    ///
    /// Returns `None` when heartbeats are disabled. [`validate()`](Self::validate)
    /// rejects unparseable strings, so after validation this never silently
    /// drops a configured interval.
    pub fn heartbeat_duration(&self) -> Option<Duration> {
        self.heartbeat_interval
            .as_deref()
            .and_then(|s| humantime::parse_duration(s).ok())
    }

    /// Per-session buffer cap: `packet_size + entry_max_size`.
    pub fn session_buffer_cap(&self) -> usize {
        self.packet_size + self.entry_max_size
    }

    /// Validate the configuration. Called by `Replicator::start()`.
    pub fn validate(&self) -> Result<()> {
        if !identifier_in_range(self.identifier) {
            return Err(ReplicationError::Config(format!(
                "identifier {} out of range {}..={}",
                self.identifier, MIN_IDENTIFIER, MAX_IDENTIFIER
            )));
        }
        if self.entry_max_size < 16 {
            return Err(ReplicationError::Config(format!(
                "entry_max_size {} is too small to hold any entry",
                self.entry_max_size
            )));
        }
        // Record lengths are a u16 on the wire.
        if self.entry_max_size > u16::MAX as usize {
            return Err(ReplicationError::Config(format!(
                "entry_max_size {} exceeds the u16 record length limit",
                self.entry_max_size
            )));
        }
        if self.packet_size == 0 {
            return Err(ReplicationError::Config(
                "packet_size must be non-zero".to_string(),
            ));
        }
        if let Some(interval) = self.heartbeat_interval.as_deref() {
            let parsed = humantime::parse_duration(interval).map_err(|e| {
                ReplicationError::Config(format!("invalid heartbeat_interval '{interval}': {e}"))
            })?;
            if parsed.is_zero() {
                return Err(ReplicationError::Config(
                    "heartbeat_interval must be non-zero".to_string(),
                ));
            }
        }
        if self.listen_port.is_none() && self.peers.is_empty() && self.udp.is_none() {
            return Err(ReplicationError::Config(
                "no listener, no peers, and no datagram channel: nothing to replicate over"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_testing_config_is_valid() {
        let config = ReplicatorConfig::for_testing(1);
        assert!(config.validate().is_ok());
        assert_eq!(config.identifier, 1);
        assert_eq!(config.listen_port, Some(0));
        assert!(config.peers.is_empty());
        assert!(config.heartbeat_duration().is_none());
    }

    #[test]
    fn test_identifier_out_of_range_rejected() {
        let mut config = ReplicatorConfig::for_testing(1);
        config.identifier = 0;
        assert!(config.validate().is_err());
        config.identifier = 128;
        assert!(config.validate().is_err());
        config.identifier = 127;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_entry_max_size_bounds() {
        let mut config = ReplicatorConfig::for_testing(1);
        config.entry_max_size = 4;
        assert!(config.validate().is_err());
        config.entry_max_size = 70_000;
        assert!(config.validate().is_err());
        config.entry_max_size = u16::MAX as usize;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_packet_size_rejected() {
        let mut config = ReplicatorConfig::for_testing(1);
        config.packet_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_heartbeat_parsing() {
        let mut config = ReplicatorConfig::for_testing(1);
        config.heartbeat_interval = Some("10s".to_string());
        assert!(config.validate().is_ok());
        assert_eq!(config.heartbeat_duration(), Some(Duration::from_secs(10)));

        config.heartbeat_interval = Some("500ms".to_string());
        assert_eq!(config.heartbeat_duration(), Some(Duration::from_millis(500)));
    }

    #[test]
    fn test_invalid_heartbeat_rejected() {
        let mut config = ReplicatorConfig::for_testing(1);
        config.heartbeat_interval = Some("often".to_string());
        assert!(config.validate().is_err());

        config.heartbeat_interval = Some("0s".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_nothing_to_replicate_over_rejected() {
        let mut config = ReplicatorConfig::for_testing(1);
        config.listen_port = None;
        assert!(config.validate().is_err());

        // Any one channel makes it valid again.
        config.peers.push(PeerAddress::new("127.0.0.1", 8076));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_session_buffer_cap() {
        let config = ReplicatorConfig::for_testing(1);
        assert_eq!(
            config.session_buffer_cap(),
            config.packet_size + config.entry_max_size
        );
    }

    #[test]
    fn test_peer_address_display() {
        let addr = PeerAddress::new("example.org", 8076);
        assert_eq!(addr.to_string(), "example.org:8076");
    }

    #[test]
    fn test_config_json_roundtrip() {
        let config = ReplicatorConfig {
            identifier: 3,
            listen_port: Some(8076),
            peers: vec![
                PeerAddress::new("10.0.0.1", 8076),
                PeerAddress::new("10.0.0.2", 8076),
            ],
            entry_max_size: 2048,
            packet_size: 4096,
            heartbeat_interval: Some("10s".to_string()),
            udp: Some(UdpConfig {
                port: 8077,
                broadcast_address: "255.255.255.255:8077".parse().unwrap(),
            }),
            retry: RetryConfig::default(),
        };

        let json = serde_json::to_string(&config).unwrap();
        let parsed: ReplicatorConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.identifier, 3);
        assert_eq!(parsed.listen_port, Some(8076));
        assert_eq!(parsed.peers.len(), 2);
        assert_eq!(parsed.peers[1].host, "10.0.0.2");
        assert_eq!(parsed.entry_max_size, 2048);
        assert_eq!(parsed.heartbeat_interval.as_deref(), Some("10s"));
        assert_eq!(parsed.udp.unwrap().port, 8077);
    }

    #[test]
    fn test_config_minimal_json() {
        let parsed: ReplicatorConfig =
            serde_json::from_str(r#"{ "identifier": 2, "listen_port": 8076 }"#).unwrap();
        assert_eq!(parsed.identifier, 2);
        assert_eq!(parsed.entry_max_size, 1024);
        assert_eq!(parsed.packet_size, 8192);
        assert!(parsed.peers.is_empty());
        assert!(parsed.udp.is_none());
        assert!(parsed.validate().is_ok());
    }
}
