//! Configuration for the gossip protocol

use crate::membership::MergePolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Port every node listens on unless told otherwise
pub const DEFAULT_PORT: u16 = 8000;

/// Configuration for the gossip reactor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipConfig {
    /// Interval between heartbeat rounds (PINGs to random peers)
    pub heartbeat_interval: Duration,

    /// Interval between anti-entropy membership exchanges
    pub exchange_interval: Duration,

    /// Interval between eviction sweeps
    pub eviction_interval: Duration,

    /// Age after which a peer is considered dead
    pub peer_ttl: Duration,

    /// Upper bound on a single socket receive
    pub receive_timeout: Duration,

    /// Number of PINGs sent per heartbeat (draws may repeat)
    pub heartbeat_fanout: usize,

    /// Maximum size of an encoded datagram in bytes
    pub max_packet_size: usize,

    /// Capacity of the inbound and outbound queues
    pub queue_capacity: usize,

    /// Port appended to peer addresses given without one
    pub default_port: u16,

    /// Port observed source addresses are rewritten to; `None` trusts the
    /// source endpoint seen on the socket
    pub canonical_port: Option<u16>,

    /// How incoming snapshot timestamps combine with local ones
    pub merge_policy: MergePolicy,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(1),
            exchange_interval: Duration::from_secs(5),
            eviction_interval: Duration::from_secs(5),
            peer_ttl: Duration::from_secs(30),
            receive_timeout: Duration::from_millis(100),
            heartbeat_fanout: 3,
            max_packet_size: 2048,
            queue_capacity: 1000,
            default_port: DEFAULT_PORT,
            canonical_port: Some(DEFAULT_PORT),
            merge_policy: MergePolicy::default(),
        }
    }
}

impl GossipConfig {
    /// Create a new gossip configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the heartbeat interval
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the anti-entropy exchange interval
    pub fn with_exchange_interval(mut self, interval: Duration) -> Self {
        self.exchange_interval = interval;
        self
    }

    /// Set the eviction sweep interval
    pub fn with_eviction_interval(mut self, interval: Duration) -> Self {
        self.eviction_interval = interval;
        self
    }

    /// Set the peer TTL
    pub fn with_peer_ttl(mut self, ttl: Duration) -> Self {
        self.peer_ttl = ttl;
        self
    }

    /// Set the receive bound
    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    /// Set the heartbeat fanout
    pub fn with_heartbeat_fanout(mut self, fanout: usize) -> Self {
        self.heartbeat_fanout = fanout;
        self
    }

    /// Set the canonical port, or `None` to keep observed ports
    pub fn with_canonical_port(mut self, port: Option<u16>) -> Self {
        self.canonical_port = port;
        self
    }

    /// Set the merge policy
    pub fn with_merge_policy(mut self, policy: MergePolicy) -> Self {
        self.merge_policy = policy;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.heartbeat_interval.is_zero() {
            return Err("Heartbeat interval must be greater than zero".to_string());
        }

        if self.exchange_interval.is_zero() {
            return Err("Exchange interval must be greater than zero".to_string());
        }

        if self.eviction_interval.is_zero() {
            return Err("Eviction interval must be greater than zero".to_string());
        }

        if self.peer_ttl.is_zero() {
            return Err("Peer TTL must be greater than zero".to_string());
        }

        if self.receive_timeout.is_zero() {
            return Err("Receive timeout must be greater than zero".to_string());
        }

        if self.receive_timeout > self.heartbeat_interval {
            return Err("Receive timeout must not exceed the heartbeat interval".to_string());
        }

        if self.heartbeat_fanout == 0 {
            return Err("Heartbeat fanout must be greater than zero".to_string());
        }

        if self.max_packet_size < 64 {
            return Err("Max packet size must be at least 64 bytes".to_string());
        }

        if self.queue_capacity == 0 {
            return Err("Queue capacity must be greater than zero".to_string());
        }

        if self.default_port == 0 || self.canonical_port == Some(0) {
            return Err("Peer ports must be non-zero".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = GossipConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.heartbeat_interval, Duration::from_secs(1));
        assert_eq!(config.exchange_interval, Duration::from_secs(5));
        assert_eq!(config.eviction_interval, Duration::from_secs(5));
        assert_eq!(config.peer_ttl, Duration::from_secs(30));
        assert_eq!(config.receive_timeout, Duration::from_millis(100));
        assert_eq!(config.heartbeat_fanout, 3);
        assert_eq!(config.canonical_port, Some(8000));
    }

    #[test]
    fn test_config_builder() {
        let config = GossipConfig::new()
            .with_heartbeat_interval(Duration::from_millis(50))
            .with_exchange_interval(Duration::from_millis(100))
            .with_receive_timeout(Duration::from_millis(10))
            .with_canonical_port(None)
            .with_merge_policy(MergePolicy::Overwrite);

        assert_eq!(config.heartbeat_interval, Duration::from_millis(50));
        assert_eq!(config.exchange_interval, Duration::from_millis(100));
        assert_eq!(config.canonical_port, None);
        assert_eq!(config.merge_policy, MergePolicy::Overwrite);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = GossipConfig::default();

        config.heartbeat_interval = Duration::ZERO;
        assert!(config.validate().is_err());

        // Receive bound longer than a heartbeat would starve the timers
        config = GossipConfig::default().with_receive_timeout(Duration::from_secs(2));
        assert!(config.validate().is_err());

        config = GossipConfig::default().with_heartbeat_fanout(0);
        assert!(config.validate().is_err());

        config = GossipConfig::default().with_canonical_port(Some(0));
        assert!(config.validate().is_err());
    }
}
