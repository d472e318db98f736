//! # gossip
//!
//! Gossip-based membership and failure detection.
//!
//! Each node keeps a table of peers it has recently heard from, probes a few
//! random peers every heartbeat, periodically pushes its whole table to one
//! random peer (anti-entropy) and evicts peers whose last-seen time is older
//! than the TTL.
//!
//! This crate provides:
//! - The membership table with merge and eviction semantics
//! - The PING / PONG / MEMBERSHIP wire protocol (JSON over UDP)
//! - A UDP transport
//! - The single-worker reactor that multiplexes timers and socket I/O
//!
//! ## Example
//!
//! ```no_run
//! use gossip::{GossipConfig, GossipNode, PeerAddr};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let listen = PeerAddr::parse("127.0.0.1", 8000)?;
//! let seeds = vec![PeerAddr::parse("10.0.0.2", 8000)?];
//!
//! let node = GossipNode::bind(GossipConfig::default(), listen, seeds).await?;
//! node.spawn().await?;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;
use thiserror::Error;

pub mod config;
pub mod membership;
pub mod message;
pub mod node;
pub mod peer;
pub mod reactor;
pub mod transport;

// Re-export commonly used types
pub use config::GossipConfig;
pub use membership::{MergePolicy, MergeReport, Membership, SharedMembership, Snapshot};
pub use message::{Message, MessageKind, Packet};
pub use node::{GossipNode, GossipNodeBuilder};
pub use peer::{LocalIdentity, PeerAddr};
pub use reactor::Reactor;
pub use transport::{Transport, UdpTransport};

/// Result type for gossip operations
pub type Result<T> = std::result::Result<T, GossipError>;

/// Errors that can occur during gossip operations
#[derive(Error, Debug)]
pub enum GossipError {
    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Cannot resolve address: {0}")]
    Resolve(String),

    #[error("Message too large: {size} bytes (max: {max})")]
    PacketTooLarge { size: usize, max: usize },

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("{0} queue is full")]
    QueueFull(&'static str),
}

impl GossipError {
    /// True for the expected outcome of a bounded receive with nothing to read
    pub fn is_timeout(&self) -> bool {
        matches!(self, GossipError::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gossip_config_creation() {
        let config = GossipConfig::default();
        assert!(config.heartbeat_interval.as_millis() > 0);
        assert!(config.peer_ttl.as_millis() > 0);
        assert!(config.max_packet_size > 0);
    }

    #[test]
    fn test_timeout_is_distinguished() {
        let timeout = GossipError::Timeout(Duration::from_millis(100));
        assert!(timeout.is_timeout());

        let decode = serde_json::from_slice::<Message>(b"not json").unwrap_err();
        assert!(!GossipError::from(decode).is_timeout());
    }
}
