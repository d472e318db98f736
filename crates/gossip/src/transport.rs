//! Transport layer for gossip messages

use crate::{GossipError, Message, PeerAddr, Result};
use async_trait::async_trait;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

/// Trait for gossip transport implementations
#[async_trait]
pub trait Transport: Send + Sync {
    /// Encode `message` and write it to `peer` once, unacknowledged.
    ///
    /// Returns the number of bytes written. A peer that cannot be resolved
    /// is logged and skipped with `Ok(0)`.
    async fn send_to(&self, message: &Message, peer: &PeerAddr) -> Result<usize>;

    /// Wait for the next datagram and decode it.
    ///
    /// Must be cancel safe: the reactor drops this future whenever a timer
    /// fires first.
    async fn recv_from(&self) -> Result<(Message, SocketAddr)>;

    /// Bounded-wait receive; expiry yields [`GossipError::Timeout`]
    async fn recv_timeout(&self, deadline: Duration) -> Result<(Message, SocketAddr)> {
        match tokio::time::timeout(deadline, self.recv_from()).await {
            Ok(result) => result,
            Err(_) => Err(GossipError::Timeout(deadline)),
        }
    }

    /// Get the local bind address
    fn local_addr(&self) -> SocketAddr;
}

/// Wait for `lookup` at most `deadline`
async fn bounded<F>(lookup: F, deadline: Duration) -> Result<SocketAddr>
where
    F: Future<Output = Result<SocketAddr>>,
{
    tokio::time::timeout(deadline, lookup)
        .await
        .map_err(|_| GossipError::Timeout(deadline))?
}

/// Upper bound on resolving a destination name during a send
pub const DEFAULT_RESOLVE_TIMEOUT: Duration = Duration::from_millis(100);

/// UDP transport: one socket for both directions
pub struct UdpTransport {
    socket: UdpSocket,
    local_addr: SocketAddr,
    max_packet_size: usize,
    resolve_timeout: Duration,
}

impl UdpTransport {
    /// Bind a UDP socket on `addr`
    pub async fn bind(addr: SocketAddr, max_packet_size: usize) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;

        debug!("UDP transport bound on {}", local_addr);

        Ok(Self {
            socket,
            local_addr,
            max_packet_size,
            resolve_timeout: DEFAULT_RESOLVE_TIMEOUT,
        })
    }

    /// Set how long a send may wait on name resolution
    pub fn with_resolve_timeout(mut self, timeout: Duration) -> Self {
        self.resolve_timeout = timeout;
        self
    }

    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send_to(&self, message: &Message, peer: &PeerAddr) -> Result<usize> {
        let addr = match bounded(peer.resolve(), self.resolve_timeout).await {
            Ok(addr) => addr,
            Err(e) => {
                warn!("Dropping {} message for {}: {}", message.kind(), peer, e);
                return Ok(0);
            }
        };

        let bytes = message.to_bytes()?;

        if bytes.len() > self.max_packet_size {
            return Err(GossipError::PacketTooLarge {
                size: bytes.len(),
                max: self.max_packet_size,
            });
        }

        let sent = self.socket.send_to(&bytes, addr).await?;
        if sent != bytes.len() {
            warn!("Partial send: {} of {} bytes to {}", sent, bytes.len(), addr);
        }
        debug!("Sent {} message ({} bytes) to {}", message.kind(), sent, peer);

        Ok(sent)
    }

    async fn recv_from(&self) -> Result<(Message, SocketAddr)> {
        // One spare byte detects datagrams larger than the limit
        let mut buf = vec![0u8; self.max_packet_size + 1];
        let (len, src) = self.socket.recv_from(&mut buf).await?;

        if len > self.max_packet_size {
            warn!("Discarding oversized datagram from {}", src);
            return Err(GossipError::PacketTooLarge {
                size: len,
                max: self.max_packet_size,
            });
        }

        match Message::from_bytes(&buf[..len]) {
            Ok(message) => {
                debug!("Received {} message from {}", message.kind(), src);
                Ok((message, src))
            }
            Err(e) => {
                warn!("Failed to decode message from {}: {}", src, e);
                Err(GossipError::Codec(e))
            }
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}
