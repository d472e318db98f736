//! High-level gossip node: configuration, socket and reactor wired together

use crate::{
    config::GossipConfig,
    membership::{Membership, SharedMembership},
    peer::{LocalIdentity, PeerAddr},
    reactor::Reactor,
    transport::{Transport, UdpTransport},
    GossipError, Result,
};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// A bound gossip node, ready to run
pub struct GossipNode {
    /// Local gossip address
    local_addr: PeerAddr,

    /// Bound socket address
    socket_addr: SocketAddr,

    membership: SharedMembership,

    reactor: Reactor,
}

impl GossipNode {
    /// Validate `config`, resolve the listen and seed addresses, bind the
    /// socket and pre-populate the table with the seeds.
    ///
    /// Any failure here is a startup error; nothing is running yet.
    pub async fn bind(
        config: GossipConfig,
        listen: PeerAddr,
        seeds: Vec<PeerAddr>,
    ) -> Result<Self> {
        config.validate().map_err(GossipError::Configuration)?;

        let bind_addr = listen.resolve().await?;
        let transport = UdpTransport::bind(bind_addr, config.max_packet_size).await?;
        let transport = transport.with_resolve_timeout(config.receive_timeout);
        let socket_addr = transport.local_addr();
        let identity = LocalIdentity::discover(socket_addr).await;
        let local_addr = identity.primary().clone();

        let mut seed_addrs = Vec::with_capacity(seeds.len());
        for seed in seeds {
            let resolved = PeerAddr::from_socket_addr(seed.resolve().await?);
            if identity.contains(&resolved) {
                warn!("Skipping seed {}: it is the local node", seed);
                continue;
            }
            seed_addrs.push(resolved);
        }

        info!("Gossip node {} seeded with {} peers", identity, seed_addrs.len());

        let membership = Arc::new(RwLock::new(Membership::with_seeds(
            seed_addrs,
            config.peer_ttl,
            config.merge_policy,
            SystemTime::now(),
        )));

        let reactor = Reactor::new(identity, config, membership.clone(), Arc::new(transport));

        Ok(Self {
            local_addr,
            socket_addr,
            membership,
            reactor,
        })
    }

    /// Get the local gossip address
    pub fn local_addr(&self) -> &PeerAddr {
        &self.local_addr
    }

    /// Get the bound socket address
    pub fn socket_addr(&self) -> SocketAddr {
        self.socket_addr
    }

    /// Shared handle to the membership table, for observers
    pub fn membership(&self) -> SharedMembership {
        self.membership.clone()
    }

    /// Spawn the reactor as the node's single worker
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.reactor.run())
    }
}

/// Builder for creating gossip nodes with custom configuration
pub struct GossipNodeBuilder {
    listen: Option<PeerAddr>,
    seeds: Vec<PeerAddr>,
    config: GossipConfig,
}

impl Default for GossipNodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GossipNodeBuilder {
    /// Create a new gossip node builder
    pub fn new() -> Self {
        Self {
            listen: None,
            seeds: Vec::new(),
            config: GossipConfig::default(),
        }
    }

    /// Set the listen address
    pub fn with_listen_addr(mut self, addr: PeerAddr) -> Self {
        self.listen = Some(addr);
        self
    }

    /// Add a seed peer
    pub fn with_seed(mut self, seed: PeerAddr) -> Self {
        self.seeds.push(seed);
        self
    }

    /// Add several seed peers
    pub fn with_seeds<I: IntoIterator<Item = PeerAddr>>(mut self, seeds: I) -> Self {
        self.seeds.extend(seeds);
        self
    }

    /// Set the gossip configuration
    pub fn with_config(mut self, config: GossipConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the gossip node. Without a listen address an ephemeral
    /// loopback port is used.
    pub async fn build(self) -> Result<GossipNode> {
        let listen = self.listen.unwrap_or_else(|| {
            PeerAddr::from_socket_addr(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
        });

        GossipNode::bind(self.config, listen, self.seeds).await
    }
}
