//! Peer addressing

use crate::{GossipError, Result};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tracing::debug;

/// Address of a node in `host:port` form.
///
/// This is the membership table key and the key of every entry in a
/// disseminated snapshot, so it compares by value. The host may be a name;
/// it is only resolved when a datagram is actually sent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct PeerAddr(String);

impl PeerAddr {
    /// Parse `host`, `host:port`, an IP literal or `[v6]:port`.
    ///
    /// Inputs without a port get `default_port`.
    pub fn parse(input: &str, default_port: u16) -> Result<Self> {
        let input = input.trim();

        if let Ok(addr) = input.parse::<SocketAddr>() {
            return Ok(Self::from_socket_addr(addr));
        }

        let bare = input
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
            .unwrap_or(input);
        if let Ok(ip) = bare.parse::<IpAddr>() {
            return Ok(Self::from_socket_addr(SocketAddr::new(ip, default_port)));
        }

        let (host, port) = match input.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| {
                    GossipError::Configuration(format!("Invalid port in address '{}'", input))
                })?;
                (host, port)
            }
            None => (input, default_port),
        };

        if host.is_empty() {
            return Err(GossipError::Configuration(format!(
                "Missing host in address '{}'",
                input
            )));
        }

        if host.contains(|c: char| c.is_whitespace() || c == ':' || c == '/') {
            return Err(GossipError::Configuration(format!(
                "Invalid host in address '{}'",
                input
            )));
        }

        Ok(Self(format!("{}:{}", host, port)))
    }

    /// Parse a `host:port` key received from a peer. Unlike [`PeerAddr::parse`]
    /// the port is mandatory and must be non-zero.
    pub fn parse_endpoint(input: &str) -> Result<Self> {
        let addr = Self::parse(input, 0)?;
        match addr.port() {
            Some(port) if port != 0 => Ok(addr),
            _ => Err(GossipError::Configuration(format!(
                "Missing port in address '{}'",
                input
            ))),
        }
    }

    /// Parse a listen address; an empty host (`:8000`) means every interface
    pub fn parse_listen(input: &str, default_port: u16) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Ok(Self::from_socket_addr(SocketAddr::new(
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                default_port,
            )));
        }

        match input.strip_prefix(':') {
            Some(port) if !port.contains(':') => {
                let port = port.parse::<u16>().map_err(|_| {
                    GossipError::Configuration(format!("Invalid port in address '{}'", input))
                })?;
                Ok(Self::from_socket_addr(SocketAddr::new(
                    IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                    port,
                )))
            }
            _ => Self::parse(input, default_port),
        }
    }

    /// Address of a resolved socket endpoint
    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        Self(addr.to_string())
    }

    /// Address of the sender of a datagram.
    ///
    /// The source endpoint seen on a UDP socket may carry an ephemeral port
    /// that nothing listens on. With a canonical port the observed port is
    /// replaced so the table only ever holds reachable listen addresses.
    pub fn observed(src: SocketAddr, canonical_port: Option<u16>) -> Self {
        let ip = src.ip().to_canonical();
        let port = canonical_port.unwrap_or(src.port());
        Self::from_socket_addr(SocketAddr::new(ip, port))
    }

    /// Resolve the address to a socket endpoint
    pub async fn resolve(&self) -> Result<SocketAddr> {
        let mut addrs = tokio::net::lookup_host(self.0.as_str())
            .await
            .map_err(|e| GossipError::Resolve(format!("{}: {}", self.0, e)))?;

        addrs
            .next()
            .ok_or_else(|| GossipError::Resolve(format!("{}: no addresses", self.0)))
    }

    /// The `host:port` string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The port component, if the address has one
    pub fn port(&self) -> Option<u16> {
        self.0
            .rsplit_once(':')
            .and_then(|(_, port)| port.parse().ok())
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Every address under which peers may know the local node.
///
/// A socket bound to a wildcard address is gossiped under the host's
/// concrete addresses, never under `0.0.0.0`, so those all count as self.
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    primary: PeerAddr,
    aliases: BTreeSet<PeerAddr>,
}

impl LocalIdentity {
    /// Identity made of a single address
    pub fn new(primary: PeerAddr) -> Self {
        let aliases = BTreeSet::from([primary.clone()]);
        Self { primary, aliases }
    }

    /// Identities of a socket bound on `bound`.
    ///
    /// For a wildcard bind this adds the loopback addresses and whatever
    /// the host name resolves to, all on the bound port.
    pub async fn discover(bound: SocketAddr) -> Self {
        let mut identity = Self::new(PeerAddr::from_socket_addr(bound));
        if !bound.ip().is_unspecified() {
            return identity;
        }

        let port = bound.port();
        identity.insert_socket(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port));
        identity.insert_socket(SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), port));

        let name = match hostname::get() {
            Ok(name) => name.to_string_lossy().into_owned(),
            Err(e) => {
                debug!("Cannot read host name: {}", e);
                return identity;
            }
        };

        if let Ok(addr) = PeerAddr::parse(&name, port) {
            identity.aliases.insert(addr);
        }

        match tokio::net::lookup_host((name.as_str(), port)).await {
            Ok(addrs) => {
                for addr in addrs {
                    identity.insert_socket(addr);
                }
            }
            Err(e) => debug!("Cannot resolve host name {}: {}", name, e),
        }

        debug!("Local node known as {}", identity);
        identity
    }

    fn insert_socket(&mut self, addr: SocketAddr) {
        let addr = SocketAddr::new(addr.ip().to_canonical(), addr.port());
        self.aliases.insert(PeerAddr::from_socket_addr(addr));
    }

    /// The bound address, used in logs
    pub fn primary(&self) -> &PeerAddr {
        &self.primary
    }

    pub fn contains(&self, addr: &PeerAddr) -> bool {
        self.aliases.contains(addr)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerAddr> {
        self.aliases.iter()
    }
}

impl fmt::Display for LocalIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.primary)?;
        let others: Vec<&str> = self
            .aliases
            .iter()
            .filter(|addr| **addr != self.primary)
            .map(PeerAddr::as_str)
            .collect();
        if !others.is_empty() {
            write!(f, " ({})", others.join(", "))?;
        }
        Ok(())
    }
}
