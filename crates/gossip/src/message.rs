//! Gossip message types and wire encoding

use crate::membership::{epoch_secs, from_epoch_secs, Snapshot};
use crate::peer::PeerAddr;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;
use tracing::debug;

/// Type of gossip message. On the wire this is the integer `action` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum MessageKind {
    /// Liveness probe
    Ping = 1,
    /// Response to a ping
    Pong = 2,
    /// Anti-entropy exchange carrying the sender's membership table
    Membership = 3,
}

impl From<MessageKind> for u8 {
    fn from(kind: MessageKind) -> Self {
        kind as u8
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageKind::Ping),
            2 => Ok(MessageKind::Pong),
            3 => Ok(MessageKind::Membership),
            other => Err(format!("unknown message action {}", other)),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::Ping => "PING",
            MessageKind::Pong => "PONG",
            MessageKind::Membership => "MEMBERSHIP",
        };
        f.write_str(name)
    }
}

/// Serde module for `SystemTime` as integer epoch seconds
mod epoch_time {
    use super::{epoch_secs, from_epoch_secs};
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::SystemTime;

    pub fn serialize<S>(time: &SystemTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        epoch_secs(*time).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SystemTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        // Only integers are accepted; formatted time strings are rejected
        let secs = u64::deserialize(deserializer)?;
        from_epoch_secs(secs)
            .ok_or_else(|| D::Error::custom(format!("time {} is out of range", secs)))
    }
}

/// A gossip message.
///
/// `id` and `created_at` are fixed at construction (second granularity;
/// the id is for log correlation only and may collide).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    id: u64,

    #[serde(rename = "action")]
    kind: MessageKind,

    #[serde(rename = "time", with = "epoch_time")]
    created_at: SystemTime,

    #[serde(default, skip_serializing_if = "Snapshot::is_empty")]
    members: Snapshot,
}

impl Message {
    /// Create a message of the given kind stamped with the current time
    pub fn new(kind: MessageKind) -> Self {
        Self::with_members(kind, Snapshot::new())
    }

    fn with_members(kind: MessageKind, members: Snapshot) -> Self {
        let now = SystemTime::now();
        let secs = epoch_secs(now);
        Self {
            id: secs,
            kind,
            created_at: from_epoch_secs(secs).unwrap_or(now),
            members,
        }
    }

    /// Create a ping message
    pub fn ping() -> Self {
        Self::new(MessageKind::Ping)
    }

    /// Create a pong message
    pub fn pong() -> Self {
        Self::new(MessageKind::Pong)
    }

    /// Create a membership exchange carrying `members`
    pub fn membership(members: Snapshot) -> Self {
        Self::with_members(MessageKind::Membership, members)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn members(&self) -> &Snapshot {
        &self.members
    }

    /// Take the embedded snapshot
    pub fn into_members(self) -> Snapshot {
        self.members
    }

    /// Serialize the message to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize a message from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        let mut message: Message = serde_json::from_slice(bytes)?;

        if message.kind != MessageKind::Membership && !message.members.is_empty() {
            debug!(
                "Dropping {} members carried by a {} message",
                message.members.len(),
                message.kind
            );
            message.members = Snapshot::new();
        }

        Ok(message)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{id: {}, kind: {}, time: {}, members: {}}}",
            self.id,
            self.kind,
            epoch_secs(self.created_at),
            self.members.len()
        )
    }
}

/// A message paired with a peer: the sender for inbound items, the
/// destination for outbound ones
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub peer: PeerAddr,
    pub message: Message,
}

impl Packet {
    pub fn new(peer: PeerAddr, message: Message) -> Self {
        Self { peer, message }
    }
}
