//! Membership table for the gossip protocol

use crate::peer::PeerAddr;
use rand::seq::IteratorRandom;
use serde::de::{Deserializer, Error as _};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Membership table behind the reactor's exclusion lock.
///
/// Only the reactor worker touches the table today. Every iteration and
/// every mutation still goes through this lock so that a second writer
/// (for example a dedicated receive task) stays correct.
pub type SharedMembership = Arc<RwLock<Membership>>;

/// How a timestamp from an incoming snapshot combines with the local one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// The incoming timestamp replaces the local one, even when older.
    /// A peer with an older view can regress our record of a live node.
    Overwrite,
    /// Keep whichever of the two timestamps is more recent
    #[default]
    Newest,
}

/// Seconds since the Unix epoch, clamped to zero for pre-epoch times
pub fn epoch_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// Inverse of [`epoch_secs`]; `None` when `secs` is past what `SystemTime`
/// can represent
pub fn from_epoch_secs(secs: u64) -> Option<SystemTime> {
    UNIX_EPOCH.checked_add(Duration::from_secs(secs))
}

/// True when `seen` is more than `ttl` older than `now`.
/// Timestamps ahead of `now` (clock skew between peers) count as fresh.
fn is_expired(seen: SystemTime, now: SystemTime, ttl: Duration) -> bool {
    now.duration_since(seen).map(|age| age > ttl).unwrap_or(false)
}

/// Point-in-time copy of a membership table, as carried by a
/// MEMBERSHIP message. Serialises as `{ "host:port": epoch_secs }`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    entries: BTreeMap<PeerAddr, SystemTime>,
}

impl Snapshot {
    /// Create an empty snapshot
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, addr: PeerAddr, last_seen: SystemTime) {
        self.entries.insert(addr, last_seen);
    }

    pub fn remove(&mut self, addr: &PeerAddr) -> Option<SystemTime> {
        self.entries.remove(addr)
    }

    pub fn contains(&self, addr: &PeerAddr) -> bool {
        self.entries.contains_key(addr)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PeerAddr, &SystemTime)> {
        self.entries.iter()
    }
}

impl FromIterator<(PeerAddr, SystemTime)> for Snapshot {
    fn from_iter<I: IntoIterator<Item = (PeerAddr, SystemTime)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for Snapshot {
    type Item = (PeerAddr, SystemTime);
    type IntoIter = std::collections::btree_map::IntoIter<PeerAddr, SystemTime>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl Serialize for Snapshot {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (addr, last_seen) in &self.entries {
            map.serialize_entry(addr, &epoch_secs(*last_seen))?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Snapshot {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = BTreeMap::<String, u64>::deserialize(deserializer)?;
        let mut snapshot = Snapshot::new();

        for (key, secs) in raw {
            let seen = from_epoch_secs(secs).ok_or_else(|| {
                D::Error::custom(format!("timestamp {} for '{}' is out of range", secs, key))
            })?;

            // Unparseable keys are dropped one by one
            match PeerAddr::parse_endpoint(&key) {
                Ok(addr) => snapshot.insert(addr, seen),
                Err(e) => warn!("Skipping snapshot entry: {}", e),
            }
        }

        Ok(snapshot)
    }
}

/// Outcome of merging a snapshot into the table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Peers that were not in the table before
    pub added: usize,
    /// Existing peers whose timestamp changed
    pub updated: usize,
    /// Entries dropped because they were already past the TTL
    pub stale: Vec<PeerAddr>,
}

/// Local view of peer liveness: peer address to last-seen time
#[derive(Debug, Clone)]
pub struct Membership {
    members: HashMap<PeerAddr, SystemTime>,
    ttl: Duration,
    policy: MergePolicy,
}

impl Membership {
    /// Create an empty table
    pub fn new(ttl: Duration, policy: MergePolicy) -> Self {
        Self {
            members: HashMap::new(),
            ttl,
            policy,
        }
    }

    /// Create a table pre-populated with seeds, each optimistically seen at `now`
    pub fn with_seeds<I>(seeds: I, ttl: Duration, policy: MergePolicy, now: SystemTime) -> Self
    where
        I: IntoIterator<Item = PeerAddr>,
    {
        Self {
            members: seeds.into_iter().map(|addr| (addr, now)).collect(),
            ttl,
            policy,
        }
    }

    /// Record that `addr` was heard from just now
    pub fn touch(&mut self, addr: &PeerAddr) -> bool {
        self.touch_at(addr, SystemTime::now())
    }

    /// Set `addr`'s last-seen time to `now`, returning true if the peer is new
    pub fn touch_at(&mut self, addr: &PeerAddr, now: SystemTime) -> bool {
        let discovered = self.members.insert(addr.clone(), now).is_none();
        if discovered {
            info!("Discovered peer {}", addr);
        }
        discovered
    }

    /// Merge a snapshot received from a peer, as of now
    pub fn merge(&mut self, incoming: Snapshot) -> MergeReport {
        self.merge_at(incoming, SystemTime::now())
    }

    /// Merge a snapshot received from a peer.
    ///
    /// The caller strips the local node's own address first so a node never
    /// re-admits itself.
    pub fn merge_at(&mut self, incoming: Snapshot, now: SystemTime) -> MergeReport {
        let ttl = self.ttl;
        let policy = self.policy;
        let mut report = MergeReport::default();

        for (addr, seen) in incoming {
            if is_expired(seen, now, ttl) {
                warn!("Ignoring expired peer {} from snapshot", addr);
                report.stale.push(addr);
                continue;
            }

            match self.members.entry(addr) {
                Entry::Vacant(entry) => {
                    info!("Discovered peer {} via gossip", entry.key());
                    entry.insert(seen);
                    report.added += 1;
                }
                Entry::Occupied(mut entry) => {
                    let next = match policy {
                        MergePolicy::Overwrite => seen,
                        MergePolicy::Newest => (*entry.get()).max(seen),
                    };
                    if next != *entry.get() {
                        entry.insert(next);
                        report.updated += 1;
                    }
                }
            }
        }

        report
    }

    /// Pick one entry uniformly at random; `None` when the table is empty
    pub fn random_peer(&self) -> Option<(PeerAddr, SystemTime)> {
        self.members
            .iter()
            .choose(&mut rand::thread_rng())
            .map(|(addr, seen)| (addr.clone(), *seen))
    }

    /// Remove every entry older than the TTL and return the removed addresses
    pub fn evict_stale(&mut self, now: SystemTime) -> Vec<PeerAddr> {
        let ttl = self.ttl;
        let mut evicted = Vec::new();

        self.members.retain(|addr, seen| {
            if is_expired(*seen, now, ttl) {
                info!("Peer {} expired", addr);
                evicted.push(addr.clone());
                false
            } else {
                true
            }
        });

        if !evicted.is_empty() {
            debug!("Evicted {} stale peers, {} remain", evicted.len(), self.members.len());
        }

        evicted.sort();
        evicted
    }

    pub fn remove(&mut self, addr: &PeerAddr) -> Option<SystemTime> {
        self.members.remove(addr)
    }

    pub fn contains(&self, addr: &PeerAddr) -> bool {
        self.members.contains_key(addr)
    }

    pub fn last_seen(&self, addr: &PeerAddr) -> Option<SystemTime> {
        self.members.get(addr).copied()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Known peer addresses in sorted order
    pub fn peers(&self) -> Vec<PeerAddr> {
        let mut peers: Vec<PeerAddr> = self.members.keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Deep copy of the table; later mutation does not affect it
    pub fn snapshot(&self) -> Snapshot {
        self.members
            .iter()
            .map(|(addr, seen)| (addr.clone(), *seen))
            .collect()
    }
}

impl fmt::Display for Membership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let peers = self.peers();
        write!(f, "{{")?;
        for (i, peer) in peers.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", peer)?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(30);

    fn peer(s: &str) -> PeerAddr {
        PeerAddr::parse(s, 8000).unwrap()
    }

    fn secs_ago(now: SystemTime, secs: u64) -> SystemTime {
        now - Duration::from_secs(secs)
    }

    #[test]
    fn test_touch_records_most_recent_call() {
        let mut membership = Membership::new(TTL, MergePolicy::Newest);
        let a = peer("10.0.0.1");
        let now = SystemTime::now();

        assert!(membership.touch_at(&a, secs_ago(now, 10)));
        assert!(!membership.touch_at(&a, secs_ago(now, 2)));
        assert_eq!(membership.last_seen(&a), Some(secs_ago(now, 2)));

        // The most recent call wins even if its clock reading is earlier
        assert!(!membership.touch_at(&a, secs_ago(now, 5)));
        assert_eq!(membership.last_seen(&a), Some(secs_ago(now, 5)));
        assert_eq!(membership.len(), 1);
    }

    #[test]
    fn test_seeds_start_fresh() {
        let now = SystemTime::now();
        let membership = Membership::with_seeds(
            vec![peer("10.0.0.2"), peer("10.0.0.3")],
            TTL,
            MergePolicy::Newest,
            now,
        );

        assert_eq!(membership.len(), 2);
        assert_eq!(membership.last_seen(&peer("10.0.0.2")), Some(now));
    }

    #[test]
    fn test_merge_filters_stale_entries() {
        let now = SystemTime::now();
        let mut membership = Membership::new(TTL, MergePolicy::Overwrite);
        let stale = peer("10.0.0.4");
        let fresh = peer("10.0.0.5");

        let incoming: Snapshot = vec![
            (stale.clone(), secs_ago(now, 31)),
            (fresh.clone(), secs_ago(now, 29)),
        ]
        .into_iter()
        .collect();

        let report = membership.merge_at(incoming, now);

        assert_eq!(report.added, 1);
        assert_eq!(report.stale, vec![stale.clone()]);
        assert!(!membership.contains(&stale));
        assert_eq!(membership.last_seen(&fresh), Some(secs_ago(now, 29)));
    }

    #[test]
    fn test_stale_entry_leaves_local_value_untouched() {
        let now = SystemTime::now();
        let mut membership = Membership::new(TTL, MergePolicy::Overwrite);
        let a = peer("10.0.0.1");
        membership.touch_at(&a, secs_ago(now, 3));

        let incoming: Snapshot = vec![(a.clone(), secs_ago(now, 45))].into_iter().collect();
        membership.merge_at(incoming, now);

        assert_eq!(membership.last_seen(&a), Some(secs_ago(now, 3)));
    }

    #[test]
    fn test_overwrite_policy_accepts_older_timestamp() {
        let now = SystemTime::now();
        let mut membership = Membership::new(TTL, MergePolicy::Overwrite);
        let a = peer("10.0.0.1");
        membership.touch_at(&a, now);

        let incoming: Snapshot = vec![(a.clone(), secs_ago(now, 20))].into_iter().collect();
        let report = membership.merge_at(incoming, now);

        assert_eq!(report.updated, 1);
        assert_eq!(membership.last_seen(&a), Some(secs_ago(now, 20)));
    }

    #[test]
    fn test_newest_policy_never_regresses() {
        let now = SystemTime::now();
        let mut membership = Membership::new(TTL, MergePolicy::Newest);
        let a = peer("10.0.0.1");
        membership.touch_at(&a, secs_ago(now, 5));

        let older: Snapshot = vec![(a.clone(), secs_ago(now, 20))].into_iter().collect();
        let report = membership.merge_at(older, now);
        assert_eq!(report.updated, 0);
        assert_eq!(membership.last_seen(&a), Some(secs_ago(now, 5)));

        let newer: Snapshot = vec![(a.clone(), secs_ago(now, 1))].into_iter().collect();
        let report = membership.merge_at(newer, now);
        assert_eq!(report.updated, 1);
        assert_eq!(membership.last_seen(&a), Some(secs_ago(now, 1)));
    }

    #[test]
    fn test_future_timestamps_are_fresh() {
        let now = SystemTime::now();
        let mut membership = Membership::new(TTL, MergePolicy::Newest);
        let a = peer("10.0.0.1");

        let incoming: Snapshot = vec![(a.clone(), now + Duration::from_secs(90))]
            .into_iter()
            .collect();
        membership.merge_at(incoming, now);

        assert!(membership.contains(&a));
        assert!(membership.evict_stale(now).is_empty());
    }

    #[test]
    fn test_stripping_self_before_merge() {
        let now = SystemTime::now();
        let local = peer("10.0.0.1");
        let mut membership = Membership::new(TTL, MergePolicy::Newest);

        let mut incoming: Snapshot = vec![(local.clone(), now), (peer("10.0.0.2"), now)]
            .into_iter()
            .collect();
        incoming.remove(&local);
        membership.merge_at(incoming, now);

        assert!(!membership.contains(&local));
        assert_eq!(membership.len(), 1);
    }

    #[test]
    fn test_evict_stale() {
        let now = SystemTime::now();
        let mut membership = Membership::new(TTL, MergePolicy::Newest);
        let dead = peer("10.0.0.31");
        let alive = peer("10.0.0.29");
        let boundary = peer("10.0.0.30");
        membership.touch_at(&dead, secs_ago(now, 31));
        membership.touch_at(&alive, secs_ago(now, 29));
        membership.touch_at(&boundary, secs_ago(now, 30));

        let evicted = membership.evict_stale(now);

        assert_eq!(evicted, vec![dead.clone()]);
        assert!(!membership.contains(&dead));
        assert!(membership.contains(&alive));
        // Exactly TTL old is not past the TTL
        assert!(membership.contains(&boundary));
    }

    #[test]
    fn test_eviction_leaves_nothing_past_ttl() {
        let now = SystemTime::now();
        let mut membership = Membership::new(TTL, MergePolicy::Newest);
        for i in 0..60u64 {
            membership.touch_at(&peer(&format!("10.0.1.{}", i)), secs_ago(now, i));
        }

        let evicted = membership.evict_stale(now);

        assert_eq!(evicted.len(), 29);
        for addr in membership.peers() {
            let seen = membership.last_seen(&addr).unwrap();
            assert!(now.duration_since(seen).unwrap() <= TTL);
        }
    }

    #[test]
    fn test_random_peer_on_empty_table() {
        let membership = Membership::new(TTL, MergePolicy::Newest);
        assert!(membership.random_peer().is_none());
    }

    #[test]
    fn test_random_peer_coverage() {
        let mut membership = Membership::new(TTL, MergePolicy::Newest);
        let peers: Vec<PeerAddr> = (1..=5).map(|i| peer(&format!("10.0.0.{}", i))).collect();
        for p in &peers {
            membership.touch(p);
        }

        let mut counts: HashMap<PeerAddr, usize> = HashMap::new();
        for _ in 0..10_000 {
            let (addr, _) = membership.random_peer().unwrap();
            *counts.entry(addr).or_default() += 1;
        }

        // Expected 2000 each; the bounds are many standard deviations wide
        for p in &peers {
            let count = counts.get(p).copied().unwrap_or(0);
            assert!((1_500..=2_500).contains(&count), "{} drawn {} times", p, count);
        }
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let mut membership = Membership::new(TTL, MergePolicy::Newest);
        let a = peer("10.0.0.1");
        membership.touch(&a);

        let snapshot = membership.snapshot();
        membership.remove(&a);
        membership.touch(&peer("10.0.0.2"));

        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.contains(&a));
    }

    #[test]
    fn test_snapshot_wire_shape() {
        let seen = from_epoch_secs(1_700_000_000).unwrap();
        let snapshot: Snapshot = vec![(peer("10.0.0.1"), seen)].into_iter().collect();

        let json = serde_json::to_string(&snapshot).unwrap();
        assert_eq!(json, r#"{"10.0.0.1:8000":1700000000}"#);

        let back: Snapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snapshot);

        assert!(serde_json::from_str::<Snapshot>(r#"{"10.0.0.1:8000":"yesterday"}"#).is_err());
    }

    #[test]
    fn test_snapshot_rejects_out_of_range_timestamp() {
        let json = format!(r#"{{"10.0.0.1:8000":{}}}"#, u64::MAX);
        assert!(serde_json::from_str::<Snapshot>(&json).is_err());

        assert!(from_epoch_secs(u64::MAX).is_none());
        assert_eq!(from_epoch_secs(0), Some(UNIX_EPOCH));
    }

    #[test]
    fn test_snapshot_skips_invalid_keys() {
        let json = r#"{"":1,"garbage":1,"10.0.0.9:0":1,"10.0.0.1:8000":1700000000}"#;
        let snapshot: Snapshot = serde_json::from_str(json).unwrap();

        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.contains(&peer("10.0.0.1")));
    }

    #[test]
    fn test_display_lists_peers() {
        let mut membership = Membership::new(TTL, MergePolicy::Newest);
        assert_eq!(membership.to_string(), "{}");

        membership.touch(&peer("10.0.0.2"));
        membership.touch(&peer("10.0.0.1"));
        assert_eq!(membership.to_string(), "{10.0.0.1:8000, 10.0.0.2:8000}");
    }
}
