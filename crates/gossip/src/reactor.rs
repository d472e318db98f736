//! The gossip event loop.
//!
//! A single worker owns the membership table and two FIFO work queues. Each
//! iteration handles exactly one ready event, in strict priority order:
//!
//! 1. anti-entropy tick: push the whole table to one random peer
//! 2. one outbound packet: write it to the socket
//! 3. one inbound packet: touch the sender, then answer or merge
//! 4. heartbeat tick: PING a few random peers
//! 5. eviction tick: drop peers older than the TTL
//! 6. otherwise a receive bounded by `receive_timeout`
//!
//! Nothing in here is fatal. Every failure is logged and only ends the
//! event that produced it.

use crate::{
    config::GossipConfig,
    membership::SharedMembership,
    message::{Message, MessageKind, Packet},
    peer::{LocalIdentity, PeerAddr},
    transport::Transport,
    Result,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Ticker whose first tick is one full period away
fn ticker(period: Duration) -> Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Single-worker gossip state machine
pub struct Reactor {
    /// Local node addresses, stripped from every incoming snapshot
    local: LocalIdentity,

    config: GossipConfig,

    membership: SharedMembership,

    transport: Arc<dyn Transport>,

    inbound_tx: mpsc::Sender<Packet>,
    inbound_rx: mpsc::Receiver<Packet>,

    outbound_tx: mpsc::Sender<Packet>,
    outbound_rx: mpsc::Receiver<Packet>,
}

impl Reactor {
    /// Create a reactor over an existing table and transport
    pub fn new(
        local: LocalIdentity,
        config: GossipConfig,
        membership: SharedMembership,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(config.queue_capacity);
        let (outbound_tx, outbound_rx) = mpsc::channel(config.queue_capacity);

        Self {
            local,
            config,
            membership,
            transport,
            inbound_tx,
            inbound_rx,
            outbound_tx,
            outbound_rx,
        }
    }

    /// Run until the process exits
    pub async fn run(mut self) {
        info!(
            "Starting gossip reactor for {} with {} known peers",
            self.local,
            self.membership.read().await.len()
        );

        let mut exchange = ticker(self.config.exchange_interval);
        let mut heartbeat = ticker(self.config.heartbeat_interval);
        let mut eviction = ticker(self.config.eviction_interval);
        let receive_timeout = self.config.receive_timeout;

        loop {
            tokio::select! {
                biased;

                _ = exchange.tick() => {
                    self.on_exchange_tick().await;
                }

                Some(packet) = self.outbound_rx.recv() => {
                    self.dispatch(packet).await;
                }

                Some(packet) = self.inbound_rx.recv() => {
                    self.handle_inbound(packet).await;
                }

                _ = heartbeat.tick() => {
                    self.on_heartbeat_tick().await;
                }

                _ = eviction.tick() => {
                    self.on_eviction_tick().await;
                }

                result = self.transport.recv_timeout(receive_timeout) => {
                    self.on_receive(result);
                }
            }
        }
    }

    /// Anti-entropy: send a copy of the whole table to one random peer
    pub(crate) async fn on_exchange_tick(&mut self) {
        let (target, snapshot) = {
            let membership = self.membership.read().await;
            (membership.random_peer(), membership.snapshot())
        };

        match target {
            Some((peer, _)) => {
                debug!("Exchanging {} members with {}", snapshot.len(), peer);
                self.enqueue_outbound(Packet::new(peer, Message::membership(snapshot)));
            }
            None => debug!("No peers to exchange membership with"),
        }

        let membership = self.membership.read().await;
        info!("Members ({}): {}", membership.len(), *membership);
    }

    /// Write one outbound packet; failures drop the packet
    pub(crate) async fn dispatch(&mut self, packet: Packet) {
        if let Err(e) = self.transport.send_to(&packet.message, &packet.peer).await {
            warn!(
                "Failed to send {} to {}: {}",
                packet.message.kind(),
                packet.peer,
                e
            );
        }
    }

    /// Any message is proof of life; PINGs are answered and snapshots merged
    pub(crate) async fn handle_inbound(&mut self, packet: Packet) {
        let Packet { peer, message } = packet;

        if self.local.contains(&peer) {
            debug!("Ignoring {} from the local address", message.kind());
            return;
        }

        self.membership.write().await.touch(&peer);

        match message.kind() {
            MessageKind::Ping => {
                self.enqueue_outbound(Packet::new(peer, Message::pong()));
            }
            MessageKind::Pong => {
                debug!("PONG from {}", peer);
            }
            MessageKind::Membership => {
                let mut snapshot = message.into_members();
                for addr in self.local.iter() {
                    snapshot.remove(addr);
                }

                let report = self.membership.write().await.merge(snapshot);
                debug!(
                    "Merged snapshot from {}: {} added, {} updated, {} stale",
                    peer,
                    report.added,
                    report.updated,
                    report.stale.len()
                );
            }
        }
    }

    /// PING `heartbeat_fanout` random peers; draws are independent
    pub(crate) async fn on_heartbeat_tick(&mut self) {
        for _ in 0..self.config.heartbeat_fanout {
            let target = self.membership.read().await.random_peer();

            match target {
                Some((peer, _)) => {
                    self.enqueue_outbound(Packet::new(peer, Message::ping()));
                }
                None => {
                    debug!("No peers to ping");
                    break;
                }
            }
        }
    }

    pub(crate) async fn on_eviction_tick(&mut self) {
        let evicted = self
            .membership
            .write()
            .await
            .evict_stale(SystemTime::now());

        if !evicted.is_empty() {
            info!("Evicted {} peers", evicted.len());
        }
    }

    /// Queue a decoded datagram under the sender's canonical address
    pub(crate) fn on_receive(&mut self, result: Result<(Message, SocketAddr)>) {
        match result {
            Ok((message, src)) => {
                let peer = PeerAddr::observed(src, self.config.canonical_port);
                self.enqueue_inbound(Packet::new(peer, message));
            }
            Err(e) if e.is_timeout() => {}
            Err(e) => debug!("Receive failed: {}", e),
        }
    }

    // The worker is the only consumer of both queues, so it must never
    // await space in them.
    fn enqueue_outbound(&self, packet: Packet) {
        Self::enqueue(&self.outbound_tx, "outbound", packet);
    }

    fn enqueue_inbound(&self, packet: Packet) {
        Self::enqueue(&self.inbound_tx, "inbound", packet);
    }

    fn enqueue(queue: &mpsc::Sender<Packet>, name: &'static str, packet: Packet) {
        match queue.try_send(packet) {
            Ok(()) => {}
            Err(TrySendError::Full(packet)) => {
                warn!(
                    "{}: dropping {} for {}",
                    crate::GossipError::QueueFull(name),
                    packet.message.kind(),
                    packet.peer
                );
            }
            Err(TrySendError::Closed(packet)) => {
                warn!(
                    "{} queue closed: dropping {} for {}",
                    name,
                    packet.message.kind(),
                    packet.peer
                );
            }
        }
    }
}
