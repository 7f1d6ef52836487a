//! In-process loopback backend: a hub fanning envelopes between the
//! transports attached to it. No sockets, no tasks; used by tests and
//! benches to exercise multi-peer flows deterministically.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};

use conflux_graph::PeerId;

use super::{LinkHealth, Membership, SubscriberTable, Subscription, Transport, TransportError};
use crate::protocol::{Envelope, EventKind};

/// Shared fan-out point. Attach one [`LoopbackTransport`] per simulated
/// peer; every publish reaches every other attached peer synchronously.
pub struct LoopbackHub {
    inner: Mutex<HubInner>,
}

#[derive(Default)]
struct HubInner {
    peers: HashMap<PeerId, HubPeer>,
    rooms: HashMap<String, HashSet<PeerId>>,
}

struct HubPeer {
    table: Arc<SubscriberTable>,
    membership_tx: broadcast::Sender<Membership>,
}

impl LoopbackHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(HubInner::default()),
        })
    }

    /// Attach a transport for `peer`. Replaces any previous attachment
    /// under the same id.
    pub fn transport(self: &Arc<Self>, peer: PeerId) -> LoopbackTransport {
        let table = SubscriberTable::new();
        let (membership_tx, _) = broadcast::channel(64);
        let (health_tx, health_rx) = watch::channel(LinkHealth::Connected);

        let mut inner = self.inner.lock().unwrap();
        inner.peers.insert(
            peer,
            HubPeer {
                table: table.clone(),
                membership_tx: membership_tx.clone(),
            },
        );

        LoopbackTransport {
            hub: self.clone(),
            peer,
            table,
            membership_tx,
            health_tx,
            health_rx,
            seq: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn peer_count(&self) -> usize {
        self.inner.lock().unwrap().peers.len()
    }

    fn publish(&self, envelope: &Envelope) {
        let inner = self.inner.lock().unwrap();
        for (id, hub_peer) in &inner.peers {
            if *id == envelope.sender {
                continue;
            }
            hub_peer.table.dispatch(envelope);
        }
    }

    /// Room join: existing members hear `Joined{new}`, the joiner hears
    /// one `Joined` per existing member, mirroring the relay's roster
    /// behavior. Idempotent per (topic, peer).
    fn join(&self, topic: &str, peer: PeerId) {
        let mut inner = self.inner.lock().unwrap();
        let members = inner.rooms.entry(topic.to_string()).or_default();
        if !members.insert(peer) {
            return;
        }
        let members = members.clone();
        let joined = Membership::Joined {
            topic: topic.to_string(),
            peer,
        };
        for (id, hub_peer) in &inner.peers {
            if *id != peer && members.contains(id) {
                let _ = hub_peer.membership_tx.send(joined.clone());
            }
        }
        if let Some(joiner) = inner.peers.get(&peer) {
            for member in members.iter().filter(|m| **m != peer) {
                let _ = joiner.membership_tx.send(Membership::Joined {
                    topic: topic.to_string(),
                    peer: *member,
                });
            }
        }
    }

    /// Remote peers sharing at least one room with `peer`.
    fn peers_of(&self, peer: PeerId) -> Vec<PeerId> {
        let inner = self.inner.lock().unwrap();
        let mut peers: Vec<PeerId> = inner
            .rooms
            .values()
            .filter(|members| members.contains(&peer))
            .flat_map(|members| members.iter().copied())
            .filter(|id| *id != peer)
            .collect();
        peers.sort();
        peers.dedup();
        peers
    }

    /// Remove a peer from every room it joined, announcing departures.
    fn detach(&self, peer: PeerId) {
        let mut inner = self.inner.lock().unwrap();
        if inner.peers.remove(&peer).is_none() {
            return;
        }
        let mut left_topics = Vec::new();
        inner.rooms.retain(|topic, members| {
            if members.remove(&peer) {
                left_topics.push((topic.clone(), members.clone()));
            }
            !members.is_empty()
        });
        for (topic, members) in left_topics {
            let left = Membership::Left {
                topic,
                peer,
            };
            for (id, hub_peer) in &inner.peers {
                if members.contains(id) {
                    let _ = hub_peer.membership_tx.send(left.clone());
                }
            }
        }
    }
}

/// One simulated peer's endpoint on a [`LoopbackHub`].
pub struct LoopbackTransport {
    hub: Arc<LoopbackHub>,
    peer: PeerId,
    table: Arc<SubscriberTable>,
    membership_tx: broadcast::Sender<Membership>,
    health_tx: watch::Sender<LinkHealth>,
    health_rx: watch::Receiver<LinkHealth>,
    seq: AtomicU64,
    closed: AtomicBool,
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn local_peer(&self) -> PeerId {
        self.peer
    }

    fn send(&self, topic: &str, event: EventKind, payload: Vec<u8>) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let envelope = Envelope::new(topic, event, self.peer, seq, payload);
        self.hub.publish(&envelope);
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        event: EventKind,
    ) -> Result<Subscription, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let subscription = self.table.register(topic, event);
        self.hub.join(topic, self.peer);
        Ok(subscription)
    }

    fn membership(&self) -> broadcast::Receiver<Membership> {
        self.membership_tx.subscribe()
    }

    fn peers(&self) -> Vec<PeerId> {
        self.hub.peers_of(self.peer)
    }

    fn health(&self) -> watch::Receiver<LinkHealth> {
        self.health_rx.clone()
    }

    async fn disconnect(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.hub.detach(self.peer);
        let _ = self.health_tx.send(LinkHealth::Down);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn peer(n: u128) -> PeerId {
        PeerId::from_uuid(Uuid::from_u128(n))
    }

    #[tokio::test]
    async fn test_publish_reaches_other_peers_not_self() {
        let hub = LoopbackHub::new();
        let a = hub.transport(peer(1));
        let b = hub.transport(peer(2));

        let mut a_sub = a.subscribe("graph", EventKind::Message).await.unwrap();
        let mut b_sub = b.subscribe("graph", EventKind::Message).await.unwrap();

        a.send("graph", EventKind::Message, vec![7]).unwrap();

        let received = b_sub.recv().await.unwrap();
        assert_eq!(received.payload, vec![7]);
        assert_eq!(received.sender, peer(1));
        assert!(a_sub.try_recv().is_none(), "sender must not hear its own echo");
    }

    #[tokio::test]
    async fn test_seq_is_fifo_per_sender() {
        let hub = LoopbackHub::new();
        let a = hub.transport(peer(1));
        let b = hub.transport(peer(2));

        let mut b_sub = b.subscribe("graph", EventKind::Message).await.unwrap();
        for i in 0..4u8 {
            a.send("graph", EventKind::Message, vec![i]).unwrap();
        }
        for expected_seq in 0..4u64 {
            let envelope = b_sub.recv().await.unwrap();
            assert_eq!(envelope.seq, expected_seq);
            assert_eq!(envelope.payload, vec![expected_seq as u8]);
        }
    }

    #[tokio::test]
    async fn test_join_announces_both_directions() {
        let hub = LoopbackHub::new();
        let a = hub.transport(peer(1));
        let b = hub.transport(peer(2));

        let mut a_membership = a.membership();
        let mut b_membership = b.membership();

        let _a_sub = a.subscribe("room", EventKind::Awareness).await.unwrap();
        assert!(a.peers().is_empty());

        let _b_sub = b.subscribe("room", EventKind::Awareness).await.unwrap();

        // Existing member hears about the joiner, joiner hears the roster.
        assert_eq!(
            a_membership.recv().await.unwrap(),
            Membership::Joined { topic: "room".to_string(), peer: peer(2) }
        );
        assert_eq!(
            b_membership.recv().await.unwrap(),
            Membership::Joined { topic: "room".to_string(), peer: peer(1) }
        );
        assert_eq!(a.peers(), vec![peer(2)]);
        assert_eq!(b.peers(), vec![peer(1)]);
    }

    #[tokio::test]
    async fn test_disconnect_announces_departure_and_closes_sends() {
        let hub = LoopbackHub::new();
        let a = hub.transport(peer(1));
        let b = hub.transport(peer(2));

        let _a_sub = a.subscribe("room", EventKind::Awareness).await.unwrap();
        let _b_sub = b.subscribe("room", EventKind::Awareness).await.unwrap();
        let mut a_membership = a.membership();
        let _ = a_membership.recv().await; // b joined

        b.disconnect().await;
        assert_eq!(
            a_membership.recv().await.unwrap(),
            Membership::Left { topic: "room".to_string(), peer: peer(2) }
        );
        assert!(matches!(
            b.send("room", EventKind::Awareness, vec![]),
            Err(TransportError::Closed)
        ));
        assert_eq!(*b.health().borrow(), LinkHealth::Down);
        assert_eq!(hub.peer_count(), 1);

        // Idempotent.
        b.disconnect().await;
        assert_eq!(hub.peer_count(), 1);
    }

    #[tokio::test]
    async fn test_event_kinds_route_independently() {
        let hub = LoopbackHub::new();
        let a = hub.transport(peer(1));
        let b = hub.transport(peer(2));

        let mut cursors = b.subscribe("presence", EventKind::CursorMove).await.unwrap();
        let mut awareness = b.subscribe("presence", EventKind::Awareness).await.unwrap();

        a.send("presence", EventKind::CursorMove, vec![1]).unwrap();
        a.send("presence", EventKind::Awareness, vec![2]).unwrap();

        assert_eq!(cursors.recv().await.unwrap().payload, vec![1]);
        assert_eq!(awareness.recv().await.unwrap().payload, vec![2]);
        assert!(cursors.try_recv().is_none());
    }
}
