//! Transport bridge: interchangeable broadcast backends behind one trait.
//!
//! ```text
//! session ──▶ Transport::send(topic, event, payload)      (never blocks)
//!                  │
//!         ┌────────┼──────────────┐
//!         ▼        ▼              ▼
//!   RelayTransport MeshTransport LoopbackTransport
//!   (pub/sub hub)  (direct links) (in-process)
//!                  │
//!   incoming ──▶ SubscriberTable ──▶ Subscription (RAII route)
//!                  dispatch by (topic, event)
//! ```
//!
//! All backends deliver at-least-once; the CRDT layer upstream tolerates
//! duplicates. The network backends reconnect with capped exponential
//! backoff and queue envelopes published while the link is down (bounded,
//! oldest dropped first). Dropping a [`Subscription`] removes its route.

pub mod local;
pub mod mesh;
pub mod relay;

pub use local::{LoopbackHub, LoopbackTransport};
pub use mesh::MeshTransport;
pub use relay::RelayTransport;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, watch};

use conflux_graph::PeerId;

use crate::protocol::{Envelope, EventKind, ProtocolError};

/// Link health, surfaced on a `watch` channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkHealth {
    Connected,
    Reconnecting,
    Down,
}

/// Room membership changes observed by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Membership {
    Joined { topic: String, peer: PeerId },
    Left { topic: String, peer: PeerId },
}

/// A broadcast backend.
///
/// `send` enqueues to a writer task and returns immediately; it never
/// waits on the network. Envelope `sender`/`seq` fields are stamped by
/// the transport, so callers hand over payload bytes only.
#[async_trait]
pub trait Transport: Send + Sync {
    /// The peer identity this transport stamps on outgoing envelopes.
    fn local_peer(&self) -> PeerId;

    /// Broadcast a payload on a (topic, event) channel.
    fn send(&self, topic: &str, event: EventKind, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Open a route for envelopes matching (topic, event).
    async fn subscribe(&self, topic: &str, event: EventKind)
        -> Result<Subscription, TransportError>;

    /// Join/leave notifications for topics this transport participates in.
    fn membership(&self) -> broadcast::Receiver<Membership>;

    /// Remote peers currently known to share a room with this transport,
    /// sorted. Advisory; the presence tracker is the liveness authority.
    fn peers(&self) -> Vec<PeerId>;

    /// Current link health; `changed()` on the receiver observes flaps.
    fn health(&self) -> watch::Receiver<LinkHealth>;

    /// Tear down tasks and links. Idempotent.
    async fn disconnect(&self);
}

// ───────────────────────────────────────────────────────────────────
// Subscriptions
// ───────────────────────────────────────────────────────────────────

/// A live route for one (topic, event) pair. Dropping it removes the
/// route from the owning transport.
pub struct Subscription {
    topic: String,
    event: EventKind,
    id: u64,
    rx: mpsc::UnboundedReceiver<Envelope>,
    table: Arc<SubscriberTable>,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn event(&self) -> EventKind {
        self.event
    }

    /// Next envelope, or `None` once the transport is gone.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }

    /// Non-blocking variant; `None` when nothing is queued.
    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.table.remove(&self.topic, self.event, self.id);
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("event", &self.event)
            .field("id", &self.id)
            .finish()
    }
}

/// Fan-in routing table shared between a transport and its reader tasks.
/// Routes are keyed (topic, event); closed receivers are pruned on the
/// next dispatch that touches their key.
#[derive(Default)]
pub(crate) struct SubscriberTable {
    inner: Mutex<TableInner>,
}

#[derive(Default)]
struct TableInner {
    next_id: u64,
    routes: HashMap<(String, EventKind), Vec<Route>>,
}

struct Route {
    id: u64,
    tx: mpsc::UnboundedSender<Envelope>,
}

impl SubscriberTable {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn register(self: &Arc<Self>, topic: &str, event: EventKind) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        inner
            .routes
            .entry((topic.to_string(), event))
            .or_default()
            .push(Route { id, tx });
        Subscription {
            topic: topic.to_string(),
            event,
            id,
            rx,
            table: self.clone(),
        }
    }

    fn remove(&self, topic: &str, event: EventKind, id: u64) {
        let mut inner = self.inner.lock().unwrap();
        let key = (topic.to_string(), event);
        if let Some(routes) = inner.routes.get_mut(&key) {
            routes.retain(|route| route.id != id);
            if routes.is_empty() {
                inner.routes.remove(&key);
            }
        }
    }

    /// Deliver an envelope to every live route on its (topic, event) key.
    /// Returns how many routes received it.
    pub(crate) fn dispatch(&self, envelope: &Envelope) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let key = (envelope.topic.clone(), envelope.event);
        let delivered = match inner.routes.get_mut(&key) {
            Some(routes) => {
                routes.retain(|route| route.tx.send(envelope.clone()).is_ok());
                routes.len()
            }
            None => return 0,
        };
        if delivered == 0 {
            inner.routes.remove(&key);
        }
        delivered
    }

    /// Distinct topics with at least one route (used to resubscribe after
    /// a reconnect).
    pub(crate) fn topics(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        let mut topics: Vec<String> = inner.routes.keys().map(|(t, _)| t.clone()).collect();
        topics.sort();
        topics.dedup();
        topics
    }

    #[cfg(test)]
    fn route_count(&self) -> usize {
        self.inner.lock().unwrap().routes.values().map(Vec::len).sum()
    }
}

// ───────────────────────────────────────────────────────────────────
// Offline outbox
// ───────────────────────────────────────────────────────────────────

/// Envelopes published while the link is down, replayed on reconnect.
/// Bounded; when full the oldest envelope is dropped first.
pub(crate) struct Outbox {
    queue: VecDeque<Envelope>,
    max_size: usize,
    dropped: u64,
}

impl Outbox {
    pub(crate) fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size: max_size.max(1),
            dropped: 0,
        }
    }

    /// Queue an envelope for later replay. Returns `false` when an older
    /// envelope was displaced to make room.
    pub(crate) fn enqueue(&mut self, envelope: Envelope) -> bool {
        let mut fit = true;
        if self.queue.len() >= self.max_size {
            self.queue.pop_front();
            self.dropped += 1;
            fit = false;
        }
        self.queue.push_back(envelope);
        fit
    }

    /// Drain all queued envelopes for replay, oldest first.
    pub(crate) fn drain(&mut self) -> Vec<Envelope> {
        self.queue.drain(..).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Envelopes displaced since construction.
    pub(crate) fn dropped(&self) -> u64 {
        self.dropped
    }

    #[cfg(test)]
    fn total_bytes(&self) -> usize {
        self.queue.iter().map(|e| e.payload.len()).sum()
    }
}

// ───────────────────────────────────────────────────────────────────
// Reconnect backoff
// ───────────────────────────────────────────────────────────────────

/// Capped exponential delay sequence: base, 2x, 4x, ... up to cap.
pub(crate) struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub(crate) fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap, attempt: 0 }
    }

    pub(crate) fn next_delay(&mut self) -> Duration {
        let exp = self.attempt.min(16);
        let delay = self.base.saturating_mul(1u32 << exp).min(self.cap);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Call after a successful connect so the next drop starts from base.
    pub(crate) fn reset(&mut self) {
        self.attempt = 0;
    }
}

// ───────────────────────────────────────────────────────────────────
// Errors
// ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum TransportError {
    /// The transport has been disconnected or its writer task is gone.
    Closed,
    /// Initial connection failed.
    Connect(String),
    /// Frame codec failure.
    Protocol(ProtocolError),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "transport closed"),
            Self::Connect(e) => write!(f, "connect failed: {e}"),
            Self::Protocol(e) => write!(f, "protocol error: {e}"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<ProtocolError> for TransportError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}
