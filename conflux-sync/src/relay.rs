//! WebSocket relay: topic pub/sub with no knowledge of payload contents.
//!
//! ```text
//! Client A ──┐                       ┌── Client A (skip: own frame)
//!            ├── Room "p1:graph" ────┼── Client B
//! Client B ──┘        │              └── Client C
//!                     └── Room "p1:presence" ── …
//! ```
//!
//! Connections speak [`Frame`]s. A client Hellos once, subscribes to any
//! number of topics, and publishes envelopes; the relay fans each publish
//! out to the topic's other members verbatim. The relay never decodes
//! envelope payloads and never persists anything — durability belongs to
//! the peers' own persistence layer.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use conflux_graph::PeerId;

use crate::protocol::Frame;
use crate::rooms::{Room, RoomMap};

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to.
    pub bind_addr: String,
    /// Broadcast buffer per room receiver.
    pub room_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            room_capacity: 256,
        }
    }
}

/// Relay counters, read via [`RelayServer::stats`].
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub frames_forwarded: u64,
    pub bytes_in: u64,
    pub active_rooms: usize,
}

/// The relay server.
pub struct RelayServer {
    config: RelayConfig,
    rooms: RoomMap,
    stats: RwLock<RelayStats>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Arc<Self> {
        let rooms = RoomMap::new(config.room_capacity);
        Arc::new(Self {
            config,
            rooms,
            stats: RwLock::new(RelayStats::default()),
        })
    }

    pub fn with_defaults() -> Arc<Self> {
        Self::new(RelayConfig::default())
    }

    /// Bind the configured address and spawn the accept loop. Returns the
    /// actual bound address (useful with port 0).
    pub async fn serve(self: &Arc<Self>) -> std::io::Result<SocketAddr> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        let addr = listener.local_addr()?;
        log::info!("relay listening on {addr}");

        let state = self.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        log::debug!("relay: tcp connection from {peer_addr}");
                        let state = state.clone();
                        tokio::spawn(async move {
                            if let Err(e) = state.handle_connection(stream, peer_addr).await {
                                log::debug!("relay: connection {peer_addr} ended: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        log::error!("relay: accept failed: {e}");
                        break;
                    }
                }
            }
        });
        Ok(addr)
    }

    pub async fn stats(&self) -> RelayStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Drive one client connection until it closes.
    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws = tokio_tungstenite::accept_async(stream).await?;
        let (mut sink, mut source) = ws.split();

        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // Per-connection state: identity arrives in the Hello frame, one
        // forwarder task per subscribed topic feeds the outbound funnel.
        let mut peer: Option<PeerId> = None;
        let mut joined: HashMap<String, (Arc<Room>, tokio::task::JoinHandle<()>)> = HashMap::new();
        let (fwd_tx, mut fwd_rx) = mpsc::unbounded_channel::<Arc<Vec<u8>>>();

        loop {
            tokio::select! {
                incoming = source.next() => {
                    match incoming {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            {
                                let mut s = self.stats.write().await;
                                s.bytes_in += bytes.len() as u64;
                            }
                            let frame = match Frame::decode(&bytes) {
                                Ok(frame) => frame,
                                Err(e) => {
                                    log::warn!("relay: undecodable frame from {addr}: {e}");
                                    continue;
                                }
                            };
                            match frame {
                                Frame::Hello { peer: p } => {
                                    log::info!("relay: peer {p} connected from {addr}");
                                    peer = Some(p);
                                }
                                Frame::Subscribe { topic } => {
                                    let Some(me) = peer else {
                                        log::warn!("relay: subscribe before hello from {addr}");
                                        continue;
                                    };
                                    if joined.contains_key(&topic) {
                                        continue;
                                    }
                                    let room = self.rooms.get_or_create(&topic).await;
                                    let existing = room.members().await;
                                    let rx = room.join(me).await;
                                    let task = spawn_forwarder(
                                        rx,
                                        fwd_tx.clone(),
                                        room.clone(),
                                        me,
                                        topic.clone(),
                                    );
                                    joined.insert(topic.clone(), (room.clone(), task));

                                    let announce =
                                        Frame::PeerJoined { topic: topic.clone(), peer: me }
                                            .encode()?;
                                    room.publish(Arc::new(announce));

                                    // The joiner learns the current roster the
                                    // same way: one PeerJoined per member.
                                    for member in existing {
                                        if member == me {
                                            continue;
                                        }
                                        let frame =
                                            Frame::PeerJoined { topic: topic.clone(), peer: member }
                                                .encode()?;
                                        sink.send(Message::Binary(frame.into())).await?;
                                    }
                                    log::info!("relay: peer {me} joined {topic}");

                                    let mut s = self.stats.write().await;
                                    s.active_rooms = self.rooms.room_count().await;
                                }
                                Frame::Unsubscribe { topic } => {
                                    let Some(me) = peer else { continue };
                                    if let Some((room, task)) = joined.remove(&topic) {
                                        task.abort();
                                        self.depart(&room, &topic, me).await?;
                                    }
                                }
                                Frame::Publish(envelope) => {
                                    let Some(me) = peer else {
                                        log::warn!("relay: publish before hello from {addr}");
                                        continue;
                                    };
                                    if envelope.sender != me {
                                        log::warn!(
                                            "relay: peer {me} publishing as {}; dropped",
                                            envelope.sender
                                        );
                                        continue;
                                    }
                                    // Forward the original frame bytes; no
                                    // re-encode, no payload inspection.
                                    if let Some(room) = self.rooms.get(&envelope.topic).await {
                                        room.publish(Arc::new(bytes));
                                        let mut s = self.stats.write().await;
                                        s.frames_forwarded += 1;
                                    }
                                }
                                Frame::Ping => {
                                    sink.send(Message::Binary(Frame::Pong.encode()?.into()))
                                        .await?;
                                }
                                Frame::Pong => {}
                                Frame::PeerJoined { .. } | Frame::PeerLeft { .. } => {
                                    log::warn!("relay: client {addr} sent a server-only frame");
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            sink.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::debug!("relay: connection closed from {addr}");
                            break;
                        }
                        Some(Err(e)) => {
                            log::debug!("relay: socket error from {addr}: {e}");
                            break;
                        }
                        _ => {}
                    }
                }

                forwarded = fwd_rx.recv() => {
                    match forwarded {
                        Some(bytes) => {
                            sink.send(Message::Binary(bytes.as_ref().clone().into())).await?;
                        }
                        None => break,
                    }
                }
            }
        }

        // Teardown: leave every room and announce the departures.
        if let Some(me) = peer {
            for (topic, (room, task)) in joined.drain() {
                task.abort();
                if let Err(e) = self.depart(&room, &topic, me).await {
                    log::warn!("relay: departure announce failed for {topic}: {e}");
                }
            }
        }
        {
            let mut s = self.stats.write().await;
            s.active_connections -= 1;
            s.active_rooms = self.rooms.room_count().await;
        }

        Ok(())
    }

    /// Remove a peer from a room, announce, and collect the room if empty.
    async fn depart(
        &self,
        room: &Arc<Room>,
        topic: &str,
        peer: PeerId,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        room.leave(&peer).await;
        let announce = Frame::PeerLeft { topic: topic.to_string(), peer }.encode()?;
        room.publish(Arc::new(announce));
        if self.rooms.remove_if_empty(topic).await {
            log::info!("relay: room {topic} removed (empty)");
        }
        Ok(())
    }
}

/// Pump one room receiver into a connection's outbound funnel, skipping
/// frames the connection's own peer originated.
fn spawn_forwarder(
    mut rx: broadcast::Receiver<Arc<Vec<u8>>>,
    tx: mpsc::UnboundedSender<Arc<Vec<u8>>>,
    room: Arc<Room>,
    me: PeerId,
    topic: String,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(bytes) => {
                    if let Ok(frame) = Frame::decode(&bytes) {
                        if frame_origin(&frame) == Some(me) {
                            continue;
                        }
                    }
                    if tx.send(bytes).is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    room.note_dropped(n);
                    log::warn!("relay: peer {me} lagged {n} frames on {topic}");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// The peer a frame originated from, if it has one.
fn frame_origin(frame: &Frame) -> Option<PeerId> {
    match frame {
        Frame::Publish(envelope) => Some(envelope.sender),
        Frame::PeerJoined { peer, .. } | Frame::PeerLeft { peer, .. } => Some(*peer),
        _ => None,
    }
}
