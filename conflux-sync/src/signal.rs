//! Signaling for the peer mesh: who is in the room, and where to dial.
//!
//! ```text
//! Peer A ── Register{room, peer, addr} ──▶ SignalingServer
//!        ◀── Roster{[(B, addr_b), …]} ───┘       │
//!                                                └─▶ PeerUp{A, addr_a} to B, C, …
//! ```
//!
//! Bootstrap only. Once a peer has dialed the roster it got back, the
//! signaling link carries nothing but membership changes; document and
//! presence traffic flows over the direct mesh links.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use conflux_graph::PeerId;

use crate::protocol::{self, ProtocolError};

/// Frames exchanged with the signaling server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SignalFrame {
    /// Client -> server: advertise this peer's mesh listener in a room.
    Register {
        room: String,
        peer: PeerId,
        addr: String,
    },
    /// Server -> client: everyone already in the room, excluding the caller.
    Roster { peers: Vec<(PeerId, String)> },
    /// Server -> room: a new peer registered.
    PeerUp { peer: PeerId, addr: String },
    /// Server -> room: a registered peer's connection dropped.
    PeerDown { peer: PeerId },
}

impl SignalFrame {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        protocol::encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        protocol::decode(bytes)
    }
}

/// One registered peer: advertised address plus its outbound queue.
struct Registration {
    addr: String,
    tx: mpsc::UnboundedSender<SignalFrame>,
}

type RoomRegistry = HashMap<String, HashMap<PeerId, Registration>>;

/// The signaling server.
pub struct SignalingServer {
    bind_addr: String,
    rooms: RwLock<RoomRegistry>,
}

impl SignalingServer {
    pub fn new(bind_addr: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            bind_addr: bind_addr.into(),
            rooms: RwLock::new(HashMap::new()),
        })
    }

    /// Bind and spawn the accept loop; returns the bound address.
    pub async fn serve(self: &Arc<Self>) -> std::io::Result<SocketAddr> {
        let listener = TcpListener::bind(&self.bind_addr).await?;
        let addr = listener.local_addr()?;
        log::info!("signaling listening on {addr}");

        let state = self.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        let state = state.clone();
                        tokio::spawn(async move {
                            if let Err(e) = state.handle_connection(stream).await {
                                log::debug!("signaling: connection {peer_addr} ended: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        log::error!("signaling: accept failed: {e}");
                        break;
                    }
                }
            }
        });
        Ok(addr)
    }

    pub async fn room_size(&self, room: &str) -> usize {
        self.rooms.read().await.get(room).map_or(0, HashMap::len)
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws = tokio_tungstenite::accept_async(stream).await?;
        let (mut sink, mut source) = ws.split();

        let (tx, mut rx) = mpsc::unbounded_channel::<SignalFrame>();
        // Filled in by the first Register frame.
        let mut identity: Option<(String, PeerId)> = None;

        loop {
            tokio::select! {
                incoming = source.next() => {
                    match incoming {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            match SignalFrame::decode(&bytes) {
                                Ok(SignalFrame::Register { room, peer, addr }) => {
                                    if identity.is_some() {
                                        log::warn!("signaling: duplicate register from {peer}");
                                        continue;
                                    }
                                    let roster =
                                        self.register(&room, peer, addr, tx.clone()).await;
                                    identity = Some((room, peer));
                                    let reply = SignalFrame::Roster { peers: roster }.encode()?;
                                    sink.send(Message::Binary(reply.into())).await?;
                                }
                                Ok(frame) => {
                                    log::warn!("signaling: unexpected client frame {frame:?}");
                                }
                                Err(e) => {
                                    log::warn!("signaling: undecodable frame: {e}");
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            sink.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            log::debug!("signaling: socket error: {e}");
                            break;
                        }
                        _ => {}
                    }
                }

                outgoing = rx.recv() => {
                    match outgoing {
                        Some(frame) => {
                            sink.send(Message::Binary(frame.encode()?.into())).await?;
                        }
                        None => break,
                    }
                }
            }
        }

        if let Some((room, peer)) = identity {
            self.deregister(&room, peer).await;
        }
        Ok(())
    }

    /// Add a peer to a room, notify the others, return the prior roster.
    async fn register(
        &self,
        room: &str,
        peer: PeerId,
        addr: String,
        tx: mpsc::UnboundedSender<SignalFrame>,
    ) -> Vec<(PeerId, String)> {
        let mut rooms = self.rooms.write().await;
        let members = rooms.entry(room.to_string()).or_default();

        let roster: Vec<(PeerId, String)> = members
            .iter()
            .map(|(id, reg)| (*id, reg.addr.clone()))
            .collect();

        let up = SignalFrame::PeerUp { peer, addr: addr.clone() };
        for reg in members.values() {
            let _ = reg.tx.send(up.clone());
        }

        members.insert(peer, Registration { addr, tx });
        log::info!("signaling: peer {peer} registered in {room} ({} members)", members.len());
        roster
    }

    async fn deregister(&self, room: &str, peer: PeerId) {
        let mut rooms = self.rooms.write().await;
        let Some(members) = rooms.get_mut(room) else { return };
        if members.remove(&peer).is_none() {
            return;
        }
        let down = SignalFrame::PeerDown { peer };
        for reg in members.values() {
            let _ = reg.tx.send(down.clone());
        }
        if members.is_empty() {
            rooms.remove(room);
            log::info!("signaling: room {room} removed (empty)");
        } else {
            log::info!("signaling: peer {peer} left {room}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn peer(n: u128) -> PeerId {
        PeerId::from_uuid(Uuid::from_u128(n))
    }

    #[test]
    fn test_signal_frame_roundtrip() {
        let frame = SignalFrame::Register {
            room: "project:alpha".to_string(),
            peer: peer(7),
            addr: "127.0.0.1:4001".to_string(),
        };
        let decoded = SignalFrame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[tokio::test]
    async fn test_register_returns_prior_roster_and_notifies() {
        let server = SignalingServer::new("127.0.0.1:0");
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, _rx_b) = mpsc::unbounded_channel();

        let roster = server
            .register("room", peer(1), "10.0.0.1:4000".into(), tx_a)
            .await;
        assert!(roster.is_empty());

        let roster = server
            .register("room", peer(2), "10.0.0.2:4000".into(), tx_b)
            .await;
        assert_eq!(roster, vec![(peer(1), "10.0.0.1:4000".to_string())]);

        // The earlier member hears about the newcomer.
        let up = rx_a.recv().await.unwrap();
        assert_eq!(
            up,
            SignalFrame::PeerUp { peer: peer(2), addr: "10.0.0.2:4000".to_string() }
        );
        assert_eq!(server.room_size("room").await, 2);
    }

    #[tokio::test]
    async fn test_deregister_notifies_and_collects_empty_room() {
        let server = SignalingServer::new("127.0.0.1:0");
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, _rx_b) = mpsc::unbounded_channel();

        server.register("room", peer(1), "a:1".into(), tx_a).await;
        server.register("room", peer(2), "b:2".into(), tx_b).await;
        let _ = rx_a.recv().await; // PeerUp for peer 2

        server.deregister("room", peer(2)).await;
        assert_eq!(
            rx_a.recv().await.unwrap(),
            SignalFrame::PeerDown { peer: peer(2) }
        );
        assert_eq!(server.room_size("room").await, 1);

        server.deregister("room", peer(1)).await;
        assert_eq!(server.room_size("room").await, 0);
    }

    #[tokio::test]
    async fn test_serve_binds_ephemeral_port() {
        let server = SignalingServer::new("127.0.0.1:0");
        let addr = server.serve().await.unwrap();
        assert_ne!(addr.port(), 0);
    }
}
