//! Binary wire protocol for graph sync and presence.
//!
//! Everything crossing a socket is a bincode-encoded [`Frame`]; pub/sub
//! payloads ride inside a [`Frame::Publish`] envelope:
//!
//! ```text
//! ┌───────────────────── Frame ──────────────────────┐
//! │ Hello │ Subscribe │ Publish ┌─── Envelope ──────┐ │
//! │       │           │         │ topic             │ │
//! │       │           │         │ event             │ │
//! │       │           │         │ sender, seq       │ │
//! │       │           │         │ payload (opaque)  │ │
//! │       │           │         └───────────────────┘ │
//! └───────────────────────────────────────────────────┘
//! ```
//!
//! One event kind per subscription: `message` carries [`SyncPayload`] (CRDT
//! batches and the cold-start state handshake), `awareness`, `cursor-move`
//! and `node-selection` carry presence payloads. Relays forward envelopes
//! without decoding payloads.

use conflux_graph::{NodeId, OpBatch, PeerId, Position};
use serde::{Deserialize, Serialize};

// ───────────────────────────────────────────────────────────────────
// Event kinds
// ───────────────────────────────────────────────────────────────────

/// The event kind an envelope carries. Each (topic, event) pair is an
/// independent subscription key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    /// CRDT operation bytes and the state handshake.
    Message,
    /// Full presence state (profile + cursor + selection).
    Awareness,
    /// High-frequency cursor position, throttled at the sender.
    CursorMove,
    /// Node selection claim/release for highlight rendering.
    NodeSelection,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Message => "message",
            EventKind::Awareness => "awareness",
            EventKind::CursorMove => "cursor-move",
            EventKind::NodeSelection => "node-selection",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ───────────────────────────────────────────────────────────────────
// Envelope
// ───────────────────────────────────────────────────────────────────

/// The unit of pub/sub: one payload on one (topic, event) channel.
///
/// `seq` is a per-sender counter; receivers may use it to observe
/// FIFO-per-sender delivery. Payload bytes are opaque to every layer
/// between the producing and consuming session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub topic: String,
    pub event: EventKind,
    pub sender: PeerId,
    pub seq: u64,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn new(
        topic: impl Into<String>,
        event: EventKind,
        sender: PeerId,
        seq: u64,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            topic: topic.into(),
            event,
            sender,
            seq,
            payload,
        }
    }

    /// Envelope carrying a sync payload on the `message` event.
    pub fn sync(
        topic: impl Into<String>,
        sender: PeerId,
        seq: u64,
        payload: &SyncPayload,
    ) -> Result<Self, ProtocolError> {
        Ok(Self::new(topic, EventKind::Message, sender, seq, payload.encode()?))
    }

    /// Parse the payload of a `message` envelope.
    pub fn sync_payload(&self) -> Result<SyncPayload, ProtocolError> {
        self.expect(EventKind::Message)?;
        SyncPayload::decode(&self.payload)
    }

    /// Parse the payload of an `awareness` envelope.
    pub fn awareness(&self) -> Result<AwarenessUpdate, ProtocolError> {
        self.expect(EventKind::Awareness)?;
        decode(&self.payload)
    }

    /// Parse the payload of a `cursor-move` envelope.
    pub fn cursor_move(&self) -> Result<CursorMove, ProtocolError> {
        self.expect(EventKind::CursorMove)?;
        decode(&self.payload)
    }

    /// Parse the payload of a `node-selection` envelope.
    pub fn node_selection(&self) -> Result<NodeSelection, ProtocolError> {
        self.expect(EventKind::NodeSelection)?;
        decode(&self.payload)
    }

    fn expect(&self, event: EventKind) -> Result<(), ProtocolError> {
        if self.event == event {
            Ok(())
        } else {
            Err(ProtocolError::WrongEvent {
                expected: event,
                got: self.event,
            })
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Payloads
// ───────────────────────────────────────────────────────────────────

/// Payloads multiplexed on the `message` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncPayload {
    /// Incremental operation batch.
    Ops(OpBatch),
    /// A cold peer asking the room for full state.
    StateRequest,
    /// Encoded full state (`ReplicatedGraph::encode_state`). Every peer may
    /// answer; duplicates merge idempotently.
    StateReply(Vec<u8>),
}

impl SyncPayload {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

/// Peer identity with display metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerProfile {
    pub peer: PeerId,
    pub name: String,
    /// RGBA cursor/selection color, derived from the peer id so every
    /// replica renders the same identity color without negotiation.
    pub color: [f32; 4],
}

impl PeerProfile {
    pub fn new(peer: PeerId, name: impl Into<String>) -> Self {
        let hash = peer.as_uuid().as_u128();
        let r = (hash & 0xFF) as f32 / 255.0;
        let g = ((hash >> 8) & 0xFF) as f32 / 255.0;
        let b = ((hash >> 16) & 0xFF) as f32 / 255.0;
        Self {
            peer,
            name: name.into(),
            color: [r, g, b, 1.0],
        }
    }
}

/// Full presence state, broadcast on the `awareness` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwarenessUpdate {
    pub profile: PeerProfile,
    /// Cursor position in flow coordinates; `None` while off-canvas.
    pub cursor: Option<Position>,
    pub selected: Option<NodeId>,
}

impl AwarenessUpdate {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }
}

/// Cursor position + identity, broadcast on the `cursor-move` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorMove {
    pub peer: PeerId,
    pub position: Position,
}

impl CursorMove {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }
}

/// Selection claim (`Some(node)`) or release (`None`), broadcast on the
/// `node-selection` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSelection {
    pub peer: PeerId,
    pub node: Option<NodeId>,
}

impl NodeSelection {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }
}

// ───────────────────────────────────────────────────────────────────
// Frames
// ───────────────────────────────────────────────────────────────────

/// Control and data frames exchanged on a socket (client↔relay, or a direct
/// mesh link). Binary WebSocket messages, bincode-encoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    /// First frame on every connection; identifies the peer.
    Hello { peer: PeerId },
    Subscribe { topic: String },
    Unsubscribe { topic: String },
    Publish(Envelope),
    /// Relay → clients: someone joined a topic room.
    PeerJoined { topic: String, peer: PeerId },
    /// Relay → clients: someone left a topic room.
    PeerLeft { topic: String, peer: PeerId },
    Ping,
    Pong,
}

impl Frame {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Encode(e.to_string()))
}

pub(crate) fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Decode(e.to_string()))?;
    Ok(value)
}

// ───────────────────────────────────────────────────────────────────
// Errors
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    Encode(String),
    Decode(String),
    WrongEvent { expected: EventKind, got: EventKind },
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Encode(e) => write!(f, "encode error: {e}"),
            Self::Decode(e) => write!(f, "decode error: {e}"),
            Self::WrongEvent { expected, got } => {
                write!(f, "expected {expected} payload, got {got}")
            }
            Self::ConnectionClosed => write!(f, "connection closed"),
            Self::Timeout => write!(f, "connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}
