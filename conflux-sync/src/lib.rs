//! # conflux-sync — Realtime collaboration engine
//!
//! Everything between the graph document and the wire: envelope protocol,
//! pluggable transports, presence, debounced persistence, and the session
//! coordinator that ties them to one project.
//!
//! ```text
//!                    ┌────────────────────────────┐
//!  UI actions ──────▶│          Session           │──▶ events / watches
//!                    │  LocalGraph ⇄ ReplicatedGraph │
//!                    └──┬───────────┬───────────┬──┘
//!                       │           │           │
//!                  PresenceTracker  │       Debouncer ──▶ PersistenceStore
//!                       │           │
//!                       ▼           ▼
//!                    Transport (relay / mesh / loopback)
//!                       │
//!            ┌──────────┴──────────┐
//!            ▼                     ▼
//!       RelayServer          SignalingServer
//!      (pub/sub rooms)      (mesh bootstrap)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Envelopes, frames, and presence payloads on the wire
//! - [`transport`] — The [`Transport`](transport::Transport) trait and its
//!   three backends
//! - [`rooms`] — Broadcast rooms used by the relay
//! - [`relay`] — Standalone pub/sub relay server
//! - [`signal`] — Standalone mesh signaling server
//! - [`presence`] — Who is here, where their cursor is, what they selected
//! - [`persist`] — Debounced snapshot saves behind a store trait
//! - [`session`] — Per-project coordinator and lifecycle
//! - [`config`] — Tunables with sane defaults
//!
//! Sessions stay single-writer until a collaborator appears, then migrate
//! the document into the CRDT replica from `conflux-graph` and converge
//! through op batches and state joins. Every failure mode degrades live:
//! lost links reconnect with backoff, failed saves retry, malformed wire
//! bytes are logged and dropped.

pub mod config;
pub mod persist;
pub mod presence;
pub mod protocol;
pub mod relay;
pub mod rooms;
pub mod session;
pub mod signal;
pub mod transport;

pub use config::SyncConfig;
pub use persist::{Debouncer, JsonFileStore, MemoryStore, PersistenceStore, SaveStatus, StoreError};
pub use presence::{PeerAwareness, PresenceTracker, Publish};
pub use protocol::{
    AwarenessUpdate, CursorMove, Envelope, EventKind, Frame, NodeSelection, PeerProfile,
    ProtocolError, SyncPayload,
};
pub use relay::{RelayConfig, RelayServer, RelayStats};
pub use session::{Session, SessionError, SessionEvent, SessionMode};
pub use signal::SignalingServer;
pub use transport::{
    LinkHealth, LoopbackHub, LoopbackTransport, Membership, MeshTransport, RelayTransport,
    Subscription, Transport, TransportError,
};
