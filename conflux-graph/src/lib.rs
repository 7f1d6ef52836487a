//! # conflux-graph — Collaborative workflow-graph engine
//!
//! The document model and merge engine behind the canvas: nodes, edges,
//! connection rules, and a conflict-free replicated store that keeps every
//! peer's copy convergent without locks or a coordinating authority.
//!
//! ## Modules
//!
//! - [`model`] — Nodes, edges, snapshots, mutation intents
//! - [`rules`] — The kind-compatibility table for connections
//! - [`validate`] — Connection validation and whole-graph sweeps
//! - [`local`] — Single-writer document for solo sessions
//! - [`crdt`] — Replicated document for live sessions
//! - [`subscribe`] — Change notification plumbing
//!
//! Solo sessions run on [`local::LocalGraph`]; the moment a second peer
//! shows up the session migrates the snapshot into a
//! [`crdt::ReplicatedGraph`] and both enforce the same connection rules
//! through [`validate`].

pub mod crdt;
pub mod local;
pub mod model;
pub mod rules;
pub mod subscribe;
pub mod validate;

pub use crdt::op::{CodecError, GraphOp, OpBatch, PeerId, Stamp};
pub use crdt::{ApplyOutcome, Commit, ReplicatedGraph};
pub use local::LocalGraph;
pub use model::{
    EdgeId, EdgeKind, GraphEdge, GraphNode, GraphSnapshot, LocalOp, NodeId, NodeKind, Payload,
    Position,
};
pub use rules::{ConnectionPolicy, ConnectionRule};
pub use subscribe::{ChangeSource, DocEvent, SubscriptionId};
pub use validate::{
    edges_in_cycles, graph_violations, is_valid_connection, validate_connection,
    ConnectionViolation, EdgeViolation, MutationError,
};
