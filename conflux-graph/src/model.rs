//! Workflow graph data model.
//!
//! A document is a pair of sequences: [`GraphNode`]s and [`GraphEdge`]s.
//! Nodes carry a `kind` (what the node produces), a canvas position and an
//! opaque payload owned by the node's producer component. Edges wire node
//! outputs to node inputs through optional named handles.
//!
//! The sync engine branches on `kind` only; [`Payload`] contents are never
//! inspected here.

use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ───────────────────────────────────────────────────────────────────
// Identifiers
// ───────────────────────────────────────────────────────────────────

/// Opaque unique node identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(String);

/// Opaque unique edge identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EdgeId(String);

impl NodeId {
    /// Fresh random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl EdgeId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for EdgeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for EdgeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ───────────────────────────────────────────────────────────────────
// Kinds
// ───────────────────────────────────────────────────────────────────

/// What a node produces. `Drop` is a transient placeholder shown while the
/// user is still deciding what a dragged-in element becomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Text,
    Image,
    Audio,
    Video,
    Code,
    File,
    Tweet,
    Drop,
}

impl NodeKind {
    pub fn is_placeholder(&self) -> bool {
        matches!(self, NodeKind::Drop)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Text => "text",
            NodeKind::Image => "image",
            NodeKind::Audio => "audio",
            NodeKind::Video => "video",
            NodeKind::Code => "code",
            NodeKind::File => "file",
            NodeKind::Tweet => "tweet",
            NodeKind::Drop => "drop",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Edge lifetime class. Transient edges exist only during an in-progress
/// drag and are pruned when a drag starts elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeKind {
    Persistent,
    Transient,
}

// ───────────────────────────────────────────────────────────────────
// Geometry
// ───────────────────────────────────────────────────────────────────

/// Canvas position in flow (world) coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

// ───────────────────────────────────────────────────────────────────
// Payload
// ───────────────────────────────────────────────────────────────────

/// Producer-owned node payload, held as raw JSON text.
///
/// Serializes as structured JSON in human-readable formats (the persistence
/// blob stays inspectable) and as a plain string in binary formats (bincode
/// cannot decode self-describing values).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload(String);

impl Payload {
    /// Empty object payload.
    pub fn empty() -> Self {
        Self("{}".to_string())
    }

    pub fn from_value(value: &serde_json::Value) -> Self {
        Self(value.to_string())
    }

    /// Parsed view of the payload. Invalid text degrades to `Null` rather
    /// than erroring; the engine never depends on the contents.
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::from_str(&self.0).unwrap_or(serde_json::Value::Null)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Payload {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Self::from_value(&value)
    }
}

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            match serde_json::from_str::<serde_json::Value>(&self.0) {
                Ok(value) => value.serialize(serializer),
                Err(_) => serializer.serialize_str(&self.0),
            }
        } else {
            serializer.serialize_str(&self.0)
        }
    }
}

impl<'de> Deserialize<'de> for Payload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let value = serde_json::Value::deserialize(deserializer)?;
            Ok(Self(value.to_string()))
        } else {
            Ok(Self(String::deserialize(deserializer)?))
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Elements
// ───────────────────────────────────────────────────────────────────

/// A node on the workflow canvas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: NodeId,
    pub kind: NodeKind,
    pub position: Position,
    #[serde(default)]
    pub payload: Payload,
}

impl GraphNode {
    /// New node with a generated id and empty payload.
    pub fn new(kind: NodeKind, position: Position) -> Self {
        Self {
            id: NodeId::generate(),
            kind,
            position,
            payload: Payload::empty(),
        }
    }

    pub fn with_id(id: impl Into<NodeId>, kind: NodeKind, position: Position) -> Self {
        Self {
            id: id.into(),
            kind,
            position,
            payload: Payload::empty(),
        }
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }
}

/// A directed connection between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub id: EdgeId,
    pub source: NodeId,
    pub target: NodeId,
    #[serde(default)]
    pub source_handle: Option<String>,
    #[serde(default)]
    pub target_handle: Option<String>,
    pub kind: EdgeKind,
}

impl GraphEdge {
    /// New persistent edge with a generated id and no handles.
    pub fn new(source: impl Into<NodeId>, target: impl Into<NodeId>) -> Self {
        Self {
            id: EdgeId::generate(),
            source: source.into(),
            target: target.into(),
            source_handle: None,
            target_handle: None,
            kind: EdgeKind::Persistent,
        }
    }

    /// New transient (drag preview) edge.
    pub fn transient(source: impl Into<NodeId>, target: impl Into<NodeId>) -> Self {
        Self {
            kind: EdgeKind::Transient,
            ..Self::new(source, target)
        }
    }

    pub fn with_target_handle(mut self, handle: impl Into<String>) -> Self {
        self.target_handle = Some(handle.into());
        self
    }

    pub fn with_source_handle(mut self, handle: impl Into<String>) -> Self {
        self.source_handle = Some(handle.into());
        self
    }

    /// True if the edge starts or ends at `node`.
    pub fn touches(&self, node: &NodeId) -> bool {
        &self.source == node || &self.target == node
    }

    /// True if both endpoints, and both handles, match `other`.
    pub fn same_connection(&self, other: &GraphEdge) -> bool {
        self.source == other.source
            && self.target == other.target
            && self.source_handle == other.source_handle
            && self.target_handle == other.target_handle
    }
}

// ───────────────────────────────────────────────────────────────────
// Snapshot
// ───────────────────────────────────────────────────────────────────

/// Full materialized document state, used for rendering and persistence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

impl GraphSnapshot {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.edges.is_empty()
    }

    pub fn node(&self, id: &NodeId) -> Option<&GraphNode> {
        self.nodes.iter().find(|n| &n.id == id)
    }

    pub fn edge(&self, id: &EdgeId) -> Option<&GraphEdge> {
        self.edges.iter().find(|e| &e.id == id)
    }

    pub fn contains_node(&self, id: &NodeId) -> bool {
        self.node(id).is_some()
    }

    pub fn contains_edge(&self, id: &EdgeId) -> bool {
        self.edge(id).is_some()
    }

    /// Order-independent set equality over nodes and edges.
    pub fn same_elements(&self, other: &GraphSnapshot) -> bool {
        self.nodes.len() == other.nodes.len()
            && self.edges.len() == other.edges.len()
            && self.nodes.iter().all(|n| other.nodes.contains(n))
            && self.edges.iter().all(|e| other.edges.contains(e))
    }
}

// ───────────────────────────────────────────────────────────────────
// Mutation intents
// ───────────────────────────────────────────────────────────────────

/// A local mutation request, routed to whichever document backs the session
/// (single-writer or replicated).
#[derive(Debug, Clone, PartialEq)]
pub enum LocalOp {
    InsertNode(GraphNode),
    RemoveNode(NodeId),
    SetPosition { id: NodeId, position: Position },
    SetPayload { id: NodeId, payload: Payload },
    Connect(GraphEdge),
    RemoveEdge(EdgeId),
    /// Drop all transient edges; issued when a new drag begins.
    PruneTransient,
}

// ===================================================================
// Tests
// ===================================================================
