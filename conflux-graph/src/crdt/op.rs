//! Replicated graph operations and their wire codec.
//!
//! Every operation carries a [`Stamp`]: a Lamport counter paired with the
//! issuing peer id. Stamps totally order concurrent writes (last writer wins
//! per field) and double as element identity for membership — a remove lists
//! the insert stamps it observed, which is what makes the merge add-wins.
//!
//! Batches are bincode-encoded; one batch per user gesture keeps cascade
//! deletes atomic on the wire.

use crate::model::{EdgeId, GraphEdge, GraphNode, NodeId, Payload, Position};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ───────────────────────────────────────────────────────────────────
// Identity
// ───────────────────────────────────────────────────────────────────

/// Replica identity, one per session.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct PeerId(Uuid);

impl PeerId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lamport stamp: `(counter, peer)` lexicographic order gives a total order
/// consistent with causality.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Stamp {
    pub lamport: u64,
    pub peer: PeerId,
}

impl Stamp {
    pub fn new(lamport: u64, peer: PeerId) -> Self {
        Self { lamport, peer }
    }
}

impl fmt::Display for Stamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.lamport, self.peer)
    }
}

// ───────────────────────────────────────────────────────────────────
// Operations
// ───────────────────────────────────────────────────────────────────

/// One replicated mutation.
///
/// Removes carry the insert stamps they observed, never "the element":
/// a concurrent insert the remover had not seen survives the remove.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GraphOp {
    InsertNode {
        node: GraphNode,
        stamp: Stamp,
    },
    RemoveNode {
        id: NodeId,
        observed: Vec<Stamp>,
        stamp: Stamp,
    },
    SetPosition {
        id: NodeId,
        position: Position,
        stamp: Stamp,
    },
    SetPayload {
        id: NodeId,
        payload: Payload,
        stamp: Stamp,
    },
    InsertEdge {
        edge: GraphEdge,
        stamp: Stamp,
    },
    RemoveEdge {
        id: EdgeId,
        observed: Vec<Stamp>,
        stamp: Stamp,
    },
}

impl GraphOp {
    pub fn stamp(&self) -> Stamp {
        match self {
            GraphOp::InsertNode { stamp, .. }
            | GraphOp::RemoveNode { stamp, .. }
            | GraphOp::SetPosition { stamp, .. }
            | GraphOp::SetPayload { stamp, .. }
            | GraphOp::InsertEdge { stamp, .. }
            | GraphOp::RemoveEdge { stamp, .. } => *stamp,
        }
    }

    /// Short tag for logs.
    pub fn name(&self) -> &'static str {
        match self {
            GraphOp::InsertNode { .. } => "insert-node",
            GraphOp::RemoveNode { .. } => "remove-node",
            GraphOp::SetPosition { .. } => "set-position",
            GraphOp::SetPayload { .. } => "set-payload",
            GraphOp::InsertEdge { .. } => "insert-edge",
            GraphOp::RemoveEdge { .. } => "remove-edge",
        }
    }
}

/// Operations from one gesture at one peer, applied atomically downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpBatch {
    pub origin: PeerId,
    pub ops: Vec<GraphOp>,
}

impl OpBatch {
    pub fn new(origin: PeerId, ops: Vec<GraphOp>) -> Self {
        Self { origin, ops }
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| CodecError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let (batch, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| CodecError::Decode(e.to_string()))?;
        Ok(batch)
    }
}

// ───────────────────────────────────────────────────────────────────
// Errors
// ───────────────────────────────────────────────────────────────────

/// Codec failures for operation batches and state snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    Encode(String),
    Decode(String),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::Encode(e) => write!(f, "encode failed: {}", e),
            CodecError::Decode(e) => write!(f, "decode failed: {}", e),
        }
    }
}

impl std::error::Error for CodecError {}

// ===================================================================
// Tests
// ===================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NodeKind;

    fn stamp(lamport: u64) -> Stamp {
        Stamp::new(lamport, PeerId::from_uuid(Uuid::from_u128(7)))
    }

    #[test]
    fn test_stamp_total_order() {
        let low = PeerId::from_uuid(Uuid::from_u128(1));
        let high = PeerId::from_uuid(Uuid::from_u128(2));

        assert!(Stamp::new(1, high) < Stamp::new(2, low));
        // Ties on the counter break on the peer id.
        assert!(Stamp::new(3, low) < Stamp::new(3, high));
        assert_eq!(Stamp::new(3, low), Stamp::new(3, low));
    }

    #[test]
    fn test_batch_roundtrip() {
        let origin = PeerId::generate();
        let node = GraphNode::with_id("n1", NodeKind::Text, Position::new(1.0, 2.0));
        let batch = OpBatch::new(
            origin,
            vec![
                GraphOp::InsertNode {
                    node: node.clone(),
                    stamp: stamp(1),
                },
                GraphOp::SetPosition {
                    id: "n1".into(),
                    position: Position::new(3.0, 4.0),
                    stamp: stamp(2),
                },
            ],
        );

        let encoded = batch.encode().unwrap();
        let decoded = OpBatch::decode(&encoded).unwrap();
        assert_eq!(decoded, batch);
    }

    #[test]
    fn test_remove_roundtrip_keeps_observed_stamps() {
        let origin = PeerId::generate();
        let observed = vec![stamp(4), stamp(9)];
        let batch = OpBatch::new(
            origin,
            vec![GraphOp::RemoveNode {
                id: "n1".into(),
                observed: observed.clone(),
                stamp: stamp(10),
            }],
        );

        let decoded = OpBatch::decode(&batch.encode().unwrap()).unwrap();
        match &decoded.ops[0] {
            GraphOp::RemoveNode { observed: seen, .. } => assert_eq!(seen, &observed),
            other => panic!("unexpected op {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            OpBatch::decode(&[0xFF, 0x01, 0x02]),
            Err(CodecError::Decode(_))
        ));
    }

    #[test]
    fn test_payload_op_roundtrip() {
        let origin = PeerId::generate();
        let payload = Payload::from_value(&serde_json::json!({ "prompt": "a red fox" }));
        let batch = OpBatch::new(
            origin,
            vec![GraphOp::SetPayload {
                id: "n1".into(),
                payload: payload.clone(),
                stamp: stamp(3),
            }],
        );

        let decoded = OpBatch::decode(&batch.encode().unwrap()).unwrap();
        match &decoded.ops[0] {
            GraphOp::SetPayload { payload: got, .. } => assert_eq!(got, &payload),
            other => panic!("unexpected op {:?}", other),
        }
    }
}
