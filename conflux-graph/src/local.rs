//! Single-writer document.
//!
//! Backs a session while no collaborator is present: plain vectors, no
//! replication metadata, the same validator gating and cascade rules as the
//! replicated store. When a peer shows up, [`LocalGraph::into_snapshot`]
//! seeds the CRDT store so nothing typed in solo mode is lost.

use crate::model::{EdgeKind, GraphEdge, GraphNode, GraphSnapshot, LocalOp, NodeId};
use crate::rules::ConnectionPolicy;
use crate::validate::{validate_connection, MutationError};

/// In-memory graph with direct mutation.
#[derive(Debug, Clone)]
pub struct LocalGraph {
    nodes: Vec<GraphNode>,
    edges: Vec<GraphEdge>,
    policy: ConnectionPolicy,
}

impl LocalGraph {
    pub fn new(policy: ConnectionPolicy) -> Self {
        Self {
            nodes: Vec::new(),
            edges: Vec::new(),
            policy,
        }
    }

    /// Resume from a persisted snapshot.
    pub fn from_snapshot(snapshot: GraphSnapshot, policy: ConnectionPolicy) -> Self {
        Self {
            nodes: snapshot.nodes,
            edges: snapshot.edges,
            policy,
        }
    }

    /// Apply one mutation. Connections go through the invariant validator;
    /// removing a node cascades to every edge touching it.
    pub fn apply(&mut self, op: LocalOp) -> Result<(), MutationError> {
        match op {
            LocalOp::InsertNode(node) => {
                if self.nodes.iter().any(|n| n.id == node.id) {
                    return Err(MutationError::DuplicateNode(node.id));
                }
                self.nodes.push(node);
            }
            LocalOp::RemoveNode(id) => {
                let before = self.nodes.len();
                self.nodes.retain(|n| n.id != id);
                if self.nodes.len() == before {
                    return Err(MutationError::UnknownNode(id));
                }
                self.edges.retain(|e| !e.touches(&id));
            }
            LocalOp::SetPosition { id, position } => {
                let node = self.node_mut(&id)?;
                node.position = position;
            }
            LocalOp::SetPayload { id, payload } => {
                let node = self.node_mut(&id)?;
                node.payload = payload;
            }
            LocalOp::Connect(edge) => {
                validate_connection(&self.nodes, &self.edges, &edge, &self.policy)?;
                self.edges.push(edge);
            }
            LocalOp::RemoveEdge(id) => {
                let before = self.edges.len();
                self.edges.retain(|e| e.id != id);
                if self.edges.len() == before {
                    return Err(MutationError::UnknownEdge(id));
                }
            }
            LocalOp::PruneTransient => {
                self.edges.retain(|e| e.kind != EdgeKind::Transient);
            }
        }
        Ok(())
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            nodes: self.nodes.clone(),
            edges: self.edges.clone(),
        }
    }

    /// Consume the document, e.g. to seed a replicated store.
    pub fn into_snapshot(self) -> GraphSnapshot {
        GraphSnapshot {
            nodes: self.nodes,
            edges: self.edges,
        }
    }

    pub fn policy(&self) -> &ConnectionPolicy {
        &self.policy
    }

    fn node_mut(&mut self, id: &NodeId) -> Result<&mut GraphNode, MutationError> {
        self.nodes
            .iter_mut()
            .find(|n| &n.id == id)
            .ok_or_else(|| MutationError::UnknownNode(id.clone()))
    }
}

// ===================================================================
// Tests
// ===================================================================
