//! Structural invariant checks for the workflow graph.
//!
//! Every function here is pure: no I/O, no hidden state, deterministic over
//! its inputs. The same checks gate user connections before an operation is
//! created and re-run after every remote merge, so a candidate edge gets
//! identical verdicts at both call sites.
//!
//! Cycle detection is depth-first reachability from the candidate target,
//! looking for the candidate source along existing outgoing edges, with a
//! visited set bounding the walk to O(V+E).

use crate::model::{EdgeId, GraphEdge, GraphNode, NodeId, NodeKind};
use crate::rules::ConnectionPolicy;
use std::collections::{HashMap, HashSet};
use std::fmt;

// ───────────────────────────────────────────────────────────────────
// Violations
// ───────────────────────────────────────────────────────────────────

/// Why a candidate connection was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionViolation {
    /// Source and target are the same node.
    SelfLoop { node: NodeId },
    /// An endpoint is not present in the document.
    MissingEndpoint { node: NodeId },
    /// An identical live connection already exists.
    Duplicate { existing: EdgeId },
    /// The `(source kind, target kind, handle)` triple is not in the policy.
    KindNotAllowed {
        source: NodeKind,
        target: NodeKind,
        target_handle: Option<String>,
    },
    /// The target already reaches the source; adding the edge closes a cycle.
    WouldCycle { source: NodeId, target: NodeId },
}

impl fmt::Display for ConnectionViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionViolation::SelfLoop { node } => {
                write!(f, "edge would loop node {} onto itself", node)
            }
            ConnectionViolation::MissingEndpoint { node } => {
                write!(f, "endpoint node {} is not in the document", node)
            }
            ConnectionViolation::Duplicate { existing } => {
                write!(f, "identical connection already exists as edge {}", existing)
            }
            ConnectionViolation::KindNotAllowed {
                source,
                target,
                target_handle,
            } => match target_handle {
                Some(handle) => write!(
                    f,
                    "{} -> {} on handle {:?} is not an allowed connection",
                    source, target, handle
                ),
                None => write!(f, "{} -> {} is not an allowed connection", source, target),
            },
            ConnectionViolation::WouldCycle { source, target } => {
                write!(f, "edge {} -> {} would create a cycle", source, target)
            }
        }
    }
}

impl std::error::Error for ConnectionViolation {}

/// A sweep finding: which edge, and what is wrong with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeViolation {
    pub edge: EdgeId,
    pub violation: ConnectionViolation,
}

// ───────────────────────────────────────────────────────────────────
// Mutation errors
// ───────────────────────────────────────────────────────────────────

/// Why a local mutation was refused by a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationError {
    UnknownNode(NodeId),
    UnknownEdge(EdgeId),
    DuplicateNode(NodeId),
    Rejected(ConnectionViolation),
}

impl fmt::Display for MutationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MutationError::UnknownNode(id) => write!(f, "no node {}", id),
            MutationError::UnknownEdge(id) => write!(f, "no edge {}", id),
            MutationError::DuplicateNode(id) => write!(f, "node {} already exists", id),
            MutationError::Rejected(v) => write!(f, "connection rejected: {}", v),
        }
    }
}

impl std::error::Error for MutationError {}

impl From<ConnectionViolation> for MutationError {
    fn from(v: ConnectionViolation) -> Self {
        MutationError::Rejected(v)
    }
}

// ───────────────────────────────────────────────────────────────────
// Candidate validation
// ───────────────────────────────────────────────────────────────────

/// Full verdict for a candidate edge against the current document.
pub fn validate_connection(
    nodes: &[GraphNode],
    edges: &[GraphEdge],
    candidate: &GraphEdge,
    policy: &ConnectionPolicy,
) -> Result<(), ConnectionViolation> {
    if candidate.source == candidate.target {
        return Err(ConnectionViolation::SelfLoop {
            node: candidate.source.clone(),
        });
    }

    let source = nodes.iter().find(|n| n.id == candidate.source).ok_or_else(|| {
        ConnectionViolation::MissingEndpoint {
            node: candidate.source.clone(),
        }
    })?;
    let target = nodes.iter().find(|n| n.id == candidate.target).ok_or_else(|| {
        ConnectionViolation::MissingEndpoint {
            node: candidate.target.clone(),
        }
    })?;

    if let Some(existing) = edges
        .iter()
        .find(|e| e.id != candidate.id && e.same_connection(candidate))
    {
        return Err(ConnectionViolation::Duplicate {
            existing: existing.id.clone(),
        });
    }

    if !policy.allows(source.kind, target.kind, candidate.target_handle.as_deref()) {
        return Err(ConnectionViolation::KindNotAllowed {
            source: source.kind,
            target: target.kind,
            target_handle: candidate.target_handle.clone(),
        });
    }

    if reaches(edges, &candidate.target, &candidate.source) {
        return Err(ConnectionViolation::WouldCycle {
            source: candidate.source.clone(),
            target: candidate.target.clone(),
        });
    }

    Ok(())
}

/// Boolean form of [`validate_connection`], for UI-level gating.
pub fn is_valid_connection(
    nodes: &[GraphNode],
    edges: &[GraphEdge],
    candidate: &GraphEdge,
    policy: &ConnectionPolicy,
) -> bool {
    validate_connection(nodes, edges, candidate, policy).is_ok()
}

/// Depth-first reachability: can `from` reach `to` along existing edges?
fn reaches(edges: &[GraphEdge], from: &NodeId, to: &NodeId) -> bool {
    let mut outgoing: HashMap<&NodeId, Vec<&NodeId>> = HashMap::new();
    for edge in edges {
        outgoing.entry(&edge.source).or_default().push(&edge.target);
    }

    let mut visited: HashSet<&NodeId> = HashSet::new();
    let mut stack: Vec<&NodeId> = vec![from];
    while let Some(node) = stack.pop() {
        if node == to {
            return true;
        }
        if !visited.insert(node) {
            continue;
        }
        if let Some(next) = outgoing.get(node) {
            stack.extend(next.iter().copied());
        }
    }
    false
}

// ───────────────────────────────────────────────────────────────────
// Whole-graph sweep
// ───────────────────────────────────────────────────────────────────

/// Every violation in a document: dangling endpoints, self-loops, duplicate
/// connections, disallowed kind pairs, and edges participating in a cycle.
/// Diagnostics only; the merge path uses the incremental repair pass instead.
pub fn graph_violations(
    nodes: &[GraphNode],
    edges: &[GraphEdge],
    policy: &ConnectionPolicy,
) -> Vec<EdgeViolation> {
    let mut found = Vec::new();
    let by_id: HashMap<&NodeId, &GraphNode> = nodes.iter().map(|n| (&n.id, n)).collect();

    for (i, edge) in edges.iter().enumerate() {
        if edge.source == edge.target {
            found.push(EdgeViolation {
                edge: edge.id.clone(),
                violation: ConnectionViolation::SelfLoop {
                    node: edge.source.clone(),
                },
            });
            continue;
        }
        let source = by_id.get(&edge.source);
        let target = by_id.get(&edge.target);
        if source.is_none() {
            found.push(EdgeViolation {
                edge: edge.id.clone(),
                violation: ConnectionViolation::MissingEndpoint {
                    node: edge.source.clone(),
                },
            });
        }
        if target.is_none() {
            found.push(EdgeViolation {
                edge: edge.id.clone(),
                violation: ConnectionViolation::MissingEndpoint {
                    node: edge.target.clone(),
                },
            });
        }
        if let Some(earlier) = edges[..i].iter().find(|e| e.same_connection(edge)) {
            found.push(EdgeViolation {
                edge: edge.id.clone(),
                violation: ConnectionViolation::Duplicate {
                    existing: earlier.id.clone(),
                },
            });
        }
        if let (Some(source), Some(target)) = (source, target) {
            if !policy.allows(source.kind, target.kind, edge.target_handle.as_deref()) {
                found.push(EdgeViolation {
                    edge: edge.id.clone(),
                    violation: ConnectionViolation::KindNotAllowed {
                        source: source.kind,
                        target: target.kind,
                        target_handle: edge.target_handle.clone(),
                    },
                });
            }
        }
    }

    for edge in edges_in_cycles(edges) {
        found.push(EdgeViolation {
            edge: edge.id.clone(),
            violation: ConnectionViolation::WouldCycle {
                source: edge.source.clone(),
                target: edge.target.clone(),
            },
        });
    }

    found
}

/// Edges participating in at least one cycle.
///
/// Kahn's algorithm narrows the graph to nodes that never reach in-degree
/// zero, then each surviving edge is confirmed by reachability (survivors
/// can also be plain downstream of a cycle).
pub fn edges_in_cycles(edges: &[GraphEdge]) -> Vec<&GraphEdge> {
    let mut indegree: HashMap<&NodeId, usize> = HashMap::new();
    let mut outgoing: HashMap<&NodeId, Vec<&NodeId>> = HashMap::new();
    for edge in edges {
        indegree.entry(&edge.source).or_insert(0);
        *indegree.entry(&edge.target).or_insert(0) += 1;
        outgoing.entry(&edge.source).or_default().push(&edge.target);
    }

    let mut queue: Vec<&NodeId> = indegree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(n, _)| *n)
        .collect();
    while let Some(node) = queue.pop() {
        if let Some(next) = outgoing.get(node) {
            for target in next {
                if let Some(d) = indegree.get_mut(target) {
                    *d -= 1;
                    if *d == 0 {
                        queue.push(target);
                    }
                }
            }
        }
        indegree.remove(node);
    }

    edges
        .iter()
        .filter(|e| indegree.contains_key(&e.source) && indegree.contains_key(&e.target))
        .filter(|e| reaches(edges, &e.target, &e.source))
        .collect()
}

// ===================================================================
// Tests
// ===================================================================
