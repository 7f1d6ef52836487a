//! Typed document-event subscriptions.
//!
//! Observers register through [`ReplicatedGraph::subscribe`] and get an
//! unbounded channel plus an id for explicit cancellation. Events are
//! delivered synchronously with the mutation, in registration order;
//! subscribers whose receiver was dropped are pruned on the next emit.
//!
//! [`ReplicatedGraph::subscribe`]: crate::crdt::ReplicatedGraph::subscribe

use crate::crdt::op::PeerId;
use crate::model::EdgeId;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// Where a document change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeSource {
    Local,
    Remote(PeerId),
}

/// What subscribers hear about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocEvent {
    /// The live view changed; `version` increases monotonically per replica.
    Changed { source: ChangeSource, version: u64 },
    /// The repair pass pulled edges out of the live view.
    EdgesQuarantined { edges: Vec<EdgeId> },
}

/// Handle for cancelling a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Debug, Default)]
pub(crate) struct SubscriberRegistry {
    next_id: u64,
    senders: Vec<(SubscriptionId, UnboundedSender<DocEvent>)>,
}

impl SubscriberRegistry {
    pub(crate) fn subscribe(&mut self) -> (SubscriptionId, UnboundedReceiver<DocEvent>) {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        let (tx, rx) = unbounded_channel();
        self.senders.push((id, tx));
        (id, rx)
    }

    pub(crate) fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.senders.len();
        self.senders.retain(|(sid, _)| *sid != id);
        self.senders.len() != before
    }

    /// Fan out in registration order, dropping closed receivers.
    pub(crate) fn emit(&mut self, event: &DocEvent) {
        self.senders
            .retain(|(_, tx)| tx.send(event.clone()).is_ok());
    }

    pub(crate) fn len(&self) -> usize {
        self.senders.len()
    }
}

// ===================================================================
// Tests
// ===================================================================
