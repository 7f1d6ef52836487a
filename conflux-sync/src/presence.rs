//! Awareness tracking: who is here, where their cursor is, what they
//! have selected.
//!
//! Pure ephemeral state. Nothing in this module is ever persisted, and a
//! peer that stops broadcasting simply ages out of the map after the
//! liveness timeout. Local updates pass through a trailing-edge throttle:
//! the first change in a window goes out immediately, later changes
//! coalesce to the single latest value, delivered when the window timer
//! fires. The tracker itself holds no timers; callers schedule
//! [`PresenceTracker::take_pending`] when told to.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use conflux_graph::{NodeId, PeerId, Position};

use crate::config::SyncConfig;
use crate::protocol::{AwarenessUpdate, CursorMove, NodeSelection, PeerProfile};

/// One remote peer as currently known.
#[derive(Debug, Clone)]
pub struct PeerAwareness {
    pub profile: PeerProfile,
    pub cursor: Option<Position>,
    pub selected: Option<NodeId>,
    pub last_seen: Instant,
}

/// What the caller should do with a local awareness change.
#[derive(Debug, Clone, PartialEq)]
pub enum Publish {
    /// Broadcast this update now.
    Now(AwarenessUpdate),
    /// Arm a timer for this delay, then call `take_pending`.
    Deferred(Duration),
    /// A timer is already armed; the pending value was replaced.
    Coalesced,
}

/// Per-peer awareness map plus the local throttle gate.
pub struct PresenceTracker {
    profile: PeerProfile,
    peers: HashMap<PeerId, PeerAwareness>,
    throttle: Duration,
    liveness: Duration,
    local_cursor: Option<Position>,
    local_selected: Option<NodeId>,
    last_publish: Option<Instant>,
    pending: Option<AwarenessUpdate>,
}

impl PresenceTracker {
    pub fn new(profile: PeerProfile, throttle: Duration, liveness: Duration) -> Self {
        Self {
            profile,
            peers: HashMap::new(),
            throttle,
            liveness,
            local_cursor: None,
            local_selected: None,
            last_publish: None,
            pending: None,
        }
    }

    pub fn with_config(profile: PeerProfile, config: &SyncConfig) -> Self {
        Self::new(profile, config.awareness_throttle(), config.liveness_timeout())
    }

    pub fn local_profile(&self) -> &PeerProfile {
        &self.profile
    }

    /// Current local state as an update, independent of the throttle.
    pub fn local_update(&self) -> AwarenessUpdate {
        AwarenessUpdate {
            profile: self.profile.clone(),
            cursor: self.local_cursor,
            selected: self.local_selected.clone(),
        }
    }

    // ── local side ──────────────────────────────────────────────────

    /// Re-broadcast current local state (e.g. when a peer joins).
    pub fn announce(&mut self, now: Instant) -> Publish {
        self.gate(now)
    }

    pub fn set_local_cursor(&mut self, cursor: Option<Position>, now: Instant) -> Publish {
        self.local_cursor = cursor;
        self.gate(now)
    }

    pub fn set_local_selection(&mut self, selected: Option<NodeId>, now: Instant) -> Publish {
        self.local_selected = selected;
        self.gate(now)
    }

    /// Trailing-edge timer fired: the coalesced update, if one is waiting.
    pub fn take_pending(&mut self, now: Instant) -> Option<AwarenessUpdate> {
        let update = self.pending.take()?;
        self.last_publish = Some(now);
        Some(update)
    }

    /// Throttle gate: immediate outside the window, latest-value
    /// coalescing inside it.
    fn gate(&mut self, now: Instant) -> Publish {
        let update = self.local_update();
        let last = match self.last_publish {
            Some(t) if now.duration_since(t) < self.throttle => t,
            _ => {
                self.last_publish = Some(now);
                return Publish::Now(update);
            }
        };
        let armed = self.pending.is_some();
        self.pending = Some(update);
        if armed {
            Publish::Coalesced
        } else {
            Publish::Deferred(self.throttle - now.duration_since(last))
        }
    }

    // ── remote side ─────────────────────────────────────────────────

    /// Store a full awareness update. Returns `false` for our own echo.
    pub fn on_remote(&mut self, update: AwarenessUpdate, now: Instant) -> bool {
        if update.profile.peer == self.profile.peer {
            return false;
        }
        let peer = update.profile.peer;
        let entry = self.peers.entry(peer).or_insert_with(|| PeerAwareness {
            profile: update.profile.clone(),
            cursor: None,
            selected: None,
            last_seen: now,
        });
        entry.profile = update.profile;
        entry.cursor = update.cursor;
        entry.selected = update.selected;
        entry.last_seen = now;
        true
    }

    /// Cursor-move events refresh liveness and may arrive before the
    /// first full awareness update; a placeholder profile fills the gap.
    pub fn on_cursor(&mut self, cursor: CursorMove, now: Instant) -> bool {
        if cursor.peer == self.profile.peer {
            return false;
        }
        let entry = self.entry(cursor.peer, now);
        entry.cursor = Some(cursor.position);
        entry.last_seen = now;
        true
    }

    pub fn on_selection(&mut self, selection: NodeSelection, now: Instant) -> bool {
        if selection.peer == self.profile.peer {
            return false;
        }
        let entry = self.entry(selection.peer, now);
        entry.selected = selection.node;
        entry.last_seen = now;
        true
    }

    fn entry(&mut self, peer: PeerId, now: Instant) -> &mut PeerAwareness {
        self.peers.entry(peer).or_insert_with(|| PeerAwareness {
            profile: PeerProfile::new(peer, placeholder_name(peer)),
            cursor: None,
            selected: None,
            last_seen: now,
        })
    }

    /// Drop a peer immediately (explicit leave).
    pub fn remove(&mut self, peer: PeerId) -> bool {
        self.peers.remove(&peer).is_some()
    }

    /// Evict everyone not seen within the liveness timeout. Returns the
    /// evicted ids, sorted.
    pub fn sweep(&mut self, now: Instant) -> Vec<PeerId> {
        let liveness = self.liveness;
        let mut evicted: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, p)| now.duration_since(p.last_seen) > liveness)
            .map(|(id, _)| *id)
            .collect();
        evicted.sort();
        for id in &evicted {
            self.peers.remove(id);
            log::debug!("presence: evicted {id} (liveness timeout)");
        }
        evicted
    }

    // ── views ───────────────────────────────────────────────────────

    pub fn get(&self, peer: PeerId) -> Option<&PeerAwareness> {
        self.peers.get(&peer)
    }

    /// All known peers, sorted by id for stable rendering.
    pub fn peers(&self) -> Vec<&PeerAwareness> {
        let mut peers: Vec<&PeerAwareness> = self.peers.values().collect();
        peers.sort_by_key(|p| p.profile.peer);
        peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

fn placeholder_name(peer: PeerId) -> String {
    let id = peer.as_uuid().simple().to_string();
    format!("peer-{}", &id[..8])
}
