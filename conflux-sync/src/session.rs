//! Per-project session: one document, one lifecycle.
//!
//! ```text
//! open() ──▶ SingleWriter ──first peer seen──▶ MultiWriter ──close()──▶ torn down
//!               │                                  │
//!               ▼                                  ▼
//!          LocalGraph          migrate snapshot ▶ ReplicatedGraph + StateRequest
//! ```
//!
//! A session starts single-writer: mutations hit a [`LocalGraph`] and the
//! debouncer, nothing rides the wire except presence. The moment another
//! peer shows up (transport roster, membership event, or any remote
//! envelope) the snapshot migrates into a [`ReplicatedGraph`], a
//! `StateRequest` goes out to pick up whatever history the room already
//! has, and every local commit broadcasts its op batch. There is no way
//! back to single-writer; an empty room in multi-writer mode is just a
//! quiet one.
//!
//! The document sits behind a `std::sync::Mutex` that is never held
//! across an await; merges and mutations are synchronous and bounded.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use conflux_graph::{
    ChangeSource, ConnectionPolicy, EdgeId, GraphSnapshot, LocalGraph, LocalOp, MutationError,
    NodeId, OpBatch, PeerId, Position, ReplicatedGraph,
};

use crate::config::{self, SyncConfig};
use crate::persist::{Debouncer, PersistenceStore, SaveHandle, SaveStatus, StoreError};
use crate::presence::{PeerAwareness, PresenceTracker, Publish};
use crate::protocol::{
    AwarenessUpdate, CursorMove, Envelope, EventKind, NodeSelection, PeerProfile, ProtocolError,
    SyncPayload,
};
use crate::transport::{LinkHealth, Membership, Subscription, Transport, TransportError};

const EVENT_CAPACITY: usize = 256;

/// Writer topology for the current session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    SingleWriter,
    MultiWriter,
}

/// Everything the UI needs to hear, on one channel.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The live document changed; pull [`Session::snapshot`] for the view.
    DocChanged { source: ChangeSource },
    ModeChanged(SessionMode),
    PeerJoined(PeerProfile),
    PeerLeft(PeerId),
    Saved,
    SaveFailed(String),
}

#[derive(Debug)]
pub enum SessionError {
    /// The validator refused a local mutation; nothing was applied.
    Rejected(MutationError),
    Store(StoreError),
    Transport(TransportError),
    Protocol(ProtocolError),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rejected(e) => write!(f, "mutation rejected: {e}"),
            Self::Store(e) => write!(f, "store error: {e}"),
            Self::Transport(e) => write!(f, "transport error: {e}"),
            Self::Protocol(e) => write!(f, "protocol error: {e}"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<MutationError> for SessionError {
    fn from(e: MutationError) -> Self {
        Self::Rejected(e)
    }
}

impl From<StoreError> for SessionError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl From<TransportError> for SessionError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

impl From<ProtocolError> for SessionError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

// ───────────────────────────────────────────────────────────────────
// Document core
// ───────────────────────────────────────────────────────────────────

enum DocCore {
    Single(LocalGraph),
    Multi(ReplicatedGraph),
}

impl DocCore {
    fn snapshot(&self) -> GraphSnapshot {
        match self {
            DocCore::Single(doc) => doc.snapshot(),
            DocCore::Multi(doc) => doc.snapshot(),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Session
// ───────────────────────────────────────────────────────────────────

/// Handle to an open project session. Mutations, presence updates, and
/// reads all go through here; drop it via [`Session::close`] so the final
/// flush and disconnect run in order.
pub struct Session {
    shared: Arc<Shared>,
    debouncer: Debouncer,
    pumps: Vec<JoinHandle<()>>,
}

struct Shared {
    project: String,
    peer: PeerId,
    config: SyncConfig,
    ops_topic: String,
    presence_topic: String,
    doc: Arc<Mutex<DocCore>>,
    tracker: Mutex<PresenceTracker>,
    transport: Arc<dyn Transport>,
    saver: SaveHandle,
    mode_tx: watch::Sender<SessionMode>,
    events_tx: broadcast::Sender<SessionEvent>,
}

impl Session {
    /// Open a session with the default connection rule table.
    pub async fn open(
        project: impl Into<String>,
        display_name: impl Into<String>,
        transport: Arc<dyn Transport>,
        store: Arc<dyn PersistenceStore>,
        config: SyncConfig,
    ) -> Result<Self, SessionError> {
        Self::open_with_policy(
            project,
            display_name,
            ConnectionPolicy::default(),
            transport,
            store,
            config,
        )
        .await
    }

    pub async fn open_with_policy(
        project: impl Into<String>,
        display_name: impl Into<String>,
        policy: ConnectionPolicy,
        transport: Arc<dyn Transport>,
        store: Arc<dyn PersistenceStore>,
        config: SyncConfig,
    ) -> Result<Self, SessionError> {
        let project = project.into();
        let peer = transport.local_peer();
        let profile = PeerProfile::new(peer, display_name);
        let tracker = PresenceTracker::with_config(profile, &config);

        let loaded = store.load(&project).await?;
        let seeded = loaded.as_ref().map_or(0, |s| s.nodes.len());
        let doc = Arc::new(Mutex::new(DocCore::Single(LocalGraph::from_snapshot(
            loaded.unwrap_or_default(),
            policy,
        ))));
        log::info!("session {project}: opened ({seeded} nodes loaded)");

        let snapshot_doc = Arc::clone(&doc);
        let debouncer = Debouncer::spawn(
            project.clone(),
            store,
            Arc::new(move || snapshot_doc.lock().unwrap().snapshot()),
            config.debounce(),
            config.resync_interval(),
        );

        let ops_topic = config::ops_topic(&project);
        let presence_topic = config::presence_topic(&project);

        // Membership receiver first: join announcements triggered by our
        // own subscribes must land in the channel, not before it exists.
        let membership_rx = transport.membership();
        let ops_sub = transport.subscribe(&ops_topic, EventKind::Message).await?;
        let awareness_sub = transport
            .subscribe(&presence_topic, EventKind::Awareness)
            .await?;
        let cursor_sub = transport
            .subscribe(&presence_topic, EventKind::CursorMove)
            .await?;
        let selection_sub = transport
            .subscribe(&presence_topic, EventKind::NodeSelection)
            .await?;

        let (mode_tx, _) = watch::channel(SessionMode::SingleWriter);
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);

        let shared = Arc::new(Shared {
            project,
            peer,
            config,
            ops_topic,
            presence_topic,
            doc,
            tracker: Mutex::new(tracker),
            transport,
            saver: debouncer.handle(),
            mode_tx,
            events_tx,
        });

        let pumps = vec![
            tokio::spawn(pump_ops(Arc::clone(&shared), ops_sub)),
            tokio::spawn(pump_presence(
                Arc::clone(&shared),
                awareness_sub,
                cursor_sub,
                selection_sub,
            )),
            tokio::spawn(pump_membership(Arc::clone(&shared), membership_rx)),
            tokio::spawn(pump_sweep(Arc::clone(&shared))),
            tokio::spawn(pump_saves(Arc::clone(&shared), debouncer.status())),
        ];

        // Introduce ourselves; in an empty room this reaches nobody.
        shared.announce();

        // The room may already be populated (relay roster, mesh signaling).
        if !shared.transport.peers().is_empty() {
            shared.ensure_multi();
        }

        Ok(Self {
            shared,
            debouncer,
            pumps,
        })
    }

    // ── mutation ────────────────────────────────────────────────────

    /// Validate and apply one mutation, returning the new live view.
    /// Synchronous and non-blocking: the network only ever sees the
    /// resulting batch through a queue.
    pub fn apply(&self, op: LocalOp) -> Result<GraphSnapshot, SessionError> {
        let (snapshot, batch) = {
            let mut doc = self.shared.doc.lock().unwrap();
            match &mut *doc {
                DocCore::Single(local) => {
                    local.apply(op)?;
                    (local.snapshot(), None)
                }
                DocCore::Multi(replica) => {
                    let commit = replica.apply_local(op)?;
                    (commit.snapshot, Some(commit.batch))
                }
            }
        };
        if let Some(batch) = batch {
            if !batch.is_empty() {
                self.shared.broadcast_ops(batch);
            }
        }
        self.shared.saver.touch();
        self.shared.emit(SessionEvent::DocChanged {
            source: ChangeSource::Local,
        });
        Ok(snapshot)
    }

    // ── presence ────────────────────────────────────────────────────

    /// Report the local cursor; `None` when it leaves the canvas.
    /// Throttled: bursts collapse to a leading and a trailing publish.
    pub fn update_cursor(&self, cursor: Option<Position>) {
        let decision = self
            .shared
            .tracker
            .lock()
            .unwrap()
            .set_local_cursor(cursor, Instant::now());
        match decision {
            Publish::Now(update) => match cursor {
                Some(position) => self.shared.send_cursor(CursorMove {
                    peer: self.shared.peer,
                    position,
                }),
                // Leaving the canvas clears a field; only the full update
                // can carry that.
                None => self.shared.send_awareness(&update),
            },
            Publish::Deferred(delay) => self.shared.arm_trailing(delay),
            Publish::Coalesced => {}
        }
    }

    /// Claim a node selection (`Some`) or release it (`None`).
    pub fn select_node(&self, node: Option<NodeId>) {
        let decision = self
            .shared
            .tracker
            .lock()
            .unwrap()
            .set_local_selection(node.clone(), Instant::now());
        match decision {
            Publish::Now(_) => self.shared.send_selection(NodeSelection {
                peer: self.shared.peer,
                node,
            }),
            Publish::Deferred(delay) => self.shared.arm_trailing(delay),
            Publish::Coalesced => {}
        }
    }

    // ── views ───────────────────────────────────────────────────────

    pub fn project(&self) -> &str {
        &self.shared.project
    }

    pub fn local_peer(&self) -> PeerId {
        self.shared.peer
    }

    pub fn local_profile(&self) -> PeerProfile {
        self.shared.tracker.lock().unwrap().local_profile().clone()
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        self.shared.doc.lock().unwrap().snapshot()
    }

    /// Edges held out of the live view by the repair pass. Always empty
    /// in single-writer mode.
    pub fn quarantined_edges(&self) -> Vec<EdgeId> {
        match &*self.shared.doc.lock().unwrap() {
            DocCore::Single(_) => Vec::new(),
            DocCore::Multi(replica) => replica.quarantined_edges(),
        }
    }

    pub fn mode(&self) -> SessionMode {
        *self.shared.mode_tx.borrow()
    }

    pub fn mode_watch(&self) -> watch::Receiver<SessionMode> {
        self.shared.mode_tx.subscribe()
    }

    pub fn link_health(&self) -> watch::Receiver<LinkHealth> {
        self.shared.transport.health()
    }

    pub fn save_status(&self) -> watch::Receiver<SaveStatus> {
        self.debouncer.status()
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events_tx.subscribe()
    }

    /// Remote collaborators currently considered live, sorted by id.
    pub fn peers(&self) -> Vec<PeerAwareness> {
        self.shared
            .tracker
            .lock()
            .unwrap()
            .peers()
            .into_iter()
            .cloned()
            .collect()
    }

    // ── lifecycle ───────────────────────────────────────────────────

    /// Force a save now; no-op on a clean document.
    pub async fn flush(&self) -> Result<(), SessionError> {
        self.debouncer.flush().await?;
        Ok(())
    }

    /// Tear down: stop the pumps, flush, then disconnect, in that order.
    pub async fn close(self) -> Result<(), SessionError> {
        for pump in &self.pumps {
            pump.abort();
        }
        let flushed = self.debouncer.shutdown().await;
        self.shared.transport.disconnect().await;
        log::info!("session {}: closed", self.shared.project);
        flushed?;
        Ok(())
    }
}

// ───────────────────────────────────────────────────────────────────
// Shared internals
// ───────────────────────────────────────────────────────────────────

impl Shared {
    fn emit(&self, event: SessionEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Migrate single-writer state into a replica seeded from the current
    /// snapshot, then ask the room for any history we missed. Idempotent.
    fn ensure_multi(&self) {
        let promoted = {
            let mut doc = self.doc.lock().unwrap();
            match &*doc {
                DocCore::Multi(_) => false,
                DocCore::Single(local) => {
                    let snapshot = local.snapshot();
                    let policy = local.policy().clone();
                    *doc = DocCore::Multi(ReplicatedGraph::from_snapshot(
                        self.peer, policy, snapshot,
                    ));
                    true
                }
            }
        };
        if !promoted {
            return;
        }
        log::info!(
            "session {}: collaborator detected, switching to multi-writer",
            self.project
        );
        self.mode_tx.send_replace(SessionMode::MultiWriter);
        self.emit(SessionEvent::ModeChanged(SessionMode::MultiWriter));
        self.request_state();
    }

    fn request_state(&self) {
        match SyncPayload::StateRequest.encode() {
            Ok(bytes) => {
                if let Err(e) = self.transport.send(&self.ops_topic, EventKind::Message, bytes) {
                    log::warn!("session {}: state request not sent: {e}", self.project);
                }
            }
            Err(e) => log::error!("session {}: state request encode: {e}", self.project),
        }
    }

    // ── outgoing ────────────────────────────────────────────────────

    fn broadcast_ops(&self, batch: OpBatch) {
        let count = batch.len();
        match SyncPayload::Ops(batch).encode() {
            Ok(bytes) => {
                if let Err(e) = self.transport.send(&self.ops_topic, EventKind::Message, bytes) {
                    log::warn!("session {}: {count} op(s) not sent: {e}", self.project);
                }
            }
            Err(e) => log::error!("session {}: op batch encode: {e}", self.project),
        }
    }

    fn send_awareness(&self, update: &AwarenessUpdate) {
        match update.encode() {
            Ok(bytes) => {
                if let Err(e) =
                    self.transport
                        .send(&self.presence_topic, EventKind::Awareness, bytes)
                {
                    log::debug!("session {}: awareness not sent: {e}", self.project);
                }
            }
            Err(e) => log::error!("session {}: awareness encode: {e}", self.project),
        }
    }

    fn send_cursor(&self, cursor: CursorMove) {
        match cursor.encode() {
            Ok(bytes) => {
                if let Err(e) =
                    self.transport
                        .send(&self.presence_topic, EventKind::CursorMove, bytes)
                {
                    log::debug!("session {}: cursor not sent: {e}", self.project);
                }
            }
            Err(e) => log::error!("session {}: cursor encode: {e}", self.project),
        }
    }

    fn send_selection(&self, selection: NodeSelection) {
        match selection.encode() {
            Ok(bytes) => {
                if let Err(e) =
                    self.transport
                        .send(&self.presence_topic, EventKind::NodeSelection, bytes)
                {
                    log::debug!("session {}: selection not sent: {e}", self.project);
                }
            }
            Err(e) => log::error!("session {}: selection encode: {e}", self.project),
        }
    }

    /// Publish the full local awareness state through the throttle gate.
    fn announce(self: &Arc<Self>) {
        let decision = self.tracker.lock().unwrap().announce(Instant::now());
        match decision {
            Publish::Now(update) => self.send_awareness(&update),
            Publish::Deferred(delay) => self.arm_trailing(delay),
            Publish::Coalesced => {}
        }
    }

    /// One trailing-edge publish per throttle window.
    fn arm_trailing(self: &Arc<Self>, delay: Duration) {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let pending = shared.tracker.lock().unwrap().take_pending(Instant::now());
            if let Some(update) = pending {
                shared.send_awareness(&update);
            }
        });
    }

    // ── incoming ────────────────────────────────────────────────────

    fn merge_ops(&self, origin: PeerId, batch: &OpBatch) {
        self.ensure_multi();
        let outcome = {
            let mut doc = self.doc.lock().unwrap();
            let DocCore::Multi(replica) = &mut *doc else {
                return;
            };
            replica.apply_batch(batch)
        };
        if !outcome.quarantined.is_empty() {
            log::warn!(
                "session {}: merge quarantined {} edge(s)",
                self.project,
                outcome.quarantined.len()
            );
        }
        if outcome.applied > 0 {
            self.saver.touch();
            self.emit(SessionEvent::DocChanged {
                source: ChangeSource::Remote(origin),
            });
        }
    }

    fn merge_state(&self, origin: PeerId, bytes: &[u8]) {
        self.ensure_multi();
        let outcome = {
            let mut doc = self.doc.lock().unwrap();
            let DocCore::Multi(replica) = &mut *doc else {
                return;
            };
            match replica.apply_state(bytes) {
                Ok(outcome) => outcome,
                Err(e) => {
                    log::warn!("session {}: state reply dropped: {e}", self.project);
                    return;
                }
            }
        };
        if outcome.applied > 0 {
            self.saver.touch();
            self.emit(SessionEvent::DocChanged {
                source: ChangeSource::Remote(origin),
            });
        }
    }

    /// A request implies a collaborator: promote first so the migrated
    /// snapshot is what reaches them.
    fn answer_state_request(&self) {
        self.ensure_multi();
        let encoded = {
            let doc = self.doc.lock().unwrap();
            let DocCore::Multi(replica) = &*doc else {
                return;
            };
            replica.encode_state()
        };
        let state = match encoded {
            Ok(state) => state,
            Err(e) => {
                log::error!("session {}: state encode: {e}", self.project);
                return;
            }
        };
        match SyncPayload::StateReply(state).encode() {
            Ok(bytes) => {
                if let Err(e) = self.transport.send(&self.ops_topic, EventKind::Message, bytes) {
                    log::warn!("session {}: state reply not sent: {e}", self.project);
                }
            }
            Err(e) => log::error!("session {}: state reply encode: {e}", self.project),
        }
    }

    fn on_awareness(self: &Arc<Self>, envelope: Envelope) {
        let update = match envelope.awareness() {
            Ok(update) => update,
            Err(e) => {
                log::warn!("session {}: awareness frame dropped: {e}", self.project);
                return;
            }
        };
        let profile = update.profile.clone();
        let newly_seen = {
            let mut tracker = self.tracker.lock().unwrap();
            let first = tracker.get(profile.peer).is_none();
            tracker.on_remote(update, Instant::now()) && first
        };
        if newly_seen {
            log::info!(
                "session {}: peer {} joined the canvas",
                self.project,
                profile.name
            );
            self.emit(SessionEvent::PeerJoined(profile));
            self.ensure_multi();
        }
    }

    fn on_cursor(self: &Arc<Self>, envelope: Envelope) {
        let cursor = match envelope.cursor_move() {
            Ok(cursor) => cursor,
            Err(e) => {
                log::warn!("session {}: cursor frame dropped: {e}", self.project);
                return;
            }
        };
        let peer = cursor.peer;
        let joined = {
            let mut tracker = self.tracker.lock().unwrap();
            let first = tracker.get(peer).is_none();
            if tracker.on_cursor(cursor, Instant::now()) && first {
                tracker.get(peer).map(|p| p.profile.clone())
            } else {
                None
            }
        };
        if let Some(profile) = joined {
            self.emit(SessionEvent::PeerJoined(profile));
            self.ensure_multi();
        }
    }

    fn on_selection(self: &Arc<Self>, envelope: Envelope) {
        let selection = match envelope.node_selection() {
            Ok(selection) => selection,
            Err(e) => {
                log::warn!("session {}: selection frame dropped: {e}", self.project);
                return;
            }
        };
        let peer = selection.peer;
        let joined = {
            let mut tracker = self.tracker.lock().unwrap();
            let first = tracker.get(peer).is_none();
            if tracker.on_selection(selection, Instant::now()) && first {
                tracker.get(peer).map(|p| p.profile.clone())
            } else {
                None
            }
        };
        if let Some(profile) = joined {
            self.emit(SessionEvent::PeerJoined(profile));
            self.ensure_multi();
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Pumps
// ───────────────────────────────────────────────────────────────────

async fn pump_ops(shared: Arc<Shared>, mut sub: Subscription) {
    while let Some(envelope) = sub.recv().await {
        let origin = envelope.sender;
        match envelope.sync_payload() {
            Ok(SyncPayload::Ops(batch)) => shared.merge_ops(origin, &batch),
            Ok(SyncPayload::StateRequest) => shared.answer_state_request(),
            Ok(SyncPayload::StateReply(bytes)) => shared.merge_state(origin, &bytes),
            Err(e) => log::warn!(
                "session {}: malformed sync payload from {origin}: {e}",
                shared.project
            ),
        }
    }
}

async fn pump_presence(
    shared: Arc<Shared>,
    mut awareness: Subscription,
    mut cursors: Subscription,
    mut selections: Subscription,
) {
    loop {
        tokio::select! {
            envelope = awareness.recv() => match envelope {
                Some(envelope) => shared.on_awareness(envelope),
                None => break,
            },
            envelope = cursors.recv() => match envelope {
                Some(envelope) => shared.on_cursor(envelope),
                None => break,
            },
            envelope = selections.recv() => match envelope {
                Some(envelope) => shared.on_selection(envelope),
                None => break,
            },
        }
    }
}

async fn pump_membership(shared: Arc<Shared>, mut membership: broadcast::Receiver<Membership>) {
    loop {
        match membership.recv().await {
            Ok(Membership::Joined { peer, .. }) => {
                if peer == shared.peer {
                    continue;
                }
                shared.ensure_multi();
                // Re-announce so the joiner learns our profile without
                // waiting for local input.
                shared.announce();
            }
            Ok(Membership::Left { peer, .. }) => {
                if peer == shared.peer {
                    continue;
                }
                let removed = shared.tracker.lock().unwrap().remove(peer);
                if removed {
                    shared.emit(SessionEvent::PeerLeft(peer));
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                log::warn!(
                    "session {}: membership receiver lagged by {n}",
                    shared.project
                );
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Evict peers silent past the liveness timeout, on a fixed cadence.
async fn pump_sweep(shared: Arc<Shared>) {
    let mut ticker = tokio::time::interval(shared.config.sweep_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let evicted = shared.tracker.lock().unwrap().sweep(Instant::now());
        for peer in evicted {
            shared.emit(SessionEvent::PeerLeft(peer));
        }
    }
}

/// Translate save-status transitions into session events.
async fn pump_saves(shared: Arc<Shared>, mut status: watch::Receiver<SaveStatus>) {
    let mut last_saved = status.borrow().last_saved_at;
    let mut last_error = status.borrow().last_error.clone();
    while status.changed().await.is_ok() {
        let current = status.borrow().clone();
        if current.last_saved_at != last_saved {
            last_saved = current.last_saved_at;
            shared.emit(SessionEvent::Saved);
        }
        if current.last_error != last_error {
            if let Some(message) = current.last_error.clone() {
                shared.emit(SessionEvent::SaveFailed(message));
            }
            last_error = current.last_error;
        }
    }
}
