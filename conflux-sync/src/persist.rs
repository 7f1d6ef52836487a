//! Durable snapshots: the store trait, two implementations, and the
//! debouncer that decides when saves actually happen.
//!
//! ```text
//! touch() ──▶ [window re-arms] ──quiet for 1000ms──▶ save(snapshot())
//!                                        save failed ─▶ retry on resync tick
//! flush() ──────────────────────────────▶ save now, awaited
//! ```
//!
//! Saves never run in the mutation path; the worker task serializes one
//! save at a time, so an in-flight save always completes before a final
//! flush on teardown. Failures keep the document marked dirty and are
//! surfaced on a `watch` status channel, never raised into callers.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};

use conflux_graph::GraphSnapshot;

// ───────────────────────────────────────────────────────────────────
// Store trait
// ───────────────────────────────────────────────────────────────────

/// An opaque durable store for project snapshots.
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    async fn save(&self, project: &str, snapshot: &GraphSnapshot) -> Result<(), StoreError>;
    async fn load(&self, project: &str) -> Result<Option<GraphSnapshot>, StoreError>;
}

#[derive(Debug)]
pub enum StoreError {
    Io(std::io::Error),
    Encode(String),
    Backend(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::Encode(e) => write!(f, "encode error: {e}"),
            Self::Backend(e) => write!(f, "backend error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Encode(e.to_string())
    }
}

// ───────────────────────────────────────────────────────────────────
// Stores
// ───────────────────────────────────────────────────────────────────

/// In-memory store with call counters and injectable failure.
#[derive(Default)]
pub struct MemoryStore {
    docs: Mutex<HashMap<String, GraphSnapshot>>,
    saves: AtomicUsize,
    loads: AtomicUsize,
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every `save` fails with a backend error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }

    /// Total `save` calls, including failed ones.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::Acquire)
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::Acquire)
    }

    pub fn stored(&self, project: &str) -> Option<GraphSnapshot> {
        self.docs.lock().unwrap().get(project).cloned()
    }

    /// Seed a snapshot, bypassing the counters.
    pub fn seed(&self, project: &str, snapshot: GraphSnapshot) {
        self.docs.lock().unwrap().insert(project.to_string(), snapshot);
    }
}

#[async_trait]
impl PersistenceStore for MemoryStore {
    async fn save(&self, project: &str, snapshot: &GraphSnapshot) -> Result<(), StoreError> {
        self.saves.fetch_add(1, Ordering::AcqRel);
        if self.failing.load(Ordering::Acquire) {
            return Err(StoreError::Backend("injected save failure".to_string()));
        }
        self.docs
            .lock()
            .unwrap()
            .insert(project.to_string(), snapshot.clone());
        Ok(())
    }

    async fn load(&self, project: &str) -> Result<Option<GraphSnapshot>, StoreError> {
        self.loads.fetch_add(1, Ordering::AcqRel);
        Ok(self.docs.lock().unwrap().get(project).cloned())
    }
}

/// One pretty-printed JSON file per project under a root directory.
/// Writes go to a temp file first and rename into place, so a crashed
/// save never leaves a truncated document.
pub struct JsonFileStore {
    root: PathBuf,
}

impl JsonFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, project: &str) -> PathBuf {
        let safe: String = project
            .chars()
            .map(|c| if c == '/' || c == '\\' { '-' } else { c })
            .collect();
        self.root.join(format!("{safe}.json"))
    }
}

#[async_trait]
impl PersistenceStore for JsonFileStore {
    async fn save(&self, project: &str, snapshot: &GraphSnapshot) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.root).await?;
        let json = serde_json::to_vec_pretty(snapshot)?;
        let path = self.path_for(project);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        log::debug!("persist: wrote {} ({} bytes)", path.display(), json.len());
        Ok(())
    }

    async fn load(&self, project: &str) -> Result<Option<GraphSnapshot>, StoreError> {
        match tokio::fs::read(self.path_for(project)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Debouncer
// ───────────────────────────────────────────────────────────────────

/// Save state surfaced to the UI.
#[derive(Debug, Clone, Default)]
pub struct SaveStatus {
    /// Unsaved mutations exist.
    pub dirty: bool,
    /// A save is running right now.
    pub saving: bool,
    pub last_saved_at: Option<SystemTime>,
    /// Last failure, cleared by the next successful save.
    pub last_error: Option<String>,
}

/// Snapshot provider called at save time, not at touch time.
pub type SnapshotFn = Arc<dyn Fn() -> GraphSnapshot + Send + Sync>;

enum Cmd {
    Touch,
    Flush(oneshot::Sender<Result<(), String>>),
}

/// Trailing-edge save scheduler.
///
/// `touch()` marks the document dirty and re-arms the quiescence window;
/// the worker saves once the window passes without another touch. A
/// failed save re-arms on the resync interval instead.
pub struct Debouncer {
    cmd_tx: mpsc::UnboundedSender<Cmd>,
    status_rx: watch::Receiver<SaveStatus>,
    task: tokio::task::JoinHandle<()>,
}

/// Cloneable touch handle, detached from the owning [`Debouncer`].
#[derive(Clone)]
pub struct SaveHandle {
    cmd_tx: mpsc::UnboundedSender<Cmd>,
    status_rx: watch::Receiver<SaveStatus>,
}

impl SaveHandle {
    /// Mark dirty and re-arm the window. Harmless after shutdown.
    pub fn touch(&self) {
        let _ = self.cmd_tx.send(Cmd::Touch);
    }

    pub fn status(&self) -> watch::Receiver<SaveStatus> {
        self.status_rx.clone()
    }
}

impl Debouncer {
    pub fn spawn(
        project: impl Into<String>,
        store: Arc<dyn PersistenceStore>,
        snapshot: SnapshotFn,
        window: Duration,
        resync: Duration,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(SaveStatus::default());
        let task = tokio::spawn(run(
            project.into(),
            store,
            snapshot,
            window,
            resync,
            cmd_rx,
            status_tx,
        ));
        Self {
            cmd_tx,
            status_rx,
            task,
        }
    }

    /// Mark dirty and re-arm the window. Never blocks.
    pub fn touch(&self) {
        let _ = self.cmd_tx.send(Cmd::Touch);
    }

    pub fn handle(&self) -> SaveHandle {
        SaveHandle {
            cmd_tx: self.cmd_tx.clone(),
            status_rx: self.status_rx.clone(),
        }
    }

    /// Save now if dirty, and wait for the result. A clean document is a
    /// no-op `Ok`.
    pub async fn flush(&self) -> Result<(), StoreError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Cmd::Flush(reply_tx))
            .map_err(|_| StoreError::Backend("debouncer stopped".to_string()))?;
        match reply_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(StoreError::Backend(e)),
            Err(_) => Err(StoreError::Backend("debouncer stopped".to_string())),
        }
    }

    pub fn status(&self) -> watch::Receiver<SaveStatus> {
        self.status_rx.clone()
    }

    /// Final flush, then stop the worker.
    pub async fn shutdown(self) -> Result<(), StoreError> {
        let result = self.flush().await;
        drop(self.cmd_tx);
        let _ = self.task.await;
        result
    }
}

async fn run(
    project: String,
    store: Arc<dyn PersistenceStore>,
    snapshot: SnapshotFn,
    window: Duration,
    resync: Duration,
    mut cmd_rx: mpsc::UnboundedReceiver<Cmd>,
    status_tx: watch::Sender<SaveStatus>,
) {
    let mut deadline: Option<tokio::time::Instant> = None;

    loop {
        tokio::select! {
            // Commands first: a touch that raced an expired window re-arms
            // it instead of letting a stale save fire.
            biased;

            cmd = cmd_rx.recv() => match cmd {
                Some(Cmd::Touch) => {
                    status_tx.send_modify(|s| s.dirty = true);
                    deadline = Some(tokio::time::Instant::now() + window);
                }
                Some(Cmd::Flush(reply)) => {
                    let result = if status_tx.borrow().dirty {
                        save_once(&project, &store, &snapshot, &status_tx).await
                    } else {
                        Ok(())
                    };
                    deadline = match &result {
                        Ok(()) => None,
                        Err(_) => Some(tokio::time::Instant::now() + resync),
                    };
                    let _ = reply.send(result.map_err(|e| e.to_string()));
                }
                None => {
                    // Owner dropped; nothing left to schedule. The owner's
                    // shutdown path flushes before letting go.
                    return;
                }
            },

            _ = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            } => {
                deadline = match save_once(&project, &store, &snapshot, &status_tx).await {
                    Ok(()) => None,
                    Err(_) => Some(tokio::time::Instant::now() + resync),
                };
            }
        }
    }
}

async fn save_once(
    project: &str,
    store: &Arc<dyn PersistenceStore>,
    snapshot: &SnapshotFn,
    status_tx: &watch::Sender<SaveStatus>,
) -> Result<(), StoreError> {
    status_tx.send_modify(|s| s.saving = true);
    let state = snapshot();
    let result = store.save(project, &state).await;
    match &result {
        Ok(()) => {
            status_tx.send_modify(|s| {
                s.saving = false;
                s.dirty = false;
                s.last_saved_at = Some(SystemTime::now());
                s.last_error = None;
            });
            log::debug!(
                "persist: saved {project} ({} nodes, {} edges)",
                state.nodes.len(),
                state.edges.len()
            );
        }
        Err(e) => {
            status_tx.send_modify(|s| {
                s.saving = false;
                s.last_error = Some(e.to_string());
            });
            log::warn!("persist: save failed for {project}: {e}");
        }
    }
    result
}
