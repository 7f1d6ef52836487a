//! Engine configuration and topic naming.

use std::time::Duration;

/// Knobs for every sync component. `Default` carries the documented
/// production values; [`SyncConfig::for_testing`] tightens the timing
/// windows so integration tests run in milliseconds.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Relay WebSocket URL.
    pub relay_url: String,
    /// Signaling WebSocket URL (mesh bootstrap only).
    pub signal_url: String,
    /// Persistence quiescence window in milliseconds.
    pub debounce_ms: u64,
    /// Awareness broadcast throttle in milliseconds (trailing edge).
    pub awareness_throttle_ms: u64,
    /// Presence liveness timeout in seconds. Values below 10 are clamped.
    pub liveness_timeout_secs: u64,
    /// Presence sweep period in seconds, at or above the liveness timeout.
    pub sweep_interval_secs: u64,
    /// Persistence retry period when a save failed, in seconds.
    pub resync_interval_secs: u64,
    /// First reconnect delay in milliseconds; doubles per attempt.
    pub backoff_base_ms: u64,
    /// Reconnect delay ceiling in milliseconds.
    pub backoff_cap_ms: u64,
    /// Envelopes queued while the link is down before the oldest drops.
    pub outbox_capacity: usize,
    /// Relay room broadcast buffer per receiver.
    pub room_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://127.0.0.1:9090".to_string(),
            signal_url: "ws://127.0.0.1:9091".to_string(),
            debounce_ms: 1000,
            awareness_throttle_ms: 50,
            liveness_timeout_secs: 30,
            sweep_interval_secs: 30,
            resync_interval_secs: 60,
            backoff_base_ms: 250,
            backoff_cap_ms: 10_000,
            outbox_capacity: 10_000,
            room_capacity: 256,
        }
    }
}

impl SyncConfig {
    /// Millisecond-scale windows for tests.
    pub fn for_testing() -> Self {
        Self {
            debounce_ms: 100,
            awareness_throttle_ms: 25,
            liveness_timeout_secs: 10,
            sweep_interval_secs: 1,
            resync_interval_secs: 1,
            backoff_base_ms: 50,
            backoff_cap_ms: 200,
            outbox_capacity: 64,
            room_capacity: 16,
            ..Self::default()
        }
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn awareness_throttle(&self) -> Duration {
        Duration::from_millis(self.awareness_throttle_ms)
    }

    /// Liveness timeout, clamped to the 10s floor.
    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness_timeout_secs.max(10))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }
}

/// Topic carrying CRDT operation bytes for a project.
pub fn ops_topic(project: &str) -> String {
    format!("project:{project}:graph")
}

/// Topic carrying awareness, cursor, and selection events for a project.
pub fn presence_topic(project: &str) -> String {
    format!("project:{project}:presence")
}
