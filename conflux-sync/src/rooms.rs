//! Topic rooms: fan-out of encoded frames to every member of a topic.
//!
//! Each room wraps one tokio broadcast channel carrying `Arc<Vec<u8>>`, so a
//! frame is encoded once and shared by every receiver. Receivers buffer up
//! to `capacity` frames; a lagging receiver drops the oldest and the
//! connection task reports the loss here.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use conflux_graph::PeerId;

/// Room health counters, read via [`Room::stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub members: usize,
}

/// Lock-free counters so publishing never takes a lock.
#[derive(Default)]
struct AtomicRoomStats {
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
}

/// One topic's broadcast group.
///
/// Members share a single channel; publishing fans out to every receiver,
/// the publisher's own included (self-filtering is the subscriber's job).
pub struct Room {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    members: RwLock<HashSet<PeerId>>,
    capacity: usize,
    stats: AtomicRoomStats,
}

impl Room {
    /// `capacity` bounds the per-receiver buffer; beyond it, lagging
    /// receivers lose the oldest frames.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            members: RwLock::new(HashSet::new()),
            capacity,
            stats: AtomicRoomStats::default(),
        }
    }

    /// Add a member and hand it a receiver positioned at the live edge.
    pub async fn join(&self, peer: PeerId) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.members.write().await.insert(peer);
        self.sender.subscribe()
    }

    /// Remove a member. Returns false if it was not present.
    pub async fn leave(&self, peer: &PeerId) -> bool {
        self.members.write().await.remove(peer)
    }

    /// Publish pre-encoded bytes to every receiver. Lock-free; returns the
    /// number of receivers reached (zero when the room is idle).
    pub fn publish(&self, encoded: Arc<Vec<u8>>) -> usize {
        let reached = self.sender.send(encoded).unwrap_or(0);
        self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
        reached
    }

    /// Record frames lost to a lagging receiver (reported by the
    /// connection task on `RecvError::Lagged`).
    pub fn note_dropped(&self, count: u64) {
        self.stats.frames_dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn members(&self) -> Vec<PeerId> {
        self.members.read().await.iter().copied().collect()
    }

    pub async fn contains(&self, peer: &PeerId) -> bool {
        self.members.read().await.contains(peer)
    }

    pub async fn stats(&self) -> RoomStats {
        RoomStats {
            frames_sent: self.stats.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
            members: self.member_count().await,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Raw receiver without membership (server-internal taps).
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.sender.subscribe()
    }
}

/// All live rooms, keyed by topic string.
pub struct RoomMap {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    default_capacity: usize,
}

impl RoomMap {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    pub async fn get(&self, topic: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(topic).cloned()
    }

    pub async fn get_or_create(&self, topic: &str) -> Arc<Room> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(topic) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring the write lock.
        if let Some(room) = rooms.get(topic) {
            return room.clone();
        }
        let room = Arc::new(Room::new(self.default_capacity));
        rooms.insert(topic.to_string(), room.clone());
        room
    }

    /// Drop a room once its last member left.
    pub async fn remove_if_empty(&self, topic: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(topic) {
            if room.member_count().await == 0 {
                rooms.remove(topic);
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_topics(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn peer(n: u128) -> PeerId {
        PeerId::from_uuid(Uuid::from_u128(n))
    }

    #[tokio::test]
    async fn test_join_leave() {
        let room = Room::new(16);
        let p = peer(1);

        let _rx = room.join(p).await;
        assert_eq!(room.member_count().await, 1);
        assert!(room.contains(&p).await);

        assert!(room.leave(&p).await);
        assert!(!room.leave(&p).await);
        assert_eq!(room.member_count().await, 0);
    }

    #[tokio::test]
    async fn test_publish_reaches_every_member() {
        let room = Room::new(16);
        let mut rx1 = room.join(peer(1)).await;
        let mut rx2 = room.join(peer(2)).await;
        let mut rx3 = room.join(peer(3)).await;

        let frame = Arc::new(vec![1u8, 2, 3]);
        // The publisher's receiver also gets it; filtering is the
        // subscriber's job.
        assert_eq!(room.publish(frame.clone()), 3);

        for rx in [&mut rx1, &mut rx2, &mut rx3] {
            let received = rx.recv().await.unwrap();
            assert_eq!(*received, vec![1u8, 2, 3]);
        }
    }

    #[tokio::test]
    async fn test_publish_to_idle_room_is_ok() {
        let room = Room::new(16);
        assert_eq!(room.publish(Arc::new(vec![0u8])), 0);
    }

    #[tokio::test]
    async fn test_stats_track_sent_and_dropped() {
        let room = Room::new(16);
        let _rx = room.join(peer(1)).await;

        room.publish(Arc::new(vec![1u8]));
        room.publish(Arc::new(vec![2u8]));
        room.note_dropped(3);

        let stats = room.stats().await;
        assert_eq!(stats.frames_sent, 2);
        assert_eq!(stats.frames_dropped, 3);
        assert_eq!(stats.members, 1);
    }

    #[tokio::test]
    async fn test_lagging_receiver_reports_loss() {
        let room = Room::new(2);
        let mut rx = room.join(peer(1)).await;

        for i in 0..5u8 {
            room.publish(Arc::new(vec![i]));
        }

        // Buffer of 2: the first recv reports how many frames were lost.
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => {
                room.note_dropped(n);
                assert_eq!(n, 3);
            }
            other => panic!("expected lag, got {:?}", other),
        }
        assert_eq!(room.stats().await.frames_dropped, 3);
    }

    #[tokio::test]
    async fn test_room_map_get_or_create() {
        let map = RoomMap::new(16);

        let a = map.get_or_create("project:p1:graph").await;
        let b = map.get_or_create("project:p1:graph").await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(map.room_count().await, 1);

        map.get_or_create("project:p2:graph").await;
        assert_eq!(map.room_count().await, 2);
        assert!(map
            .active_topics()
            .await
            .contains(&"project:p1:graph".to_string()));
    }

    #[tokio::test]
    async fn test_room_map_cleanup() {
        let map = RoomMap::new(16);
        let room = map.get_or_create("t").await;

        let p = peer(1);
        let _rx = room.join(p).await;
        assert!(!map.remove_if_empty("t").await);

        room.leave(&p).await;
        assert!(map.remove_if_empty("t").await);
        assert_eq!(map.room_count().await, 0);
        assert!(map.get("t").await.is_none());
    }
}
