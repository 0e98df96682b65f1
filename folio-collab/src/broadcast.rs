//! Per-document fan-out with addressed envelopes.
//!
//! Each notebook gets one tokio broadcast channel. Every event travels in an
//! [`Envelope`] naming its recipients, so acknowledgments addressed to one
//! session stay in the same FIFO stream as the operations around them.
//! Receivers filter envelopes not meant for them.
//!
//! A receiver that falls more than `capacity` envelopes behind lags; the
//! connection then resynchronises from a snapshot.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex, RwLock};

use folio_core::{DocId, SessionId};

use crate::presence::PresenceCoalescer;
use crate::protocol::{ServerEvent, UserIdentity};

/// Who an envelope is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipients {
    All,
    AllExcept(SessionId),
    Only(SessionId),
}

impl Recipients {
    pub fn includes(&self, session: &SessionId) -> bool {
        match self {
            Recipients::All => true,
            Recipients::AllExcept(excluded) => excluded != session,
            Recipients::Only(target) => target == session,
        }
    }
}

/// One broadcast event and its audience.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub recipients: Recipients,
    pub event: Arc<ServerEvent>,
}

impl Envelope {
    pub fn new(recipients: Recipients, event: ServerEvent) -> Self {
        Self {
            recipients,
            event: Arc::new(event),
        }
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    /// Envelopes skipped by lagging receivers
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// Lock-free counters for the send path.
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }
}

/// A connected session as seen by its room.
#[derive(Debug, Clone)]
pub struct Member {
    pub user: UserIdentity,
    pub joined_at: Instant,
    pub last_active: Instant,
}

/// The broadcast room of one notebook.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Envelope>,
    peers: RwLock<HashMap<SessionId, Member>>,
    presence: Mutex<PresenceCoalescer>,
    capacity: usize,
    atomic_stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    pub fn new(capacity: usize, presence_interval: Duration) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
            presence: Mutex::new(PresenceCoalescer::new(presence_interval)),
            capacity,
            atomic_stats: AtomicBroadcastStats::new(),
        }
    }

    /// Add a session and return its receiver. Envelopes sent after this
    /// call are visible to the receiver.
    pub async fn add_peer(&self, session: SessionId, user: UserIdentity) -> broadcast::Receiver<Envelope> {
        let now = Instant::now();
        let mut peers = self.peers.write().await;
        peers.insert(session, Member {
            user,
            joined_at: now,
            last_active: now,
        });
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, session: &SessionId) -> Option<Member> {
        self.presence.lock().await.remove(session);
        self.peers.write().await.remove(session)
    }

    /// Send an envelope to every receiver. Returns the number of receivers.
    pub fn send(&self, envelope: Envelope) -> usize {
        let count = self.sender.send(envelope).unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Broadcast to the room, optionally skipping one session.
    pub fn broadcast(&self, event: ServerEvent, exclude: Option<SessionId>) -> usize {
        let recipients = match exclude {
            Some(session) => Recipients::AllExcept(session),
            None => Recipients::All,
        };
        self.send(Envelope::new(recipients, event))
    }

    /// Address one session, in order with everything else in the room.
    pub fn send_to(&self, session: SessionId, event: ServerEvent) -> usize {
        self.send(Envelope::new(Recipients::Only(session), event))
    }

    /// Count envelopes a lagging receiver skipped.
    pub fn record_lag(&self, skipped: u64) {
        self.atomic_stats.messages_dropped.fetch_add(skipped, Ordering::Relaxed);
    }

    /// Mark a session as active now.
    pub async fn touch(&self, session: &SessionId) {
        if let Some(member) = self.peers.write().await.get_mut(session) {
            member.last_active = Instant::now();
        }
    }

    /// Sessions with no activity for at least `timeout`.
    pub async fn idle_peers(&self, timeout: Duration) -> Vec<SessionId> {
        self.peers
            .read()
            .await
            .iter()
            .filter(|(_, m)| m.last_active.elapsed() >= timeout)
            .map(|(s, _)| *s)
            .collect()
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<(SessionId, UserIdentity)> {
        let mut all: Vec<_> = self
            .peers
            .read()
            .await
            .iter()
            .map(|(s, m)| (*s, m.user.clone()))
            .collect();
        all.sort_by_key(|(s, _)| *s);
        all
    }

    pub async fn member(&self, session: &SessionId) -> Option<Member> {
        self.peers.read().await.get(session).cloned()
    }

    pub async fn has_peer(&self, session: &SessionId) -> bool {
        self.peers.read().await.contains_key(session)
    }

    pub fn presence(&self) -> &Mutex<PresenceCoalescer> {
        &self.presence
    }

    pub async fn stats(&self) -> BroadcastStats {
        let peers = self.peers.read().await;
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: peers.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.sender.subscribe()
    }
}

/// Maps notebook ids to their broadcast rooms.
pub struct RoomManager {
    rooms: RwLock<HashMap<DocId, Arc<BroadcastGroup>>>,
    default_capacity: usize,
    presence_interval: Duration,
}

impl RoomManager {
    pub fn new(default_capacity: usize, presence_interval: Duration) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
            presence_interval,
        }
    }

    pub async fn get_or_create(&self, doc_id: DocId) -> Arc<BroadcastGroup> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(&doc_id) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(&doc_id) {
            return room.clone();
        }

        let room = Arc::new(BroadcastGroup::new(self.default_capacity, self.presence_interval));
        rooms.insert(doc_id, room.clone());
        room
    }

    pub async fn get(&self, doc_id: &DocId) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(doc_id).cloned()
    }

    /// Remove a room nobody is in.
    pub async fn remove_if_empty(&self, doc_id: &DocId) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(doc_id) {
            if room.peer_count().await == 0 {
                rooms.remove(doc_id);
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn rooms(&self) -> Vec<(DocId, Arc<BroadcastGroup>)> {
        self.rooms
            .read()
            .await
            .iter()
            .map(|(id, room)| (*id, room.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn group() -> BroadcastGroup {
        BroadcastGroup::new(16, Duration::from_millis(33))
    }

    #[tokio::test]
    async fn test_broadcast_group_add_remove() {
        let group = group();
        let session = Uuid::new_v4();

        let _rx = group.add_peer(session, UserIdentity::new("Alice")).await;
        assert_eq!(group.peer_count().await, 1);
        assert!(group.has_peer(&session).await);

        group.remove_peer(&session).await;
        assert_eq!(group.peer_count().await, 0);
        assert!(!group.has_peer(&session).await);
    }

    #[tokio::test]
    async fn test_recipient_filtering() {
        let group = group();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let mut rx_alice = group.add_peer(alice, UserIdentity::new("Alice")).await;
        let mut rx_bob = group.add_peer(bob, UserIdentity::new("Bob")).await;

        assert_eq!(group.broadcast(ServerEvent::Participants { count: 2 }, Some(alice)), 2);
        group.send_to(alice, ServerEvent::Pong);

        // Both receivers see both envelopes; filtering happens per session.
        let first = rx_alice.recv().await.unwrap();
        assert!(!first.recipients.includes(&alice));
        let second = rx_alice.recv().await.unwrap();
        assert!(second.recipients.includes(&alice));
        assert_eq!(*second.event, ServerEvent::Pong);

        let first = rx_bob.recv().await.unwrap();
        assert!(first.recipients.includes(&bob));
        let second = rx_bob.recv().await.unwrap();
        assert!(!second.recipients.includes(&bob));
    }

    #[tokio::test]
    async fn test_lagging_receiver() {
        let group = BroadcastGroup::new(2, Duration::from_millis(33));
        let session = Uuid::new_v4();
        let mut rx = group.add_peer(session, UserIdentity::new("Slow")).await;
        for count in 0..5 {
            group.broadcast(ServerEvent::Participants { count }, None);
        }
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => {
                group.record_lag(n);
                assert_eq!(n, 3);
            }
            other => panic!("expected lag, got {other:?}"),
        }
        let stats = group.stats().await;
        assert_eq!(stats.messages_sent, 5);
        assert_eq!(stats.messages_dropped, 3);
    }

    #[tokio::test]
    async fn test_idle_peers() {
        let group = group();
        let (idle, active) = (Uuid::new_v4(), Uuid::new_v4());
        let _rx1 = group.add_peer(idle, UserIdentity::new("Idle")).await;
        let _rx2 = group.add_peer(active, UserIdentity::new("Active")).await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        group.touch(&active).await;

        assert_eq!(group.idle_peers(Duration::from_millis(20)).await, vec![idle]);
    }

    #[tokio::test]
    async fn test_room_manager_get_or_create() {
        let manager = RoomManager::new(16, Duration::from_millis(33));
        let doc_id = Uuid::new_v4();

        let room1 = manager.get_or_create(doc_id).await;
        let room2 = manager.get_or_create(doc_id).await;

        assert!(Arc::ptr_eq(&room1, &room2));
        assert_eq!(manager.room_count().await, 1);
        assert!(manager.get(&Uuid::new_v4()).await.is_none());
    }

    #[tokio::test]
    async fn test_room_manager_cleanup() {
        let manager = RoomManager::new(16, Duration::from_millis(33));
        let doc_id = Uuid::new_v4();

        let room = manager.get_or_create(doc_id).await;
        let session = Uuid::new_v4();
        let _rx = room.add_peer(session, UserIdentity::new("Alice")).await;

        assert!(!manager.remove_if_empty(&doc_id).await);
        assert_eq!(manager.room_count().await, 1);

        room.remove_peer(&session).await;
        assert!(manager.remove_if_empty(&doc_id).await);
        assert_eq!(manager.room_count().await, 0);
    }
}
