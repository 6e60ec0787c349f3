//! Presence synchronization.
//!
//! Local joins, leaves, connects and disconnects are mirrored into an
//! external [`PresenceStore`] so other processes can see who is online and
//! in which rooms. The hub never awaits presence writes: it pushes
//! [`PresenceEvent`]s into a bounded channel drained by [`PresenceSync`],
//! and a full channel drops the event. Records carry a TTL refreshed by
//! session heartbeats, so anything lost is healed by expiry.

mod memory;
#[cfg(feature = "redis")]
mod redis_store;

pub use memory::MemoryPresenceStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisPresenceStore;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use murmur_protocol::{Envelope, RoomId, UserId};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::session::ConnectionId;
use crate::store::PersistenceStore;

/// A user's online record. At most one per user; the latest connection wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: UserId,
    pub connection_id: String,
    pub room_ids: Vec<RoomId>,
    pub last_seen: DateTime<Utc>,
    pub ttl_secs: u64,
}

impl PresenceRecord {
    /// Record time-to-live.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// External presence state, shared across processes.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Write a user's online record with its TTL.
    async fn set_online(&self, record: &PresenceRecord) -> Result<(), StoreError>;

    /// Delete a user's online record.
    async fn set_offline(&self, user_id: UserId) -> Result<(), StoreError>;

    /// A user's live online record.
    async fn get_online(&self, user_id: UserId) -> Result<Option<PresenceRecord>, StoreError>;

    /// Users marked in a room who still have a live online record.
    async fn list_room_users(&self, room_id: RoomId) -> Result<Vec<UserId>, StoreError>;

    /// Mark a user as present in a room.
    async fn add_user_to_room(&self, room_id: RoomId, user_id: UserId) -> Result<(), StoreError>;

    /// Unmark a user from a room.
    async fn remove_user_from_room(
        &self,
        room_id: RoomId,
        user_id: UserId,
    ) -> Result<(), StoreError>;

    /// Push a message onto a room's recent list, keeping at most `limit`.
    async fn cache_message(
        &self,
        room_id: RoomId,
        message: &Envelope,
        limit: usize,
        ttl: Duration,
    ) -> Result<(), StoreError>;

    /// Most recent cached messages of a room, newest first.
    async fn recent_messages(
        &self,
        room_id: RoomId,
        limit: usize,
    ) -> Result<Vec<Envelope>, StoreError>;
}

/// Presence configuration.
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// Online record TTL. Should exceed the heartbeat interval.
    pub ttl: Duration,
    /// Capacity of the event channel.
    pub event_capacity: usize,
    /// Messages kept per room in the recent-message cache.
    pub message_cache_len: usize,
    /// Expiry of a room's recent-message cache.
    pub message_cache_ttl: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(120),
            event_capacity: 4096,
            message_cache_len: 100,
            message_cache_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// A local change to mirror into the store.
#[derive(Debug)]
pub enum PresenceEvent {
    /// A session registered; it now owns the user's online record.
    Connected {
        user_id: UserId,
        connection_id: ConnectionId,
    },
    /// A session unregistered while in `rooms`.
    Disconnected {
        user_id: UserId,
        connection_id: ConnectionId,
        rooms: Vec<RoomId>,
    },
    /// A session joined a room.
    Joined {
        user_id: UserId,
        room_id: RoomId,
    },
    /// A session left a room.
    Left {
        user_id: UserId,
        room_id: RoomId,
    },
    /// Heartbeat tick: renew the record's TTL.
    Refresh {
        user_id: UserId,
        connection_id: ConnectionId,
    },
    /// Push a broadcast message onto the room's recent-message list.
    CacheMessage {
        room_id: RoomId,
        message: Envelope,
    },
    /// Reply once every earlier event has been applied.
    Flush(oneshot::Sender<()>),
}

impl PresenceEvent {
    fn name(&self) -> &'static str {
        match self {
            PresenceEvent::Connected { .. } => "connected",
            PresenceEvent::Disconnected { .. } => "disconnected",
            PresenceEvent::Joined { .. } => "joined",
            PresenceEvent::Left { .. } => "left",
            PresenceEvent::Refresh { .. } => "refresh",
            PresenceEvent::CacheMessage { .. } => "cache_message",
            PresenceEvent::Flush(_) => "flush",
        }
    }
}

/// Cloneable handle: non-blocking event submission plus store queries.
#[derive(Clone)]
pub struct PresenceHandle {
    events: mpsc::Sender<PresenceEvent>,
    store: Arc<dyn PresenceStore>,
}

impl PresenceHandle {
    fn notify(&self, event: PresenceEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!(event = event.name(), "Presence queue full, dropping event");
            }
            Err(TrySendError::Closed(event)) => {
                debug!(event = event.name(), "Presence synchronizer stopped, dropping event");
            }
        }
    }

    /// A session registered.
    pub fn connected(&self, user_id: UserId, connection_id: ConnectionId) {
        self.notify(PresenceEvent::Connected {
            user_id,
            connection_id,
        });
    }

    /// A session unregistered while joined to `rooms`.
    pub fn disconnected(&self, user_id: UserId, connection_id: ConnectionId, rooms: Vec<RoomId>) {
        self.notify(PresenceEvent::Disconnected {
            user_id,
            connection_id,
            rooms,
        });
    }

    /// A session joined a room.
    pub fn joined(&self, user_id: UserId, room_id: RoomId) {
        self.notify(PresenceEvent::Joined { user_id, room_id });
    }

    /// A session left a room.
    pub fn left(&self, user_id: UserId, room_id: RoomId) {
        self.notify(PresenceEvent::Left { user_id, room_id });
    }

    /// Renew the online record's TTL. Driven by heartbeat ticks.
    pub fn refresh(&self, user_id: UserId, connection_id: ConnectionId) {
        self.notify(PresenceEvent::Refresh {
            user_id,
            connection_id,
        });
    }

    /// Push a broadcast message onto the room's recent list.
    pub fn cache_message(&self, room_id: RoomId, message: Envelope) {
        self.notify(PresenceEvent::CacheMessage { room_id, message });
    }

    /// Wait until every event submitted before this call has been applied.
    ///
    /// Returns `false` if the synchronizer has stopped.
    pub async fn flush(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        if self.events.send(PresenceEvent::Flush(tx)).await.is_err() {
            return false;
        }
        rx.await.is_ok()
    }

    /// Whether a user has a live online record.
    ///
    /// # Errors
    ///
    /// Returns an error if the presence store is unavailable.
    pub async fn is_online(&self, user_id: UserId) -> Result<bool, StoreError> {
        Ok(self.store.get_online(user_id).await?.is_some())
    }

    /// A user's live online record.
    ///
    /// # Errors
    ///
    /// Returns an error if the presence store is unavailable.
    pub async fn record(&self, user_id: UserId) -> Result<Option<PresenceRecord>, StoreError> {
        self.store.get_online(user_id).await
    }

    /// Online users in a room, as seen by every process.
    ///
    /// # Errors
    ///
    /// Returns an error if the presence store is unavailable.
    pub async fn room_users(&self, room_id: RoomId) -> Result<Vec<UserId>, StoreError> {
        self.store.list_room_users(room_id).await
    }

    /// Number of online users in a room.
    ///
    /// # Errors
    ///
    /// Returns an error if the presence store is unavailable.
    pub async fn online_count(&self, room_id: RoomId) -> Result<usize, StoreError> {
        Ok(self.store.list_room_users(room_id).await?.len())
    }

    /// Most recent cached messages of a room, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the presence store is unavailable.
    pub async fn recent_messages(
        &self,
        room_id: RoomId,
        limit: usize,
    ) -> Result<Vec<Envelope>, StoreError> {
        self.store.recent_messages(room_id, limit).await
    }
}

/// The synchronizer task.
pub struct PresenceSync {
    rx: mpsc::Receiver<PresenceEvent>,
    store: Arc<dyn PresenceStore>,
    persistence: Arc<dyn PersistenceStore>,
    config: PresenceConfig,
    /// Live local connections per user, oldest first.
    connections: HashMap<UserId, Vec<ConnectionId>>,
    /// Records this process wrote and still owns.
    records: HashMap<UserId, PresenceRecord>,
    /// Local connections per (user, room).
    occupancy: HashMap<(UserId, RoomId), usize>,
}

impl PresenceSync {
    /// Spawn the synchronizer.
    #[must_use]
    pub fn spawn(
        config: PresenceConfig,
        store: Arc<dyn PresenceStore>,
        persistence: Arc<dyn PersistenceStore>,
        shutdown: CancellationToken,
    ) -> (PresenceHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.event_capacity.max(1));
        let handle = PresenceHandle {
            events: tx,
            store: Arc::clone(&store),
        };
        let sync = PresenceSync {
            rx,
            store,
            persistence,
            config,
            connections: HashMap::new(),
            records: HashMap::new(),
            occupancy: HashMap::new(),
        };
        (handle, tokio::spawn(sync.run(shutdown)))
    }

    async fn run(mut self, shutdown: CancellationToken) {
        debug!("Presence synchronizer started");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    while let Ok(event) = self.rx.try_recv() {
                        self.apply(event).await;
                    }
                    break;
                }
                event = self.rx.recv() => match event {
                    Some(event) => self.apply(event).await,
                    None => break,
                },
            }
        }

        let users: Vec<UserId> = self.records.keys().copied().collect();
        for user in &users {
            self.set_offline(*user).await;
        }
        info!(offline = users.len(), "Presence synchronizer stopped");
    }

    async fn apply(&mut self, event: PresenceEvent) {
        match event {
            PresenceEvent::Connected {
                user_id,
                connection_id,
            } => {
                self.connections
                    .entry(user_id)
                    .or_default()
                    .push(connection_id.clone());
                self.write_record(user_id, &connection_id).await;
            }
            PresenceEvent::Disconnected {
                user_id,
                connection_id,
                rooms,
            } => self.disconnect(user_id, &connection_id, rooms).await,
            PresenceEvent::Joined { user_id, room_id } => {
                let count = self.occupancy.entry((user_id, room_id)).or_insert(0);
                *count += 1;
                if *count == 1 {
                    if let Err(e) = self.store.add_user_to_room(room_id, user_id).await {
                        warn!(user = user_id, room = room_id, error = %e, "Presence join failed");
                    }
                }
            }
            PresenceEvent::Left { user_id, room_id } => self.leave(user_id, room_id).await,
            PresenceEvent::Refresh {
                user_id,
                connection_id,
            } => self.refresh(user_id, &connection_id).await,
            PresenceEvent::CacheMessage { room_id, message } => {
                if let Err(e) = self
                    .store
                    .cache_message(
                        room_id,
                        &message,
                        self.config.message_cache_len,
                        self.config.message_cache_ttl,
                    )
                    .await
                {
                    warn!(room = room_id, error = %e, "Caching recent message failed");
                }
            }
            PresenceEvent::Flush(done) => {
                let _ = done.send(());
            }
        }
    }

    async fn write_record(&mut self, user_id: UserId, connection_id: &ConnectionId) {
        let room_ids = match self.persistence.user_rooms(user_id).await {
            Ok(rooms) => rooms,
            Err(e) => {
                warn!(user = user_id, error = %e, "Loading rooms for presence record failed");
                self.records
                    .get(&user_id)
                    .map(|r| r.room_ids.clone())
                    .unwrap_or_default()
            }
        };
        let record = PresenceRecord {
            user_id,
            connection_id: connection_id.to_string(),
            room_ids,
            last_seen: Utc::now(),
            ttl_secs: self.config.ttl.as_secs().max(1),
        };
        if let Err(e) = self.store.set_online(&record).await {
            warn!(user = user_id, error = %e, "Presence write failed");
        }
        self.records.insert(user_id, record);
    }

    async fn refresh(&mut self, user_id: UserId, connection_id: &ConnectionId) {
        let live = self
            .connections
            .get(&user_id)
            .is_some_and(|conns| conns.contains(connection_id));
        if !live {
            return;
        }
        let Some(record) = self.records.get_mut(&user_id) else {
            return;
        };
        record.last_seen = Utc::now();
        if let Err(e) = self.store.set_online(record).await {
            warn!(user = user_id, error = %e, "Presence refresh failed");
        }
    }

    async fn leave(&mut self, user_id: UserId, room_id: RoomId) {
        let Some(count) = self.occupancy.get_mut(&(user_id, room_id)) else {
            return;
        };
        *count -= 1;
        if *count > 0 {
            return;
        }
        self.occupancy.remove(&(user_id, room_id));
        if let Err(e) = self.store.remove_user_from_room(room_id, user_id).await {
            warn!(user = user_id, room = room_id, error = %e, "Presence leave failed");
        }
    }

    async fn disconnect(&mut self, user_id: UserId, connection_id: &ConnectionId, rooms: Vec<RoomId>) {
        for room in rooms {
            self.leave(user_id, room).await;
        }

        let remaining = match self.connections.get_mut(&user_id) {
            Some(conns) => {
                conns.retain(|c| c != connection_id);
                conns.last().cloned()
            }
            None => None,
        };
        if remaining.is_none() {
            self.connections.remove(&user_id);
        }

        let owns_record = self
            .records
            .get(&user_id)
            .is_some_and(|r| r.connection_id == connection_id.as_str());
        if !owns_record {
            return;
        }

        match remaining {
            // Hand the record to the newest surviving connection
            Some(next) => self.write_record(user_id, &next).await,
            None => {
                self.records.remove(&user_id);
                self.set_offline(user_id).await;
            }
        }
    }

    async fn set_offline(&self, user_id: UserId) {
        if let Err(e) = self.store.set_offline(user_id).await {
            warn!(user = user_id, error = %e, "Presence delete failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    struct Fixture {
        presence: PresenceHandle,
        store: Arc<MemoryPresenceStore>,
        shutdown: CancellationToken,
        task: JoinHandle<()>,
    }

    async fn fixture() -> Fixture {
        let persistence = Arc::new(MemoryStore::new());
        persistence.add_member(7, 1).await;
        persistence.add_member(9, 1).await;

        let store = Arc::new(MemoryPresenceStore::new());
        let shutdown = CancellationToken::new();
        let (presence, task) = PresenceSync::spawn(
            PresenceConfig::default(),
            store.clone(),
            persistence,
            shutdown.clone(),
        );
        Fixture {
            presence,
            store,
            shutdown,
            task,
        }
    }

    #[tokio::test]
    async fn test_connect_writes_record_with_persisted_rooms() {
        let f = fixture().await;
        f.presence.connected(1, ConnectionId::new("c1"));
        assert!(f.presence.flush().await);

        let record = f.presence.record(1).await.unwrap().unwrap();
        assert_eq!(record.connection_id, "c1");
        assert_eq!(record.room_ids, vec![7, 9]);
        assert!(f.presence.is_online(1).await.unwrap());
        assert!(!f.presence.is_online(2).await.unwrap());
    }

    #[tokio::test]
    async fn test_disconnect_removes_record_and_occupancy() {
        let f = fixture().await;
        let conn = ConnectionId::new("c1");
        f.presence.connected(1, conn.clone());
        f.presence.joined(1, 7);
        f.presence.flush().await;
        assert_eq!(f.presence.online_count(7).await.unwrap(), 1);

        f.presence.disconnected(1, conn, vec![7]);
        f.presence.flush().await;
        assert!(!f.presence.is_online(1).await.unwrap());
        assert_eq!(f.presence.online_count(7).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_last_connect_wins() {
        let f = fixture().await;
        let old = ConnectionId::new("old");
        let new = ConnectionId::new("new");
        f.presence.connected(1, old.clone());
        f.presence.connected(1, new.clone());
        f.presence.joined(1, 7);
        f.presence.joined(1, 7);
        f.presence.flush().await;
        assert_eq!(f.presence.record(1).await.unwrap().unwrap().connection_id, "new");

        // The stale connection going away leaves the newer record alone
        f.presence.disconnected(1, old, vec![7]);
        f.presence.flush().await;
        assert_eq!(f.presence.record(1).await.unwrap().unwrap().connection_id, "new");
        assert_eq!(f.presence.room_users(7).await.unwrap(), vec![1]);

        f.presence.disconnected(1, new, vec![7]);
        f.presence.flush().await;
        assert!(!f.presence.is_online(1).await.unwrap());
        assert!(f.presence.room_users(7).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_record_moves_to_surviving_connection() {
        let f = fixture().await;
        f.presence.connected(1, ConnectionId::new("a"));
        f.presence.connected(1, ConnectionId::new("b"));
        f.presence.disconnected(1, ConnectionId::new("b"), vec![]);
        f.presence.flush().await;

        let record = f.presence.record(1).await.unwrap().unwrap();
        assert_eq!(record.connection_id, "a");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrefreshed_record_expires() {
        let f = fixture().await;
        let conn = ConnectionId::new("c1");
        f.presence.connected(1, conn.clone());
        f.presence.flush().await;

        tokio::time::sleep(Duration::from_secs(100)).await;
        f.presence.refresh(1, conn);
        f.presence.flush().await;
        tokio::time::sleep(Duration::from_secs(100)).await;
        assert!(f.presence.is_online(1).await.unwrap());

        tokio::time::sleep(Duration::from_secs(21)).await;
        assert!(!f.presence.is_online(1).await.unwrap());
    }

    #[tokio::test]
    async fn test_recent_messages_cached() {
        let f = fixture().await;
        for n in 1..=3 {
            let envelope = Envelope::new("new_message", 7).with_content(format!("m{n}"));
            f.presence.cache_message(7, envelope);
        }
        f.presence.flush().await;

        let recent = f.presence.recent_messages(7, 2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].content, serde_json::json!("m3"));
        assert_eq!(f.store.recent_messages(7, 10).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_shutdown_clears_records() {
        let f = fixture().await;
        f.presence.connected(1, ConnectionId::new("c1"));
        f.presence.flush().await;

        f.shutdown.cancel();
        f.task.await.unwrap();
        assert!(!f.presence.is_online(1).await.unwrap());
        assert!(!f.presence.flush().await);
    }
}
