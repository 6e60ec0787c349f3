//! In-process presence store with TTL expiry.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use murmur_protocol::{Envelope, RoomId, UserId};
use tokio::time::Instant;

use super::{PresenceRecord, PresenceStore};
use crate::error::StoreError;

/// [`PresenceStore`] held in process memory.
///
/// Expiry is checked lazily on read against the tokio clock.
#[derive(Debug, Default)]
pub struct MemoryPresenceStore {
    online: DashMap<UserId, (PresenceRecord, Instant)>,
    rooms: DashMap<RoomId, HashSet<UserId>>,
    messages: DashMap<RoomId, (VecDeque<Envelope>, Instant)>,
}

impl MemoryPresenceStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn live_record(&self, user_id: UserId) -> Option<PresenceRecord> {
        let now = Instant::now();
        self.online.remove_if(&user_id, |_, (_, expires)| *expires <= now);
        self.online.get(&user_id).map(|entry| entry.0.clone())
    }
}

#[async_trait]
impl PresenceStore for MemoryPresenceStore {
    async fn set_online(&self, record: &PresenceRecord) -> Result<(), StoreError> {
        let expires = Instant::now() + record.ttl();
        self.online.insert(record.user_id, (record.clone(), expires));
        Ok(())
    }

    async fn set_offline(&self, user_id: UserId) -> Result<(), StoreError> {
        self.online.remove(&user_id);
        Ok(())
    }

    async fn get_online(&self, user_id: UserId) -> Result<Option<PresenceRecord>, StoreError> {
        Ok(self.live_record(user_id))
    }

    async fn list_room_users(&self, room_id: RoomId) -> Result<Vec<UserId>, StoreError> {
        let marked: Vec<UserId> = self
            .rooms
            .get(&room_id)
            .map(|users| users.iter().copied().collect())
            .unwrap_or_default();
        let mut users: Vec<UserId> = marked
            .into_iter()
            .filter(|user| self.live_record(*user).is_some())
            .collect();
        users.sort_unstable();
        Ok(users)
    }

    async fn add_user_to_room(&self, room_id: RoomId, user_id: UserId) -> Result<(), StoreError> {
        self.rooms.entry(room_id).or_default().insert(user_id);
        Ok(())
    }

    async fn remove_user_from_room(
        &self,
        room_id: RoomId,
        user_id: UserId,
    ) -> Result<(), StoreError> {
        if let Some(mut users) = self.rooms.get_mut(&room_id) {
            users.remove(&user_id);
        }
        self.rooms.remove_if(&room_id, |_, users| users.is_empty());
        Ok(())
    }

    async fn cache_message(
        &self,
        room_id: RoomId,
        message: &Envelope,
        limit: usize,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let now = Instant::now();
        let mut entry = self
            .messages
            .entry(room_id)
            .or_insert_with(|| (VecDeque::new(), now + ttl));
        let (list, expires) = entry.value_mut();
        if *expires <= now {
            list.clear();
        }
        list.push_front(message.clone());
        list.truncate(limit);
        *expires = now + ttl;
        Ok(())
    }

    async fn recent_messages(
        &self,
        room_id: RoomId,
        limit: usize,
    ) -> Result<Vec<Envelope>, StoreError> {
        let now = Instant::now();
        self.messages
            .remove_if(&room_id, |_, (_, expires)| *expires <= now);
        Ok(self
            .messages
            .get(&room_id)
            .map(|entry| entry.0.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }
}
