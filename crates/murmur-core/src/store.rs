//! Persistence store: durable messages, room membership and read markers.
//!
//! The hub treats the persistence layer as an external authority behind
//! [`PersistenceStore`]. [`MemoryStore`] is the in-process implementation
//! used by the server binary and tests.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use murmur_protocol::{MessageId, RoomId, UserId};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::StoreError;

/// A message to persist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub content: String,
}

/// A persisted message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: MessageId,
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Durable storage and membership authority.
///
/// Message ids are assigned by the store and increase with insertion order.
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    /// Persist a message and assign its id.
    async fn create_message(&self, message: NewMessage) -> Result<StoredMessage, StoreError>;

    /// Users who are members of a room.
    async fn room_members(&self, room_id: RoomId) -> Result<Vec<UserId>, StoreError>;

    /// Whether a user may join a room.
    async fn is_member(&self, user_id: UserId, room_id: RoomId) -> Result<bool, StoreError>;

    /// Rooms a user is a member of.
    async fn user_rooms(&self, user_id: UserId) -> Result<Vec<RoomId>, StoreError>;

    /// Id of the newest message in a room.
    async fn latest_message_id(&self, room_id: RoomId) -> Result<Option<MessageId>, StoreError>;

    /// Count messages in a room newer than `after`, ignoring those sent by
    /// `exclude_sender`. `None` counts from the beginning.
    async fn count_messages_after(
        &self,
        room_id: RoomId,
        exclude_sender: UserId,
        after: Option<MessageId>,
    ) -> Result<u64, StoreError>;

    /// Persist a user's read position in a room.
    async fn set_read_marker(
        &self,
        user_id: UserId,
        room_id: RoomId,
        message_id: MessageId,
    ) -> Result<(), StoreError>;

    /// A user's persisted read position in a room.
    async fn read_marker(
        &self,
        user_id: UserId,
        room_id: RoomId,
    ) -> Result<Option<MessageId>, StoreError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    members: HashMap<RoomId, BTreeSet<UserId>>,
    messages: Vec<StoredMessage>,
    markers: HashMap<(UserId, RoomId), MessageId>,
    next_id: MessageId,
}

/// In-memory [`PersistenceStore`].
///
/// [`set_available`](MemoryStore::set_available) simulates an outage: while
/// unavailable every call fails with [`StoreError::Unavailable`].
#[derive(Debug)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MemoryState {
                next_id: 1,
                ..MemoryState::default()
            }),
            available: AtomicBool::new(true),
        }
    }

    /// Grant a user membership of a room.
    pub async fn add_member(&self, room_id: RoomId, user_id: UserId) {
        self.state
            .write()
            .await
            .members
            .entry(room_id)
            .or_default()
            .insert(user_id);
    }

    /// Revoke a user's membership of a room.
    pub async fn remove_member(&self, room_id: RoomId, user_id: UserId) {
        let mut state = self.state.write().await;
        if let Some(members) = state.members.get_mut(&room_id) {
            members.remove(&user_id);
            if members.is_empty() {
                state.members.remove(&room_id);
            }
        }
    }

    /// Persisted messages of a room, oldest first.
    pub async fn messages(&self, room_id: RoomId) -> Vec<StoredMessage> {
        self.state
            .read()
            .await
            .messages
            .iter()
            .filter(|m| m.room_id == room_id)
            .cloned()
            .collect()
    }

    /// Toggle simulated availability.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::persistence("store offline"))
        }
    }
}

#[async_trait]
impl PersistenceStore for MemoryStore {
    async fn create_message(&self, message: NewMessage) -> Result<StoredMessage, StoreError> {
        self.check()?;
        let mut state = self.state.write().await;
        let stored = StoredMessage {
            id: state.next_id,
            room_id: message.room_id,
            sender_id: message.sender_id,
            content: message.content,
            created_at: Utc::now(),
        };
        state.next_id += 1;
        state.messages.push(stored.clone());
        Ok(stored)
    }

    async fn room_members(&self, room_id: RoomId) -> Result<Vec<UserId>, StoreError> {
        self.check()?;
        Ok(self
            .state
            .read()
            .await
            .members
            .get(&room_id)
            .map(|m| m.iter().copied().collect())
            .unwrap_or_default())
    }

    async fn is_member(&self, user_id: UserId, room_id: RoomId) -> Result<bool, StoreError> {
        self.check()?;
        Ok(self
            .state
            .read()
            .await
            .members
            .get(&room_id)
            .is_some_and(|m| m.contains(&user_id)))
    }

    async fn user_rooms(&self, user_id: UserId) -> Result<Vec<RoomId>, StoreError> {
        self.check()?;
        let state = self.state.read().await;
        let mut rooms: Vec<RoomId> = state
            .members
            .iter()
            .filter(|(_, members)| members.contains(&user_id))
            .map(|(room, _)| *room)
            .collect();
        rooms.sort_unstable();
        Ok(rooms)
    }

    async fn latest_message_id(&self, room_id: RoomId) -> Result<Option<MessageId>, StoreError> {
        self.check()?;
        Ok(self
            .state
            .read()
            .await
            .messages
            .iter()
            .rev()
            .find(|m| m.room_id == room_id)
            .map(|m| m.id))
    }

    async fn count_messages_after(
        &self,
        room_id: RoomId,
        exclude_sender: UserId,
        after: Option<MessageId>,
    ) -> Result<u64, StoreError> {
        self.check()?;
        let after = after.unwrap_or(0);
        Ok(self
            .state
            .read()
            .await
            .messages
            .iter()
            .filter(|m| m.room_id == room_id && m.sender_id != exclude_sender && m.id > after)
            .count() as u64)
    }

    async fn set_read_marker(
        &self,
        user_id: UserId,
        room_id: RoomId,
        message_id: MessageId,
    ) -> Result<(), StoreError> {
        self.check()?;
        let mut state = self.state.write().await;
        let marker = state.markers.entry((user_id, room_id)).or_insert(message_id);
        *marker = (*marker).max(message_id);
        Ok(())
    }

    async fn read_marker(
        &self,
        user_id: UserId,
        room_id: RoomId,
    ) -> Result<Option<MessageId>, StoreError> {
        self.check()?;
        Ok(self
            .state
            .read()
            .await
            .markers
            .get(&(user_id, room_id))
            .copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(room_id: RoomId, sender_id: UserId, content: &str) -> NewMessage {
        NewMessage {
            room_id,
            sender_id,
            content: content.to_string(),
        }
    }

    #[tokio::test]
    async fn test_message_ids_increase() {
        let store = MemoryStore::new();
        let a = store.create_message(text(1, 10, "a")).await.unwrap();
        let b = store.create_message(text(2, 10, "b")).await.unwrap();
        let c = store.create_message(text(1, 11, "c")).await.unwrap();
        assert!(a.id < b.id && b.id < c.id);
        assert_eq!(store.latest_message_id(1).await.unwrap(), Some(c.id));
        assert_eq!(store.latest_message_id(3).await.unwrap(), None);
        assert_eq!(store.messages(1).await.len(), 2);
    }

    #[tokio::test]
    async fn test_membership() {
        let store = MemoryStore::new();
        store.add_member(7, 1).await;
        store.add_member(7, 2).await;
        store.add_member(9, 1).await;

        assert!(store.is_member(1, 7).await.unwrap());
        assert!(!store.is_member(3, 7).await.unwrap());
        assert_eq!(store.room_members(7).await.unwrap(), vec![1, 2]);
        assert_eq!(store.user_rooms(1).await.unwrap(), vec![7, 9]);

        store.remove_member(7, 1).await;
        assert_eq!(store.user_rooms(1).await.unwrap(), vec![9]);
    }

    #[tokio::test]
    async fn test_count_after_marker() {
        let store = MemoryStore::new();
        let first = store.create_message(text(7, 1, "a")).await.unwrap();
        store.create_message(text(7, 2, "b")).await.unwrap();
        store.create_message(text(7, 1, "c")).await.unwrap();

        assert_eq!(store.count_messages_after(7, 2, None).await.unwrap(), 2);
        assert_eq!(
            store.count_messages_after(7, 2, Some(first.id)).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_read_marker_never_moves_back() {
        let store = MemoryStore::new();
        store.set_read_marker(1, 7, 5).await.unwrap();
        store.set_read_marker(1, 7, 3).await.unwrap();
        assert_eq!(store.read_marker(1, 7).await.unwrap(), Some(5));
    }

    #[tokio::test]
    async fn test_unavailable() {
        let store = MemoryStore::new();
        store.set_available(false);
        assert!(matches!(
            store.is_member(1, 1).await,
            Err(StoreError::Unavailable { .. })
        ));
        store.set_available(true);
        assert!(!store.is_member(1, 1).await.unwrap());
    }
}
