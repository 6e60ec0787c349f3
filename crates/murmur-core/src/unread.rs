//! Per-(user, room) unread counters.
//!
//! A counter caches "messages in the room newer than the user's read
//! marker, not sent by the user". Increments and mark-read can race, so
//! each counter keeps the marker it was cleared at and ignores increments
//! for message ids at or below it. [`UnreadTracker::reconcile`] recomputes
//! the cache from the persistence store.

use std::sync::Arc;

use dashmap::DashMap;
use murmur_protocol::{MessageId, RoomId, UserId};
use serde::Serialize;
use tracing::{debug, trace};

use crate::error::StoreError;
use crate::store::{PersistenceStore, StoredMessage};

/// Unread state for one (user, room).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UnreadCounter {
    pub count: u64,
    pub last_message_id: Option<MessageId>,
    pub read_marker: Option<MessageId>,
}

impl UnreadCounter {
    fn increment(&mut self, message_id: MessageId) -> bool {
        if self.read_marker.is_some_and(|marker| message_id <= marker) {
            return false;
        }
        self.count += 1;
        self.last_message_id = Some(self.last_message_id.map_or(message_id, |id| id.max(message_id)));
        true
    }

    fn advance_marker(&mut self, marker: Option<MessageId>) {
        self.read_marker = self.read_marker.max(marker);
    }
}

/// Tracks unread counts for every (user, room).
pub struct UnreadTracker {
    counters: DashMap<(UserId, RoomId), UnreadCounter>,
    store: Arc<dyn PersistenceStore>,
}

impl UnreadTracker {
    /// Counters backed by `store` for members and read markers.
    #[must_use]
    pub fn new(store: Arc<dyn PersistenceStore>) -> Self {
        Self {
            counters: DashMap::new(),
            store,
        }
    }

    /// Count a persisted message as unread for every other room member.
    ///
    /// Returns how many counters were incremented.
    ///
    /// # Errors
    ///
    /// Returns an error if room members cannot be loaded.
    pub async fn record_message(&self, message: &StoredMessage) -> Result<usize, StoreError> {
        let members = self.store.room_members(message.room_id).await?;
        let mut incremented = 0;
        for member in members {
            if member == message.sender_id {
                continue;
            }
            let mut counter = self.counters.entry((member, message.room_id)).or_default();
            if counter.increment(message.id) {
                incremented += 1;
            }
        }
        trace!(room = message.room_id, message = message.id, incremented, "Recorded unread");
        Ok(incremented)
    }

    /// Mark everything persisted so far in the room as read.
    ///
    /// # Errors
    ///
    /// Returns an error if the latest message id cannot be read or the
    /// marker cannot be persisted.
    pub async fn mark_read(&self, user_id: UserId, room_id: RoomId) -> Result<(), StoreError> {
        let latest = self.store.latest_message_id(room_id).await?;
        if let Some(id) = latest {
            self.store.set_read_marker(user_id, room_id, id).await?;
        }

        // A message newer than `latest` may have been counted meanwhile
        let raced = {
            let mut counter = self.counters.entry((user_id, room_id)).or_default();
            counter.advance_marker(latest);
            let raced = counter.last_message_id > latest;
            if !raced {
                counter.count = 0;
            }
            debug!(user = user_id, room = room_id, marker = ?counter.read_marker, raced, "Marked read");
            raced
        };
        if raced {
            self.reconcile(user_id, room_id).await?;
        }
        Ok(())
    }

    /// Recompute a counter from the store. Returns the new count.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn reconcile(&self, user_id: UserId, room_id: RoomId) -> Result<u64, StoreError> {
        let stored_marker = self.store.read_marker(user_id, room_id).await?;
        let local_marker = self
            .counters
            .get(&(user_id, room_id))
            .and_then(|c| c.read_marker);
        let marker = stored_marker.max(local_marker);

        let count = self
            .store
            .count_messages_after(room_id, user_id, marker)
            .await?;
        let latest = self.store.latest_message_id(room_id).await?;

        let mut counter = self.counters.entry((user_id, room_id)).or_default();
        counter.advance_marker(marker);
        counter.count = count;
        if count > 0 {
            counter.last_message_id = counter.last_message_id.max(latest);
        }
        debug!(user = user_id, room = room_id, count, "Reconciled unread");
        Ok(count)
    }

    /// Reconcile every tracked counter. Returns how many counts changed.
    ///
    /// # Errors
    ///
    /// Returns the first store error; counters reconciled before it keep
    /// their new values.
    pub async fn reconcile_all(&self) -> Result<usize, StoreError> {
        let keys: Vec<(UserId, RoomId)> = self.counters.iter().map(|entry| *entry.key()).collect();
        let mut changed = 0;
        for (user_id, room_id) in keys {
            let before = self.unread(user_id, room_id);
            if self.reconcile(user_id, room_id).await? != before {
                changed += 1;
            }
        }
        Ok(changed)
    }

    /// Unread count for a user in a room.
    #[must_use]
    pub fn unread(&self, user_id: UserId, room_id: RoomId) -> u64 {
        self.counters
            .get(&(user_id, room_id))
            .map_or(0, |c| c.count)
    }

    /// Full counter state, if one exists.
    #[must_use]
    pub fn counter(&self, user_id: UserId, room_id: RoomId) -> Option<UnreadCounter> {
        self.counters.get(&(user_id, room_id)).map(|c| *c)
    }

    /// Rooms where the user has unread messages, ascending.
    #[must_use]
    pub fn rooms_with_unread(&self, user_id: UserId) -> Vec<(RoomId, UnreadCounter)> {
        let mut rooms: Vec<(RoomId, UnreadCounter)> = self
            .counters
            .iter()
            .filter(|entry| entry.key().0 == user_id && entry.count > 0)
            .map(|entry| (entry.key().1, *entry.value()))
            .collect();
        rooms.sort_unstable_by_key(|(room, _)| *room);
        rooms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, NewMessage};
    use async_trait::async_trait;
    use tokio::sync::Notify;

    async fn setup() -> (Arc<MemoryStore>, UnreadTracker) {
        let store = Arc::new(MemoryStore::new());
        for user in [1, 2, 3] {
            store.add_member(7, user).await;
        }
        let tracker = UnreadTracker::new(store.clone());
        (store, tracker)
    }

    async fn post(store: &MemoryStore, sender: UserId, content: &str) -> StoredMessage {
        store
            .create_message(NewMessage {
                room_id: 7,
                sender_id: sender,
                content: content.to_string(),
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_counts_other_senders_only() {
        let (store, tracker) = setup().await;
        for n in 0..3 {
            let message = post(&store, 1, &format!("m{n}")).await;
            assert_eq!(tracker.record_message(&message).await.unwrap(), 2);
        }

        assert_eq!(tracker.unread(1, 7), 0);
        assert_eq!(tracker.unread(2, 7), 3);
        assert_eq!(tracker.unread(3, 7), 3);
        assert_eq!(tracker.rooms_with_unread(2).len(), 1);
        assert!(tracker.rooms_with_unread(1).is_empty());
    }

    #[tokio::test]
    async fn test_mark_read_clears_and_persists_marker() {
        let (store, tracker) = setup().await;
        let last = post(&store, 1, "a").await;
        tracker.record_message(&last).await.unwrap();

        tracker.mark_read(2, 7).await.unwrap();
        assert_eq!(tracker.unread(2, 7), 0);
        assert_eq!(store.read_marker(2, 7).await.unwrap(), Some(last.id));
        assert!(tracker.rooms_with_unread(2).is_empty());
    }

    #[tokio::test]
    async fn test_stale_increment_after_mark_read_ignored() {
        let (store, tracker) = setup().await;
        let racing = post(&store, 1, "a").await;

        // Marker already covers the message whose increment arrives late
        tracker.mark_read(2, 7).await.unwrap();
        tracker.record_message(&racing).await.unwrap();
        assert_eq!(tracker.unread(2, 7), 0);
        assert_eq!(tracker.unread(3, 7), 1);

        let newer = post(&store, 1, "b").await;
        tracker.record_message(&newer).await.unwrap();
        assert_eq!(tracker.unread(2, 7), 1);
    }

    #[tokio::test]
    async fn test_reconcile_from_store() {
        let (store, tracker) = setup().await;
        let first = post(&store, 1, "a").await;
        post(&store, 3, "b").await;
        post(&store, 2, "own").await;

        store.set_read_marker(2, 7, first.id).await.unwrap();
        assert_eq!(tracker.reconcile(2, 7).await.unwrap(), 1);
        assert_eq!(tracker.unread(2, 7), 1);
        assert_eq!(tracker.counter(2, 7).unwrap().read_marker, Some(first.id));
    }

    /// Holds `set_read_marker` until released.
    struct GatedStore {
        inner: Arc<MemoryStore>,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl PersistenceStore for GatedStore {
        async fn create_message(&self, message: NewMessage) -> Result<StoredMessage, StoreError> {
            self.inner.create_message(message).await
        }

        async fn room_members(&self, room_id: RoomId) -> Result<Vec<UserId>, StoreError> {
            self.inner.room_members(room_id).await
        }

        async fn is_member(&self, user_id: UserId, room_id: RoomId) -> Result<bool, StoreError> {
            self.inner.is_member(user_id, room_id).await
        }

        async fn user_rooms(&self, user_id: UserId) -> Result<Vec<RoomId>, StoreError> {
            self.inner.user_rooms(user_id).await
        }

        async fn latest_message_id(&self, room_id: RoomId) -> Result<Option<MessageId>, StoreError> {
            self.inner.latest_message_id(room_id).await
        }

        async fn count_messages_after(
            &self,
            room_id: RoomId,
            exclude_sender: UserId,
            after: Option<MessageId>,
        ) -> Result<u64, StoreError> {
            self.inner.count_messages_after(room_id, exclude_sender, after).await
        }

        async fn set_read_marker(
            &self,
            user_id: UserId,
            room_id: RoomId,
            message_id: MessageId,
        ) -> Result<(), StoreError> {
            self.entered.notify_one();
            self.release.notified().await;
            self.inner.set_read_marker(user_id, room_id, message_id).await
        }

        async fn read_marker(
            &self,
            user_id: UserId,
            room_id: RoomId,
        ) -> Result<Option<MessageId>, StoreError> {
            self.inner.read_marker(user_id, room_id).await
        }
    }

    #[tokio::test]
    async fn test_increment_during_mark_read_survives() {
        let (store, _) = setup().await;
        let gated = Arc::new(GatedStore {
            inner: store.clone(),
            entered: Notify::new(),
            release: Notify::new(),
        });
        let tracker = Arc::new(UnreadTracker::new(gated.clone()));
        let first = post(&store, 1, "a").await;
        tracker.record_message(&first).await.unwrap();

        let marking = {
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move { tracker.mark_read(2, 7).await })
        };
        gated.entered.notified().await;
        let second = post(&store, 1, "b").await;
        tracker.record_message(&second).await.unwrap();
        gated.release.notify_one();
        marking.await.unwrap().unwrap();

        assert_eq!(store.read_marker(2, 7).await.unwrap(), Some(first.id));
        assert_eq!(tracker.unread(2, 7), 1);

        let third = post(&store, 1, "c").await;
        tracker.record_message(&third).await.unwrap();
        assert_eq!(tracker.unread(2, 7), 2);
        assert_eq!(store.count_messages_after(7, 2, Some(first.id)).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_reconcile_all_corrects_drift() {
        let (store, tracker) = setup().await;
        let first = post(&store, 1, "a").await;
        let second = post(&store, 1, "b").await;
        tracker.record_message(&first).await.unwrap();
        tracker.record_message(&second).await.unwrap();

        // Another process read up to the first message
        store.set_read_marker(2, 7, first.id).await.unwrap();
        assert_eq!(tracker.reconcile_all().await.unwrap(), 1);
        assert_eq!(tracker.unread(2, 7), 1);
        assert_eq!(tracker.unread(3, 7), 2);
        assert_eq!(tracker.reconcile_all().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_store_failure_surfaces() {
        let (store, tracker) = setup().await;
        let message = post(&store, 1, "a").await;
        store.set_available(false);
        assert!(tracker.record_message(&message).await.is_err());
        assert!(tracker.mark_read(2, 7).await.is_err());
    }
}
