//! Redis-backed presence store.
//!
//! Key layout:
//! - `user:online:{user}`: JSON [`PresenceRecord`], `SET EX` with the record TTL
//! - `room:users:{room}`: set of user ids marked in the room
//! - `room:messages:{room}`: list of JSON envelopes, newest first

use std::time::Duration;

use async_trait::async_trait;
use murmur_protocol::{Envelope, RoomId, UserId};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, info};

use super::{PresenceRecord, PresenceStore};
use crate::error::StoreError;

fn online_key(user_id: UserId) -> String {
    format!("user:online:{user_id}")
}

fn room_users_key(room_id: RoomId) -> String {
    format!("room:users:{room_id}")
}

fn room_messages_key(room_id: RoomId) -> String {
    format!("room:messages:{room_id}")
}

fn map_err(e: redis::RedisError) -> StoreError {
    StoreError::presence(format!("Redis error: {e}"))
}

fn corrupt(e: serde_json::Error) -> StoreError {
    StoreError::Corrupt {
        store: "presence",
        reason: e.to_string(),
    }
}

/// [`PresenceStore`] on Redis, shared by every process of a deployment.
#[derive(Clone)]
pub struct RedisPresenceStore {
    conn: ConnectionManager,
}

impl RedisPresenceStore {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the server is unreachable.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(map_err)?;
        let conn = ConnectionManager::new(client).await.map_err(map_err)?;
        info!("Connected to Redis presence store");
        Ok(Self { conn })
    }
}

#[async_trait]
impl PresenceStore for RedisPresenceStore {
    async fn set_online(&self, record: &PresenceRecord) -> Result<(), StoreError> {
        let value = serde_json::to_string(record).map_err(corrupt)?;
        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(online_key(record.user_id), value, record.ttl_secs)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn set_offline(&self, user_id: UserId) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(online_key(user_id)).await.map_err(map_err)?;
        Ok(())
    }

    async fn get_online(&self, user_id: UserId) -> Result<Option<PresenceRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(online_key(user_id)).await.map_err(map_err)?;
        value
            .map(|v| serde_json::from_str(&v).map_err(corrupt))
            .transpose()
    }

    async fn list_room_users(&self, room_id: RoomId) -> Result<Vec<UserId>, StoreError> {
        let mut conn = self.conn.clone();
        let marked: Vec<UserId> = redis::cmd("SMEMBERS")
            .arg(room_users_key(room_id))
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        if marked.is_empty() {
            return Ok(marked);
        }

        // Only users whose online record has not expired
        let mut pipe = redis::pipe();
        for user in &marked {
            pipe.cmd("EXISTS").arg(online_key(*user));
        }
        let live: Vec<bool> = pipe.query_async(&mut conn).await.map_err(map_err)?;

        let mut users: Vec<UserId> = marked
            .into_iter()
            .zip(live)
            .filter_map(|(user, live)| live.then_some(user))
            .collect();
        users.sort_unstable();
        Ok(users)
    }

    async fn add_user_to_room(&self, room_id: RoomId, user_id: UserId) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SADD")
            .arg(room_users_key(room_id))
            .arg(user_id)
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn remove_user_from_room(
        &self,
        room_id: RoomId,
        user_id: UserId,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SREM")
            .arg(room_users_key(room_id))
            .arg(user_id)
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn cache_message(
        &self,
        room_id: RoomId,
        message: &Envelope,
        limit: usize,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let value = serde_json::to_string(message).map_err(corrupt)?;
        let key = room_messages_key(room_id);
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .cmd("LPUSH")
            .arg(&key)
            .arg(value)
            .ignore()
            .cmd("LTRIM")
            .arg(&key)
            .arg(0)
            .arg(limit.saturating_sub(1))
            .ignore()
            .cmd("EXPIRE")
            .arg(&key)
            .arg(ttl.as_secs())
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn recent_messages(
        &self,
        room_id: RoomId,
        limit: usize,
    ) -> Result<Vec<Envelope>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let values: Vec<String> = redis::cmd("LRANGE")
            .arg(room_messages_key(room_id))
            .arg(0)
            .arg(limit - 1)
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;

        let mut messages = Vec::with_capacity(values.len());
        for value in values {
            match serde_json::from_str(&value) {
                Ok(message) => messages.push(message),
                Err(e) => debug!(room = room_id, error = %e, "Skipping corrupt cached message"),
            }
        }
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(online_key(5), "user:online:5");
        assert_eq!(room_users_key(7), "room:users:7");
        assert_eq!(room_messages_key(7), "room:messages:7");
    }
}
