//! The hub: session registry and room index.
//!
//! All mutations go through a single actor task fed by a bounded request
//! channel, so every registry change and every broadcast is applied in one
//! total order. The actor mirrors each change into a read-only directory
//! behind an `RwLock` before replying, which lets membership queries run
//! without a round trip through the actor.
//!
//! Enqueueing never waits: a session whose outbound queue is full is
//! evicted on the spot. It is removed from every room, its queue is
//! closed, and its tasks are told to stop.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use murmur_protocol::{RoomId, ServerFrame, UserId};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::ChatError;
use crate::presence::PresenceHandle;
use crate::session::{CloseReason, ConnectionId, EnqueueError, SessionCloser, SessionHandle};

/// Hub errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HubError {
    /// The actor has stopped.
    #[error("Hub is not running")]
    Closed,

    /// The connection is not registered.
    #[error("Unknown session: {0}")]
    UnknownSession(ConnectionId),
}

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Capacity of the actor's request channel.
    pub request_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            request_capacity: 1024,
        }
    }
}

/// Hub statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubStats {
    /// Registered sessions.
    pub sessions: usize,
    /// Rooms with at least one member.
    pub rooms: usize,
    /// Total (session, room) memberships.
    pub memberships: usize,
    /// Sessions evicted for a full outbound queue since start.
    pub evictions: u64,
}

/// Result of a broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Sessions the frame was queued for.
    pub delivered: usize,
    /// Sessions evicted during this broadcast.
    pub evicted: Vec<ConnectionId>,
}

enum Delivery {
    Queued,
    Evicted,
    Unknown,
}

enum Request {
    Register {
        session: SessionHandle,
        reply: oneshot::Sender<bool>,
    },
    Unregister {
        connection_id: ConnectionId,
        owner: Option<SessionCloser>,
        reason: CloseReason,
        reply: oneshot::Sender<bool>,
    },
    Join {
        connection_id: ConnectionId,
        room_id: RoomId,
        reply: oneshot::Sender<Result<bool, HubError>>,
    },
    Leave {
        connection_id: ConnectionId,
        room_id: RoomId,
        reply: oneshot::Sender<Result<bool, HubError>>,
    },
    Broadcast {
        room_id: RoomId,
        frame: Arc<ServerFrame>,
        reply: oneshot::Sender<BroadcastReport>,
    },
    Deliver {
        connection_id: ConnectionId,
        frame: Arc<ServerFrame>,
        reply: oneshot::Sender<Delivery>,
    },
}

enum Change {
    Insert(ConnectionId, UserId),
    Remove(ConnectionId),
    Join(ConnectionId, RoomId),
    Leave(ConnectionId, RoomId),
}

/// Session and room index. Empty rooms are never kept.
#[derive(Debug, Default)]
struct Directory {
    users: HashMap<ConnectionId, UserId>,
    session_rooms: HashMap<ConnectionId, HashSet<RoomId>>,
    rooms: HashMap<RoomId, HashSet<ConnectionId>>,
}

impl Directory {
    /// Apply a change. Returns whether anything changed.
    fn apply(&mut self, change: &Change) -> bool {
        match change {
            Change::Insert(conn, user) => {
                self.session_rooms.entry(conn.clone()).or_default();
                self.users.insert(conn.clone(), *user).is_none()
            }
            Change::Remove(conn) => {
                for room in self.session_rooms.remove(conn).unwrap_or_default() {
                    self.unindex(conn, room);
                }
                self.users.remove(conn).is_some()
            }
            Change::Join(conn, room) => {
                let inserted = self
                    .session_rooms
                    .get_mut(conn)
                    .is_some_and(|rooms| rooms.insert(*room));
                if inserted {
                    self.rooms.entry(*room).or_default().insert(conn.clone());
                }
                inserted
            }
            Change::Leave(conn, room) => {
                let removed = self
                    .session_rooms
                    .get_mut(conn)
                    .is_some_and(|rooms| rooms.remove(room));
                if removed {
                    self.unindex(conn, *room);
                }
                removed
            }
        }
    }

    fn unindex(&mut self, conn: &ConnectionId, room: RoomId) {
        if let Some(members) = self.rooms.get_mut(&room) {
            members.remove(conn);
            if members.is_empty() {
                self.rooms.remove(&room);
            }
        }
    }

    fn rooms_of(&self, conn: &ConnectionId) -> Vec<RoomId> {
        let mut rooms: Vec<RoomId> = self
            .session_rooms
            .get(conn)
            .map(|rooms| rooms.iter().copied().collect())
            .unwrap_or_default();
        rooms.sort_unstable();
        rooms
    }

    fn clear(&mut self) {
        self.users.clear();
        self.session_rooms.clear();
        self.rooms.clear();
    }
}

/// Starts the hub actor.
pub struct Hub;

impl Hub {
    /// Spawn the actor. It stops when `shutdown` is cancelled or every
    /// [`HubHandle`] is dropped, closing all sessions still registered.
    #[must_use]
    pub fn spawn(
        config: HubConfig,
        presence: PresenceHandle,
        shutdown: CancellationToken,
    ) -> (HubHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.request_capacity.max(1));
        let snapshot = Arc::new(RwLock::new(Directory::default()));
        let evictions = Arc::new(AtomicU64::new(0));

        let actor = HubActor {
            rx,
            sessions: HashMap::new(),
            directory: Directory::default(),
            snapshot: Arc::clone(&snapshot),
            presence,
            evictions: Arc::clone(&evictions),
        };
        let task = tokio::spawn(actor.run(shutdown));

        (
            HubHandle {
                tx,
                snapshot,
                evictions,
            },
            task,
        )
    }
}

struct HubActor {
    rx: mpsc::Receiver<Request>,
    sessions: HashMap<ConnectionId, SessionHandle>,
    directory: Directory,
    snapshot: Arc<RwLock<Directory>>,
    presence: PresenceHandle,
    evictions: Arc<AtomicU64>,
}

impl HubActor {
    async fn run(mut self, shutdown: CancellationToken) {
        info!("Hub started");
        loop {
            let request = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                request = self.rx.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };
            self.handle(request).await;
        }

        self.rx.close();
        let remaining: Vec<ConnectionId> = self.sessions.keys().cloned().collect();
        for conn in &remaining {
            self.remove_session(conn, CloseReason::Shutdown).await;
        }
        self.snapshot.write().await.clear();
        info!(closed = remaining.len(), "Hub stopped");
    }

    async fn handle(&mut self, request: Request) {
        match request {
            Request::Register { session, reply } => {
                let superseded = self.register(session).await;
                let _ = reply.send(superseded);
            }
            Request::Unregister {
                connection_id,
                owner,
                reason,
                reply,
            } => {
                let owned = match &owner {
                    Some(owner) => self
                        .sessions
                        .get(&connection_id)
                        .is_some_and(|handle| handle.is_owned_by(owner)),
                    None => true,
                };
                let removed = owned && self.remove_session(&connection_id, reason).await;
                let _ = reply.send(removed);
            }
            Request::Join {
                connection_id,
                room_id,
                reply,
            } => {
                let result = self.join(connection_id, room_id).await;
                let _ = reply.send(result);
            }
            Request::Leave {
                connection_id,
                room_id,
                reply,
            } => {
                let result = self.leave(connection_id, room_id).await;
                let _ = reply.send(result);
            }
            Request::Broadcast {
                room_id,
                frame,
                reply,
            } => {
                let report = self.broadcast(room_id, frame).await;
                let _ = reply.send(report);
            }
            Request::Deliver {
                connection_id,
                frame,
                reply,
            } => {
                let outcome = self.deliver(&connection_id, frame).await;
                let _ = reply.send(outcome);
            }
        }
    }

    /// Apply a change locally and mirror it into the read snapshot.
    async fn commit(&mut self, change: Change) -> bool {
        let changed = self.directory.apply(&change);
        if changed {
            self.snapshot.write().await.apply(&change);
        }
        changed
    }

    async fn register(&mut self, session: SessionHandle) -> bool {
        let conn = session.connection_id().clone();
        let user = session.user_id();

        let superseded = self.remove_session(&conn, CloseReason::Superseded).await;
        if superseded {
            debug!(connection = %conn, "Registration superseded existing session");
        }

        self.sessions.insert(conn.clone(), session);
        self.commit(Change::Insert(conn.clone(), user)).await;
        self.presence.connected(user, conn.clone());
        debug!(connection = %conn, user, "Session registered");
        superseded
    }

    /// Remove a session from every room, then close its queue.
    async fn remove_session(&mut self, conn: &ConnectionId, reason: CloseReason) -> bool {
        let Some(handle) = self.sessions.remove(conn) else {
            return false;
        };

        let rooms = self.directory.rooms_of(conn);
        self.commit(Change::Remove(conn.clone())).await;

        handle.close(reason);
        let user = handle.user_id();
        drop(handle);

        self.presence.disconnected(user, conn.clone(), rooms);
        debug!(connection = %conn, user, reason = %reason, "Session unregistered");
        true
    }

    async fn join(&mut self, conn: ConnectionId, room: RoomId) -> Result<bool, HubError> {
        let Some(user) = self.sessions.get(&conn).map(SessionHandle::user_id) else {
            return Err(HubError::UnknownSession(conn));
        };
        let joined = self.commit(Change::Join(conn.clone(), room)).await;
        if joined {
            self.presence.joined(user, room);
            debug!(connection = %conn, room, "Joined room");
        }
        Ok(joined)
    }

    async fn leave(&mut self, conn: ConnectionId, room: RoomId) -> Result<bool, HubError> {
        let Some(user) = self.sessions.get(&conn).map(SessionHandle::user_id) else {
            return Err(HubError::UnknownSession(conn));
        };
        let left = self.commit(Change::Leave(conn.clone(), room)).await;
        if left {
            self.presence.left(user, room);
            debug!(connection = %conn, room, "Left room");
        }
        Ok(left)
    }

    async fn broadcast(&mut self, room: RoomId, frame: Arc<ServerFrame>) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let mut failed = Vec::new();

        if let Some(members) = self.directory.rooms.get(&room) {
            for conn in members {
                let Some(handle) = self.sessions.get(conn) else {
                    continue;
                };
                match handle.try_enqueue(Arc::clone(&frame)) {
                    Ok(()) => report.delivered += 1,
                    Err(e) => failed.push((conn.clone(), e)),
                }
            }
        }

        for (conn, error) in failed {
            self.evict(&conn, error).await;
            report.evicted.push(conn);
        }

        trace!(room, delivered = report.delivered, evicted = report.evicted.len(), "Broadcast");
        report
    }

    async fn deliver(&mut self, conn: &ConnectionId, frame: Arc<ServerFrame>) -> Delivery {
        let Some(handle) = self.sessions.get(conn) else {
            return Delivery::Unknown;
        };
        match handle.try_enqueue(frame) {
            Ok(()) => Delivery::Queued,
            Err(e) => {
                self.evict(conn, e).await;
                Delivery::Evicted
            }
        }
    }

    async fn evict(&mut self, conn: &ConnectionId, error: EnqueueError) {
        let reason = match error {
            EnqueueError::Full => {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                warn!(connection = %conn, "Outbound queue full, evicting session");
                CloseReason::SlowConsumer
            }
            EnqueueError::Closed => {
                debug!(connection = %conn, "Outbound queue closed, removing session");
                CloseReason::WriteFailed
            }
        };
        self.remove_session(conn, reason).await;
    }
}

/// Cloneable handle to the hub actor.
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<Request>,
    snapshot: Arc<RwLock<Directory>>,
    evictions: Arc<AtomicU64>,
}

impl HubHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Request,
    ) -> Result<T, HubError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| HubError::Closed)?;
        rx.await.map_err(|_| HubError::Closed)
    }

    /// Register a session. Returns `true` if it replaced a session with
    /// the same connection id.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the actor has stopped.
    pub async fn register(&self, session: SessionHandle) -> Result<bool, HubError> {
        self.request(|reply| Request::Register { session, reply })
            .await
    }

    /// Unregister a session. Returns `false` if it was not registered.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the actor has stopped.
    pub async fn unregister(
        &self,
        connection_id: &ConnectionId,
        reason: CloseReason,
    ) -> Result<bool, HubError> {
        let connection_id = connection_id.clone();
        self.request(|reply| Request::Unregister {
            connection_id,
            owner: None,
            reason,
            reply,
        })
        .await
    }

    /// Unregister a session only if the registration under `connection_id`
    /// still belongs to `closer`. A newer registration that superseded it
    /// is left alone.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the actor has stopped.
    pub async fn release(
        &self,
        connection_id: &ConnectionId,
        closer: &SessionCloser,
        reason: CloseReason,
    ) -> Result<bool, HubError> {
        let connection_id = connection_id.clone();
        let owner = Some(closer.clone());
        self.request(|reply| Request::Unregister {
            connection_id,
            owner,
            reason,
            reply,
        })
        .await
    }

    /// Add a session to a room. Returns `false` if it was already a member.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is unknown or the actor has stopped.
    pub async fn join_room(
        &self,
        connection_id: &ConnectionId,
        room_id: RoomId,
    ) -> Result<bool, HubError> {
        let connection_id = connection_id.clone();
        self.request(|reply| Request::Join {
            connection_id,
            room_id,
            reply,
        })
        .await?
    }

    /// Remove a session from a room. Returns `false` if it was not a member.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is unknown or the actor has stopped.
    pub async fn leave_room(
        &self,
        connection_id: &ConnectionId,
        room_id: RoomId,
    ) -> Result<bool, HubError> {
        let connection_id = connection_id.clone();
        self.request(|reply| Request::Leave {
            connection_id,
            room_id,
            reply,
        })
        .await?
    }

    /// Queue a frame for every session in a room.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the actor has stopped.
    pub async fn broadcast(
        &self,
        room_id: RoomId,
        frame: Arc<ServerFrame>,
    ) -> Result<BroadcastReport, HubError> {
        self.request(|reply| Request::Broadcast {
            room_id,
            frame,
            reply,
        })
        .await
    }

    /// Queue a frame for one session.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Capacity`] if the session was evicted by this
    /// delivery, or a [`HubError`] if it is unknown or the actor stopped.
    pub async fn deliver(
        &self,
        connection_id: &ConnectionId,
        frame: Arc<ServerFrame>,
    ) -> Result<(), ChatError> {
        let conn = connection_id.clone();
        let outcome = self
            .request(|reply| Request::Deliver {
                connection_id: conn,
                frame,
                reply,
            })
            .await?;
        match outcome {
            Delivery::Queued => Ok(()),
            Delivery::Evicted => Err(ChatError::Capacity(connection_id.clone())),
            Delivery::Unknown => Err(HubError::UnknownSession(connection_id.clone()).into()),
        }
    }

    /// Sessions currently in a room, with their users.
    pub async fn room_sessions(&self, room_id: RoomId) -> Vec<(ConnectionId, UserId)> {
        let dir = self.snapshot.read().await;
        let mut sessions: Vec<(ConnectionId, UserId)> = dir
            .rooms
            .get(&room_id)
            .into_iter()
            .flatten()
            .filter_map(|conn| dir.users.get(conn).map(|user| (conn.clone(), *user)))
            .collect();
        sessions.sort();
        sessions
    }

    /// Distinct users with a session in a room.
    pub async fn room_users(&self, room_id: RoomId) -> Vec<UserId> {
        let mut users: Vec<UserId> = self
            .room_sessions(room_id)
            .await
            .into_iter()
            .map(|(_, user)| user)
            .collect();
        users.sort_unstable();
        users.dedup();
        users
    }

    /// Whether a session is in a room.
    pub async fn is_in_room(&self, connection_id: &ConnectionId, room_id: RoomId) -> bool {
        self.snapshot
            .read()
            .await
            .rooms
            .get(&room_id)
            .is_some_and(|members| members.contains(connection_id))
    }

    /// Rooms a session has joined, ascending.
    pub async fn session_rooms(&self, connection_id: &ConnectionId) -> Vec<RoomId> {
        self.snapshot.read().await.rooms_of(connection_id)
    }

    /// Whether a connection id is registered.
    pub async fn is_registered(&self, connection_id: &ConnectionId) -> bool {
        self.snapshot.read().await.users.contains_key(connection_id)
    }

    /// Every room with at least one session, ascending.
    pub async fn rooms(&self) -> Vec<RoomId> {
        let mut rooms: Vec<RoomId> = self.snapshot.read().await.rooms.keys().copied().collect();
        rooms.sort_unstable();
        rooms
    }

    /// Current statistics.
    pub async fn stats(&self) -> HubStats {
        let dir = self.snapshot.read().await;
        HubStats {
            sessions: dir.users.len(),
            rooms: dir.rooms.len(),
            memberships: dir.rooms.values().map(HashSet::len).sum(),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    /// Whether the actor has stopped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
