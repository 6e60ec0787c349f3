//! Inbound frame dispatch.

use std::sync::Arc;
use std::time::Duration;

use murmur_protocol::{ClientFrame, Envelope, ProtocolError, RoomId, ServerFrame, UserId};
use tracing::{debug, warn};

use crate::delivery::{BusMessage, MessageBus};
use crate::error::ChatError;
use crate::hub::HubHandle;
use crate::presence::PresenceHandle;
use crate::session::ConnectionId;
use crate::store::{NewMessage, PersistenceStore};
use crate::unread::UnreadTracker;

/// Routes decoded client frames to the hub, the stores and the bus.
pub struct Dispatcher {
    hub: HubHandle,
    store: Arc<dyn PersistenceStore>,
    presence: PresenceHandle,
    unread: Arc<UnreadTracker>,
    bus: Option<Arc<dyn MessageBus>>,
    bus_ttl: Duration,
}

impl Dispatcher {
    /// A dispatcher without a bus. See [`with_bus`](Dispatcher::with_bus).
    #[must_use]
    pub fn new(
        hub: HubHandle,
        store: Arc<dyn PersistenceStore>,
        presence: PresenceHandle,
        unread: Arc<UnreadTracker>,
    ) -> Self {
        Self {
            hub,
            store,
            presence,
            unread,
            bus: None,
            bus_ttl: Duration::from_secs(30),
        }
    }

    /// Publish every persisted message to `bus` with the given TTL.
    #[must_use]
    pub fn with_bus(mut self, bus: Arc<dyn MessageBus>, ttl: Duration) -> Self {
        self.bus = Some(bus);
        self.bus_ttl = ttl;
        self
    }

    /// The hub this dispatcher routes through.
    pub fn hub(&self) -> &HubHandle {
        &self.hub
    }

    /// Handle one frame from a session.
    ///
    /// # Errors
    ///
    /// Protocol errors are meant to be answered with an error frame; store
    /// and hub errors are surfaced as-is.
    pub async fn dispatch(
        &self,
        connection_id: &ConnectionId,
        user_id: UserId,
        frame: ClientFrame,
    ) -> Result<(), ChatError> {
        match frame {
            ClientFrame::JoinRoom { room_id } => self.join(connection_id, user_id, room_id).await,
            ClientFrame::LeaveRoom { room_id } => self.leave(connection_id, room_id).await,
            ClientFrame::Message { room_id, content } => {
                self.message(connection_id, user_id, room_id, content).await
            }
            ClientFrame::Unknown { kind } => Err(ProtocolError::UnknownType(kind).into()),
        }
    }

    /// Queue a frame for one session.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is gone or was evicted.
    pub async fn reply(&self, connection_id: &ConnectionId, frame: ServerFrame) -> Result<(), ChatError> {
        self.hub.deliver(connection_id, Arc::new(frame)).await
    }

    async fn join(
        &self,
        connection_id: &ConnectionId,
        user_id: UserId,
        room_id: RoomId,
    ) -> Result<(), ChatError> {
        if !self.store.is_member(user_id, room_id).await? {
            debug!(connection = %connection_id, user = user_id, room = room_id, "Join denied");
            return Err(ProtocolError::JoinDenied(room_id).into());
        }
        self.hub.join_room(connection_id, room_id).await?;
        self.reply(connection_id, ServerFrame::room_joined(room_id)).await
    }

    async fn leave(&self, connection_id: &ConnectionId, room_id: RoomId) -> Result<(), ChatError> {
        self.hub.leave_room(connection_id, room_id).await?;
        self.reply(connection_id, ServerFrame::room_left(room_id)).await
    }

    async fn message(
        &self,
        connection_id: &ConnectionId,
        user_id: UserId,
        room_id: RoomId,
        content: String,
    ) -> Result<(), ChatError> {
        if !self.hub.is_in_room(connection_id, room_id).await {
            return Err(ProtocolError::NotRoomMember(room_id).into());
        }

        let stored = self
            .store
            .create_message(NewMessage {
                room_id,
                sender_id: user_id,
                content,
            })
            .await?;

        let frame = Arc::new(ServerFrame::NewMessage {
            message_id: stored.id,
            room_id,
            sender_id: user_id,
            content: stored.content.clone(),
            time: stored.created_at,
        });
        let report = self.hub.broadcast(room_id, Arc::clone(&frame)).await?;
        debug!(
            room = room_id,
            message = stored.id,
            delivered = report.delivered,
            evicted = report.evicted.len(),
            "Message broadcast"
        );

        self.presence.cache_message(room_id, Envelope::from(&*frame));

        if let Err(e) = self.unread.record_message(&stored).await {
            warn!(room = room_id, message = stored.id, error = %e, "Unread update failed");
        }

        if let Some(bus) = &self.bus {
            if let Err(e) = bus.publish(BusMessage::from_stored(&stored), self.bus_ttl).await {
                warn!(room = room_id, message = stored.id, error = %e, "Publish to bus failed");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::MemoryBus;
    use crate::hub::{Hub, HubConfig};
    use crate::presence::{MemoryPresenceStore, PresenceConfig, PresenceSync};
    use crate::session::{SessionCloser, SessionHandle};
    use crate::store::MemoryStore;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        dispatcher: Dispatcher,
        store: Arc<MemoryStore>,
        bus: Arc<MemoryBus>,
        presence: PresenceHandle,
        _shutdown: CancellationToken,
    }

    async fn fixture() -> Fixture {
        let shutdown = CancellationToken::new();
        let store = Arc::new(MemoryStore::new());
        store.add_member(7, 1).await;
        store.add_member(7, 2).await;

        let (presence, _) = PresenceSync::spawn(
            PresenceConfig::default(),
            Arc::new(MemoryPresenceStore::new()),
            store.clone(),
            shutdown.clone(),
        );
        let (hub, _) = Hub::spawn(HubConfig::default(), presence.clone(), shutdown.clone());
        let unread = Arc::new(UnreadTracker::new(store.clone()));
        let bus = Arc::new(MemoryBus::new());
        let dispatcher = Dispatcher::new(hub, store.clone(), presence.clone(), unread)
            .with_bus(bus.clone(), Duration::from_secs(30));

        Fixture {
            dispatcher,
            store,
            bus,
            presence,
            _shutdown: shutdown,
        }
    }

    async fn connect(
        f: &Fixture,
        id: &str,
        user: UserId,
    ) -> (ConnectionId, mpsc::Receiver<Arc<ServerFrame>>) {
        let conn = ConnectionId::new(id);
        let closer = SessionCloser::new(&CancellationToken::new());
        let (handle, rx) = SessionHandle::new(conn.clone(), user, 32, closer);
        f.dispatcher.hub().register(handle).await.unwrap();
        (conn, rx)
    }

    #[tokio::test]
    async fn test_join_requires_membership() {
        let f = fixture().await;
        let (conn, mut rx) = connect(&f, "a", 1).await;
        let (outsider, _rx) = connect(&f, "x", 9).await;

        f.dispatcher.dispatch(&conn, 1, ClientFrame::join(7)).await.unwrap();
        assert!(matches!(&*rx.recv().await.unwrap(), ServerFrame::RoomJoined { room_id: 7, .. }));

        let err = f
            .dispatcher
            .dispatch(&outsider, 9, ClientFrame::join(7))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Protocol(ProtocolError::JoinDenied(7))));
        assert!(!f.dispatcher.hub().is_in_room(&outsider, 7).await);
    }

    #[tokio::test]
    async fn test_message_requires_joined_room() {
        let f = fixture().await;
        let (conn, _rx) = connect(&f, "a", 1).await;
        let err = f
            .dispatcher
            .dispatch(&conn, 1, ClientFrame::message(7, "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Protocol(ProtocolError::NotRoomMember(7))));
        assert!(f.store.messages(7).await.is_empty());
    }

    #[tokio::test]
    async fn test_message_persisted_broadcast_and_published() {
        let f = fixture().await;
        let (a, mut rx_a) = connect(&f, "a", 1).await;
        let (b, mut rx_b) = connect(&f, "b", 2).await;
        for (conn, user) in [(&a, 1), (&b, 2)] {
            f.dispatcher.dispatch(conn, user, ClientFrame::join(7)).await.unwrap();
        }
        rx_a.recv().await.unwrap();
        rx_b.recv().await.unwrap();

        f.dispatcher.dispatch(&a, 1, ClientFrame::message(7, "hi")).await.unwrap();

        let stored = f.store.messages(7).await;
        assert_eq!(stored.len(), 1);
        for rx in [&mut rx_a, &mut rx_b] {
            match &*rx.recv().await.unwrap() {
                ServerFrame::NewMessage { message_id, sender_id, content, .. } => {
                    assert_eq!(*message_id, stored[0].id);
                    assert_eq!(*sender_id, 1);
                    assert_eq!(content, "hi");
                }
                other => panic!("unexpected frame {other:?}"),
            }
        }

        assert_eq!(f.bus.stats().await.pending, 1);
        f.presence.flush().await;
        assert_eq!(f.presence.recent_messages(7, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_leave_confirms() {
        let f = fixture().await;
        let (conn, mut rx) = connect(&f, "a", 1).await;
        f.dispatcher.dispatch(&conn, 1, ClientFrame::join(7)).await.unwrap();
        f.dispatcher.dispatch(&conn, 1, ClientFrame::leave(7)).await.unwrap();

        rx.recv().await.unwrap();
        assert!(matches!(&*rx.recv().await.unwrap(), ServerFrame::RoomLeft { room_id: 7, .. }));
        assert!(!f.dispatcher.hub().is_in_room(&conn, 7).await);
    }

    #[tokio::test]
    async fn test_unknown_type_and_store_outage() {
        let f = fixture().await;
        let (conn, _rx) = connect(&f, "a", 1).await;

        let err = f
            .dispatcher
            .dispatch(&conn, 1, ClientFrame::Unknown { kind: "typing".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Protocol(ProtocolError::UnknownType(_))));

        f.store.set_available(false);
        let err = f
            .dispatcher
            .dispatch(&conn, 1, ClientFrame::join(7))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::StoreUnavailable(_)));
    }
}
