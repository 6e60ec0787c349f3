//! Wires the hub, presence, unread tracking, dispatch, reconciliation and
//! delivery together under one shutdown token.

use std::sync::Arc;
use std::time::Duration;

use murmur_protocol::UserId;
use murmur_transport::{FrameSink, FrameSource};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::delivery::{BusConfig, ConsumerPool, DeliveryHandler, MessageBus};
use crate::dispatch::Dispatcher;
use crate::hub::{Hub, HubConfig, HubHandle};
use crate::presence::{PresenceConfig, PresenceHandle, PresenceStore, PresenceSync};
use crate::reconcile::run_reconciler;
use crate::session::{CloseReason, Session, SessionConfig};
use crate::store::PersistenceStore;
use crate::unread::UnreadTracker;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub hub: HubConfig,
    pub session: SessionConfig,
    pub presence: PresenceConfig,
    pub bus: BusConfig,
    /// Interval between membership and unread reconciliation passes.
    pub reconcile_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            hub: HubConfig::default(),
            session: SessionConfig::default(),
            presence: PresenceConfig::default(),
            bus: BusConfig::default(),
            reconcile_interval: Duration::from_secs(60),
        }
    }
}

/// A running hub with everything around it.
pub struct Engine {
    config: EngineConfig,
    hub: HubHandle,
    presence: PresenceHandle,
    unread: Arc<UnreadTracker>,
    dispatcher: Arc<Dispatcher>,
    bus: Option<Arc<dyn MessageBus>>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    consumers: Mutex<Vec<ConsumerPool>>,
}

impl Engine {
    /// Start the background tasks. Must be called inside a tokio runtime.
    #[must_use]
    pub fn start(
        config: EngineConfig,
        store: Arc<dyn PersistenceStore>,
        presence_store: Arc<dyn PresenceStore>,
        bus: Option<Arc<dyn MessageBus>>,
    ) -> Self {
        let shutdown = CancellationToken::new();

        let (presence, presence_task) = PresenceSync::spawn(
            config.presence.clone(),
            presence_store,
            Arc::clone(&store),
            shutdown.clone(),
        );
        let (hub, hub_task) = Hub::spawn(config.hub.clone(), presence.clone(), shutdown.clone());
        let unread = Arc::new(UnreadTracker::new(Arc::clone(&store)));
        let reconciler = tokio::spawn(run_reconciler(
            hub.clone(),
            Arc::clone(&store),
            Arc::clone(&unread),
            config.reconcile_interval,
            shutdown.clone(),
        ));

        let mut dispatcher = Dispatcher::new(hub.clone(), store, presence.clone(), Arc::clone(&unread));
        if let Some(bus) = &bus {
            dispatcher = dispatcher.with_bus(Arc::clone(bus), config.bus.message_ttl);
        }

        info!(
            outbound_capacity = config.session.outbound_capacity,
            bus = bus.is_some(),
            "Engine started"
        );

        Self {
            config,
            hub,
            presence,
            unread,
            dispatcher: Arc::new(dispatcher),
            bus,
            shutdown,
            tasks: Mutex::new(vec![presence_task, hub_task, reconciler]),
            consumers: Mutex::new(Vec::new()),
        }
    }

    /// A new session for an authenticated user.
    #[must_use]
    pub fn session(&self, user_id: UserId) -> Session {
        Session::new(
            user_id,
            self.config.session.clone(),
            Arc::clone(&self.dispatcher),
            self.presence.clone(),
            &self.shutdown,
        )
    }

    /// Run a session for `user_id` on the given transport halves.
    pub async fn serve<S, K>(&self, user_id: UserId, source: S, sink: K) -> CloseReason
    where
        S: FrameSource,
        K: FrameSink + 'static,
    {
        self.session(user_id).run(source, sink).await
    }

    /// Start a consumer pool on the bus. Returns `false` without a bus.
    pub async fn consume(&self, handler: Arc<dyn DeliveryHandler>) -> bool {
        let Some(bus) = &self.bus else {
            return false;
        };
        let pool = ConsumerPool::spawn(
            Arc::clone(bus),
            handler,
            &self.config.bus,
            self.shutdown.clone(),
        );
        self.consumers.lock().await.push(pool);
        true
    }

    /// The hub actor's handle.
    pub fn hub(&self) -> &HubHandle {
        &self.hub
    }

    /// Presence queries and events.
    pub fn presence(&self) -> &PresenceHandle {
        &self.presence
    }

    /// Unread counters, including mark-read.
    pub fn unread(&self) -> &UnreadTracker {
        &self.unread
    }

    /// The frame dispatcher shared by every session.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// The configuration the engine was started with.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// A token cancelled when the engine shuts down.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Close every session and stop the background tasks.
    pub async fn shutdown(&self) {
        info!("Engine shutting down");
        self.shutdown.cancel();

        for pool in self.consumers.lock().await.drain(..) {
            pool.join().await;
        }
        for task in self.tasks.lock().await.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "Engine task ended abnormally");
            }
        }
        info!("Engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::{BusMessage, DeliveryError, MemoryBus};
    use crate::presence::MemoryPresenceStore;
    use crate::session::ConnectionId;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use murmur_protocol::{ClientFrame, ServerFrame};
    use murmur_transport::memory::{pair, MemoryClient, ServerEvent};
    use tokio::sync::mpsc;

    async fn engine() -> (Arc<Engine>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        store.add_member(7, 1).await;
        store.add_member(7, 2).await;
        let engine = Engine::start(
            EngineConfig::default(),
            store.clone(),
            Arc::new(MemoryPresenceStore::new()),
            Some(Arc::new(MemoryBus::new())),
        );
        (Arc::new(engine), store)
    }

    fn connect(engine: &Arc<Engine>, user: UserId) -> (MemoryClient, JoinHandle<CloseReason>) {
        let (source, sink, client) = pair(64);
        let engine = Arc::clone(engine);
        let task = tokio::spawn(async move { engine.serve(user, source, sink).await });
        (client, task)
    }

    async fn join(client: &mut MemoryClient, room: u64) {
        client.send(&ClientFrame::join(room)).await.unwrap();
        assert!(matches!(
            client.next_frame().await,
            Some(ServerFrame::RoomJoined { room_id, .. }) if room_id == room
        ));
    }

    #[tokio::test]
    async fn test_two_users_chat_in_room() {
        let (engine, store) = engine().await;
        let (mut alice, alice_task) = connect(&engine, 1);
        let (mut bob, _bob_task) = connect(&engine, 2);
        join(&mut alice, 7).await;
        join(&mut bob, 7).await;

        alice.send(&ClientFrame::message(7, "hi")).await.unwrap();

        for client in [&mut alice, &mut bob] {
            match client.next_frame().await {
                Some(ServerFrame::NewMessage { room_id, sender_id, content, .. }) => {
                    assert_eq!(room_id, 7);
                    assert_eq!(sender_id, 1);
                    assert_eq!(content, "hi");
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert!(bob.try_recv().is_none());
        assert_eq!(store.messages(7).await.len(), 1);
        assert_eq!(engine.unread().unread(2, 7), 1);
        assert_eq!(engine.unread().unread(1, 7), 0);

        alice.disconnect();
        assert_eq!(alice_task.await.unwrap(), CloseReason::ClientClosed);
        assert_eq!(engine.hub().room_users(7).await, vec![2]);

        engine.presence().flush().await;
        assert!(!engine.presence().is_online(1).await.unwrap());
        assert!(engine.presence().is_online(2).await.unwrap());
    }

    #[tokio::test]
    async fn test_malformed_frame_keeps_connection() {
        let (engine, _store) = engine().await;
        let (mut client, _task) = connect(&engine, 1);

        client.send_text("{not json").await.unwrap();
        assert!(matches!(
            client.next_frame().await,
            Some(ServerFrame::Error { room_id: None, .. })
        ));

        client.send(&ClientFrame::message(7, "early")).await.unwrap();
        match client.next_frame().await {
            Some(ServerFrame::Error { room_id, message, .. }) => {
                assert_eq!(room_id, Some(7));
                assert!(message.contains("Not a member"));
            }
            other => panic!("unexpected {other:?}"),
        }

        join(&mut client, 7).await;
    }

    #[tokio::test]
    async fn test_join_denied_for_non_member() {
        let (engine, _store) = engine().await;
        let (mut client, _task) = connect(&engine, 3);
        client.send(&ClientFrame::join(7)).await.unwrap();
        assert!(matches!(
            client.next_frame().await,
            Some(ServerFrame::Error { room_id: Some(7), .. })
        ));
        assert!(engine.hub().rooms().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_client_times_out() {
        let (engine, _store) = engine().await;
        let (mut client, task) = connect(&engine, 1);

        assert_eq!(task.await.unwrap(), CloseReason::HeartbeatTimeout);
        assert_eq!(client.recv().await, Some(ServerEvent::Ping));
        assert_eq!(client.recv().await, Some(ServerEvent::Close));
        assert_eq!(engine.hub().stats().await.sessions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pongs_keep_session_alive() {
        let (engine, _store) = engine().await;
        let (mut client, task) = connect(&engine, 1);

        for _ in 0..3 {
            assert_eq!(client.recv().await, Some(ServerEvent::Ping));
            client.pong().await.unwrap();
        }
        assert!(!task.is_finished());

        engine.shutdown().await;
        assert_eq!(task.await.unwrap(), CloseReason::Shutdown);
    }

    #[tokio::test]
    async fn test_transport_error_unregisters() {
        let (engine, store) = engine().await;
        let (mut client, task) = connect(&engine, 1);
        join(&mut client, 7).await;

        client.fail("connection reset").await.unwrap();
        assert_eq!(task.await.unwrap(), CloseReason::TransportError);
        assert!(engine.hub().rooms().await.is_empty());
        // Local eviction never touches persisted membership
        assert!(store.is_member(1, 7).await.unwrap());
        assert_eq!(store.room_members(7).await.unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_reconnect_keeps_successor_registered() {
        let (engine, _store) = engine().await;
        let conn = ConnectionId::new("dup");

        let (source, sink, mut first) = pair(64);
        let first_task = tokio::spawn(engine.session(1).with_connection_id(conn.clone()).run(source, sink));
        join(&mut first, 7).await;

        let (source, sink, mut second) = pair(64);
        let second_task = tokio::spawn(engine.session(1).with_connection_id(conn.clone()).run(source, sink));
        join(&mut second, 7).await;

        assert_eq!(first_task.await.unwrap(), CloseReason::Superseded);
        assert!(engine.hub().is_registered(&conn).await);
        assert!(engine.hub().is_in_room(&conn, 7).await);

        second.send(&ClientFrame::message(7, "still here")).await.unwrap();
        assert!(matches!(
            second.next_frame().await,
            Some(ServerFrame::NewMessage { sender_id: 1, .. })
        ));
        assert!(!second_task.is_finished());

        engine.shutdown().await;
        assert_eq!(second_task.await.unwrap(), CloseReason::Shutdown);
    }

    struct Forward(mpsc::UnboundedSender<BusMessage>);

    #[async_trait]
    impl DeliveryHandler for Forward {
        async fn handle(&self, message: &BusMessage) -> Result<(), DeliveryError> {
            self.0
                .send(message.clone())
                .map_err(|e| DeliveryError::Handler(e.to_string()))
        }
    }

    #[tokio::test]
    async fn test_messages_reach_bus_consumers() {
        let (engine, _store) = engine().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        assert!(engine.consume(Arc::new(Forward(tx))).await);

        let (mut client, _task) = connect(&engine, 1);
        join(&mut client, 7).await;
        client.send(&ClientFrame::message(7, "hello bus")).await.unwrap();

        let message = rx.recv().await.unwrap();
        assert_eq!(message.room_id, 7);
        assert_eq!(message.content, serde_json::json!("hello bus"));

        engine.shutdown().await;
    }
}
