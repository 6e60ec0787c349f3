//! Client sessions.
//!
//! A [`Session`] owns one transport connection. It registers a
//! [`SessionHandle`] with the hub, then runs three concurrent parts:
//!
//! - the inbound loop, which decodes frames and hands them to the
//!   [`Dispatcher`](crate::dispatch::Dispatcher)
//! - the outbound task, which drains the bounded outbound queue to the
//!   transport and sends heartbeat pings
//! - the liveness [`Watchdog`](crate::heartbeat::Watchdog)
//!
//! Whichever part fails first closes the [`SessionCloser`]; the others
//! observe it and the session unregisters from the hub exactly once.

use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use murmur_protocol::{ProtocolError, RoomId, ServerFrame, UserId};
use murmur_transport::{FrameSink, FrameSource, Incoming};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatch::Dispatcher;
use crate::error::ChatError;
use crate::heartbeat::Liveness;
use crate::hub::HubError;
use crate::presence::PresenceHandle;

/// Unique connection identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Create a new connection ID from a string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a new random connection ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Transport accepted, not yet registered.
    Connecting,
    /// Registered and exchanging frames.
    Active,
    /// Unregistered, flushing what is left in the outbound queue.
    Draining,
    /// Transport closed.
    Closed,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The client closed the connection.
    ClientClosed,
    /// A read failed.
    TransportError,
    /// A write failed or timed out.
    WriteFailed,
    /// No frame or heartbeat response within the read deadline.
    HeartbeatTimeout,
    /// The outbound queue overflowed.
    SlowConsumer,
    /// A newer registration took over the connection id.
    Superseded,
    /// The hub or the process is shutting down.
    Shutdown,
}

impl CloseReason {
    /// Short label for logs and metrics.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::ClientClosed => "client_closed",
            CloseReason::TransportError => "transport_error",
            CloseReason::WriteFailed => "write_failed",
            CloseReason::HeartbeatTimeout => "heartbeat_timeout",
            CloseReason::SlowConsumer => "slow_consumer",
            CloseReason::Superseded => "superseded",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared close signal for one session.
///
/// The first reason recorded wins. Closing the parent token (engine
/// shutdown) closes every session with [`CloseReason::Shutdown`].
#[derive(Debug, Clone)]
pub struct SessionCloser {
    token: CancellationToken,
    reason: Arc<OnceLock<CloseReason>>,
}

impl SessionCloser {
    /// Create a closer that also fires when `parent` is cancelled.
    #[must_use]
    pub fn new(parent: &CancellationToken) -> Self {
        Self {
            token: parent.child_token(),
            reason: Arc::new(OnceLock::new()),
        }
    }

    /// Close the session, recording `reason` if none was recorded yet.
    pub fn close(&self, reason: CloseReason) {
        let _ = self.reason.set(reason);
        self.token.cancel();
    }

    /// Whether the session has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The recorded reason, or `Shutdown` if closed from the parent.
    #[must_use]
    pub fn reason(&self) -> CloseReason {
        self.reason.get().copied().unwrap_or(CloseReason::Shutdown)
    }

    /// Wait until the session is closed.
    pub async fn closed(&self) {
        self.token.cancelled().await;
    }

    /// Whether both closers belong to the same session.
    #[must_use]
    pub fn same_session(&self, other: &SessionCloser) -> bool {
        Arc::ptr_eq(&self.reason, &other.reason)
    }
}

/// Why an enqueue was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EnqueueError {
    Full,
    Closed,
}

/// The hub's side of a session.
///
/// Holds the only sender of the session's outbound queue: dropping the
/// handle closes the queue, and the outbound task then flushes and sends
/// a close frame. Deliberately not `Clone`.
#[derive(Debug)]
pub struct SessionHandle {
    connection_id: ConnectionId,
    user_id: UserId,
    outbound: mpsc::Sender<Arc<ServerFrame>>,
    closer: SessionCloser,
}

impl SessionHandle {
    /// Create a handle and the receiving end of its outbound queue.
    #[must_use]
    pub fn new(
        connection_id: ConnectionId,
        user_id: UserId,
        capacity: usize,
        closer: SessionCloser,
    ) -> (Self, mpsc::Receiver<Arc<ServerFrame>>) {
        let (outbound, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                connection_id,
                user_id,
                outbound,
                closer,
            },
            rx,
        )
    }

    /// The connection id.
    #[must_use]
    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    /// The authenticated user.
    #[must_use]
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Enqueue without waiting.
    pub(crate) fn try_enqueue(&self, frame: Arc<ServerFrame>) -> Result<(), EnqueueError> {
        self.outbound.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => EnqueueError::Full,
            TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }

    /// Signal the session's tasks to stop.
    pub(crate) fn close(&self, reason: CloseReason) {
        self.closer.close(reason);
    }

    pub(crate) fn is_owned_by(&self, closer: &SessionCloser) -> bool {
        self.closer.same_session(closer)
    }
}

/// Session timing and buffer configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Outbound queue capacity in frames.
    pub outbound_capacity: usize,
    /// Interval between heartbeat pings.
    pub heartbeat_interval: Duration,
    /// Close the session if nothing is read for this long.
    pub read_timeout: Duration,
    /// Bound on a single transport write.
    pub write_timeout: Duration,
    /// Bound on flushing the outbound queue after unregistering.
    pub drain_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 256,
            heartbeat_interval: Duration::from_secs(54),
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(5),
        }
    }
}

/// One client connection bound to an authenticated user.
pub struct Session {
    connection_id: ConnectionId,
    user_id: UserId,
    state: SessionState,
    config: SessionConfig,
    dispatcher: Arc<Dispatcher>,
    presence: PresenceHandle,
    closer: SessionCloser,
}

impl Session {
    /// Create a session in the `Connecting` state.
    #[must_use]
    pub fn new(
        user_id: UserId,
        config: SessionConfig,
        dispatcher: Arc<Dispatcher>,
        presence: PresenceHandle,
        shutdown: &CancellationToken,
    ) -> Self {
        Self {
            connection_id: ConnectionId::generate(),
            user_id,
            state: SessionState::Connecting,
            config,
            dispatcher,
            presence,
            closer: SessionCloser::new(shutdown),
        }
    }

    /// Use a caller-chosen connection id instead of a generated one.
    #[must_use]
    pub fn with_connection_id(mut self, connection_id: ConnectionId) -> Self {
        self.connection_id = connection_id;
        self
    }

    /// The connection id.
    #[must_use]
    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Run the session until the connection ends.
    pub async fn run<S, K>(mut self, mut source: S, mut sink: K) -> CloseReason
    where
        S: FrameSource,
        K: FrameSink + 'static,
    {
        let (handle, outbound_rx) = SessionHandle::new(
            self.connection_id.clone(),
            self.user_id,
            self.config.outbound_capacity,
            self.closer.clone(),
        );

        if let Err(e) = self.dispatcher.hub().register(handle).await {
            warn!(connection = %self.connection_id, error = %e, "Failed to register session");
            if let Err(e) = sink.close().await {
                debug!(connection = %self.connection_id, error = %e, "Close after failed register");
            }
            self.state = SessionState::Closed;
            return CloseReason::Shutdown;
        }

        self.state = SessionState::Active;
        info!(
            connection = %self.connection_id,
            user = self.user_id,
            remote = source.remote_addr().as_deref().unwrap_or("unknown"),
            "Session active"
        );

        let (liveness, watchdog) = Liveness::new(self.config.read_timeout);
        let watchdog = tokio::spawn(watchdog.run(self.closer.clone()));
        let outbound = tokio::spawn(write_loop(
            outbound_rx,
            sink,
            self.config.clone(),
            self.closer.clone(),
            self.presence.clone(),
            self.user_id,
            self.connection_id.clone(),
        ));

        loop {
            tokio::select! {
                biased;
                _ = self.closer.closed() => break,
                incoming = source.recv() => match incoming {
                    Ok(Some(Incoming::Frame(frame))) => {
                        liveness.renew();
                        let room = frame.room_id();
                        if let Err(e) = self.dispatcher.dispatch(&self.connection_id, self.user_id, frame).await {
                            if let Some(reason) = self.handle_error(room, e).await {
                                self.closer.close(reason);
                                break;
                            }
                        }
                    }
                    Ok(Some(Incoming::Invalid(e))) => {
                        liveness.renew();
                        debug!(connection = %self.connection_id, error = %e, "Malformed frame");
                        if let Some(reason) = self.handle_error(None, ChatError::Protocol(e)).await {
                            self.closer.close(reason);
                            break;
                        }
                    }
                    Ok(Some(Incoming::Heartbeat)) => liveness.renew(),
                    Ok(None) => {
                        self.closer.close(CloseReason::ClientClosed);
                        break;
                    }
                    Err(e) => {
                        debug!(connection = %self.connection_id, error = %e, "Read failed");
                        self.closer.close(CloseReason::TransportError);
                        break;
                    }
                }
            }
        }

        let reason = self.closer.reason();
        self.state = SessionState::Draining;

        // A superseded session no longer owns its connection id
        match self
            .dispatcher
            .hub()
            .release(&self.connection_id, &self.closer, reason)
            .await
        {
            Ok(_) => {}
            Err(e) => debug!(connection = %self.connection_id, error = %e, "Unregister skipped"),
        }

        drop(liveness);
        let drain_bound = self.config.drain_timeout + self.config.write_timeout;
        let mut outbound = outbound;
        if time::timeout(drain_bound, &mut outbound).await.is_err() {
            warn!(connection = %self.connection_id, "Outbound task did not finish, aborting");
            outbound.abort();
        }
        if let Err(e) = watchdog.await {
            debug!(connection = %self.connection_id, error = %e, "Watchdog task ended abnormally");
        }

        self.state = SessionState::Closed;
        info!(connection = %self.connection_id, user = self.user_id, reason = %reason, "Session closed");
        reason
    }

    /// Answer a failed request. Returns a close reason if the session must end.
    async fn handle_error(&self, room: Option<RoomId>, error: ChatError) -> Option<CloseReason> {
        let frame = match error {
            ChatError::Protocol(e) => {
                let room = e.room_id().or(room);
                ServerFrame::error(room, error_message(&e))
            }
            ChatError::StoreUnavailable(e) => {
                warn!(connection = %self.connection_id, error = %e, "Store unavailable");
                ServerFrame::error(room, "service temporarily unavailable")
            }
            ChatError::Hub(HubError::Closed) => return Some(CloseReason::Shutdown),
            ChatError::Hub(HubError::UnknownSession(_)) | ChatError::Capacity(_) => {
                return Some(self.closer.reason());
            }
            ChatError::Transport(e) => {
                debug!(connection = %self.connection_id, error = %e, "Transport error");
                return Some(CloseReason::TransportError);
            }
            ChatError::Delivery(e) => {
                warn!(connection = %self.connection_id, error = %e, "Delivery error");
                return None;
            }
        };

        match self.dispatcher.reply(&self.connection_id, frame).await {
            Ok(()) => None,
            Err(ChatError::Hub(HubError::Closed)) => Some(CloseReason::Shutdown),
            Err(_) => Some(self.closer.reason()),
        }
    }
}

fn error_message(error: &ProtocolError) -> String {
    match error {
        ProtocolError::Json(_) | ProtocolError::Decode(_) | ProtocolError::Incomplete(_) => {
            "malformed frame".to_string()
        }
        other => other.to_string(),
    }
}

/// Drain the outbound queue to the transport.
///
/// Returns when the hub closes the queue or a write fails. A closed
/// session keeps flushing until the queue closes or the drain bound
/// passes, then sends a close frame.
async fn write_loop<K: FrameSink>(
    mut rx: mpsc::Receiver<Arc<ServerFrame>>,
    mut sink: K,
    config: SessionConfig,
    closer: SessionCloser,
    presence: PresenceHandle,
    user_id: UserId,
    connection_id: ConnectionId,
) {
    let mut ticker = time::interval_at(
        Instant::now() + config.heartbeat_interval,
        config.heartbeat_interval,
    );

    loop {
        tokio::select! {
            biased;
            frame = rx.recv() => match frame {
                Some(frame) => {
                    if !write_frame(&mut sink, &frame, config.write_timeout, &connection_id).await {
                        closer.close(CloseReason::WriteFailed);
                        return;
                    }
                }
                None => break,
            },
            _ = ticker.tick() => {
                match time::timeout(config.write_timeout, sink.ping()).await {
                    Ok(Ok(())) => presence.refresh(user_id, connection_id.clone()),
                    Ok(Err(e)) => {
                        debug!(connection = %connection_id, error = %e, "Ping failed");
                        closer.close(CloseReason::WriteFailed);
                        return;
                    }
                    Err(_) => {
                        debug!(connection = %connection_id, "Ping timed out");
                        closer.close(CloseReason::WriteFailed);
                        return;
                    }
                }
            }
            _ = closer.closed() => {
                let deadline = Instant::now() + config.drain_timeout;
                while let Ok(Some(frame)) = time::timeout_at(deadline, rx.recv()).await {
                    if !write_frame(&mut sink, &frame, config.write_timeout, &connection_id).await {
                        return;
                    }
                }
                break;
            }
        }
    }

    match time::timeout(config.write_timeout, sink.close()).await {
        Ok(Ok(())) => debug!(connection = %connection_id, "Sent close frame"),
        Ok(Err(e)) => debug!(connection = %connection_id, error = %e, "Close frame failed"),
        Err(_) => debug!(connection = %connection_id, "Close frame timed out"),
    }
}

async fn write_frame<K: FrameSink>(
    sink: &mut K,
    frame: &ServerFrame,
    timeout: Duration,
    connection_id: &ConnectionId,
) -> bool {
    match time::timeout(timeout, sink.send(frame)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            debug!(connection = %connection_id, error = %e, "Write failed");
            false
        }
        Err(_) => {
            debug!(connection = %connection_id, "Write timed out");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id() {
        let id = ConnectionId::new("test-123");
        assert_eq!(id.as_str(), "test-123");
        assert_eq!(id.to_string(), "test-123");
        assert_ne!(ConnectionId::generate(), ConnectionId::generate());
    }

    #[test]
    fn test_first_close_reason_wins() {
        let closer = SessionCloser::new(&CancellationToken::new());
        closer.close(CloseReason::SlowConsumer);
        closer.close(CloseReason::ClientClosed);
        assert_eq!(closer.reason(), CloseReason::SlowConsumer);
    }

    #[test]
    fn test_parent_cancel_means_shutdown() {
        let root = CancellationToken::new();
        let closer = SessionCloser::new(&root);
        root.cancel();
        assert!(closer.is_closed());
        assert_eq!(closer.reason(), CloseReason::Shutdown);
    }

    #[tokio::test]
    async fn test_handle_queue_overflow() {
        let closer = SessionCloser::new(&CancellationToken::new());
        let (handle, mut rx) = SessionHandle::new(ConnectionId::new("c1"), 1, 2, closer);

        let frame = Arc::new(ServerFrame::room_joined(1));
        assert_eq!(handle.try_enqueue(frame.clone()), Ok(()));
        assert_eq!(handle.try_enqueue(frame.clone()), Ok(()));
        assert_eq!(handle.try_enqueue(frame.clone()), Err(EnqueueError::Full));

        drop(handle);
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());
    }
}
