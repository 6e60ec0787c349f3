//! HTTP and WebSocket handlers for the Murmur server.
//!
//! The gateway in front of this server authenticates users and forwards
//! the user id in a header. Requests without a usable id are rejected
//! before the upgrade.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use murmur_core::{
    Engine, MemoryBus, MemoryPresenceStore, MemoryStore, MessageBus, PersistenceStore,
    PresenceStore,
};
use murmur_protocol::UserId;
use murmur_transport::{websocket, WebSocketConfig};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::config::{Config, PresenceSection, RoomSeed};
use crate::metrics::{self, ConnectionMetricsGuard, MeteredSink, MeteredSource};
use crate::notify::OfflineNotifier;

const STATS_PERIOD: Duration = Duration::from_secs(5);

/// Shared server state.
pub struct AppState {
    pub engine: Engine,
    pub config: Config,
    ws_config: WebSocketConfig,
}

/// Why a connection was refused before the upgrade.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("missing {0} header")]
    Missing(String),

    #[error("invalid user id in {0} header")]
    Invalid(String),
}

impl IntoResponse for IdentityError {
    fn into_response(self) -> Response {
        (StatusCode::UNAUTHORIZED, self.to_string()).into_response()
    }
}

/// Read the authenticated user id from `header`.
///
/// # Errors
///
/// Returns an error if the header is absent or not a positive integer.
pub fn user_id(headers: &HeaderMap, header: &str) -> Result<UserId, IdentityError> {
    let value = headers
        .get(header)
        .ok_or_else(|| IdentityError::Missing(header.to_string()))?;

    value
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse::<UserId>().ok())
        .filter(|id| *id != 0)
        .ok_or_else(|| IdentityError::Invalid(header.to_string()))
}

/// Build the engine and everything it depends on.
///
/// # Errors
///
/// Returns an error if the configured presence store cannot be reached.
pub async fn build_state(config: Config) -> Result<Arc<AppState>> {
    let store: Arc<dyn PersistenceStore> = seed_store(&config.rooms).await;

    let presence_store = presence_store(&config.presence).await?;
    let bus: Option<Arc<dyn MessageBus>> = if config.bus.enabled {
        Some(Arc::new(MemoryBus::new()))
    } else {
        None
    };

    let engine = Engine::start(config.engine_config(), Arc::clone(&store), presence_store, bus);
    if config.bus.enabled {
        let notifier = OfflineNotifier::new(store, engine.presence().clone());
        engine.consume(Arc::new(notifier)).await;
    }

    Ok(Arc::new(AppState {
        engine,
        ws_config: config.websocket_config(),
        config,
    }))
}

/// An in-memory persistence store holding the configured memberships.
pub async fn seed_store(rooms: &[RoomSeed]) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    for room in rooms {
        for member in &room.members {
            store.add_member(room.id, *member).await;
        }
    }
    store
}

async fn presence_store(config: &PresenceSection) -> Result<Arc<dyn PresenceStore>> {
    match &config.redis_url {
        #[cfg(feature = "redis")]
        Some(url) => {
            let store = murmur_core::RedisPresenceStore::connect(url)
                .await
                .with_context(|| format!("Failed to connect to Redis at {url}"))?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "redis"))]
        Some(_) => {
            tracing::warn!("redis_url is set but the redis feature is disabled, using in-memory presence");
            Ok(Arc::new(MemoryPresenceStore::new()))
        }
        None => Ok(Arc::new(MemoryPresenceStore::new())),
    }
}

/// The HTTP router.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Serve on `listener` until `shutdown` completes, then stop the engine.
///
/// # Errors
///
/// Returns an error if the HTTP server fails.
pub async fn serve<F>(listener: TcpListener, state: Arc<AppState>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let token = state.engine.shutdown_token();
    let app = app(Arc::clone(&state));

    // Sessions must close before axum stops waiting on their connections
    let signal = async move {
        shutdown.await;
        token.cancel();
    };

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(signal)
        .await
        .context("HTTP server failed")?;

    state.engine.shutdown().await;
    Ok(())
}

/// Run the HTTP/WebSocket server until Ctrl-C.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let addr = config.bind_addr()?;
    let state = build_state(config.clone()).await?;

    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
        tokio::spawn(metrics::poll_hub_stats(
            state.engine.hub().clone(),
            STATS_PERIOD,
            state.engine.shutdown_token(),
        ));
    }

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("Murmur server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    serve(listener, state, shutdown_signal()).await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.engine.hub().stats().await;
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": stats.sessions,
        "rooms": stats.rooms,
    }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let user = match user_id(&headers, &state.config.auth.user_header) {
        Ok(user) => user,
        Err(e) => {
            debug!(remote = %remote, error = %e, "Rejected WebSocket upgrade");
            metrics::record_error("identity");
            return e.into_response();
        }
    };

    ws.on_upgrade(move |socket| handle_websocket(socket, user, remote, state))
}

async fn handle_websocket(socket: WebSocket, user_id: UserId, remote: SocketAddr, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();
    debug!(user = user_id, remote = %remote, "WebSocket connected");

    let (source, sink) = websocket::split(socket, Some(remote.to_string()), &state.ws_config);
    let reason = state
        .engine
        .serve(user_id, MeteredSource::new(source), MeteredSink::new(sink))
        .await;

    metrics::record_close(reason.as_str());
    debug!(user = user_id, remote = %remote, reason = %reason, "WebSocket disconnected");
}
