//! Metrics collection and export for Murmur.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use murmur_core::HubHandle;
use murmur_protocol::ServerFrame;
use murmur_transport::{FrameSink, FrameSource, Incoming, TransportError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "murmur_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "murmur_connections_active";
    pub const FRAMES_TOTAL: &str = "murmur_frames_total";
    pub const SESSIONS_ACTIVE: &str = "murmur_sessions_active";
    pub const ROOMS_ACTIVE: &str = "murmur_rooms_active";
    pub const EVICTIONS_TOTAL: &str = "murmur_evictions_total";
    pub const BUS_DELIVERIES_TOTAL: &str = "murmur_bus_deliveries_total";
    pub const DISPATCH_SECONDS: &str = "murmur_dispatch_seconds";
    pub const ERRORS_TOTAL: &str = "murmur_errors_total";
    pub const CLOSES_TOTAL: &str = "murmur_session_closes_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of open WebSocket connections"
    );
    metrics::describe_counter!(names::FRAMES_TOTAL, "Frames by direction and type");
    metrics::describe_gauge!(names::SESSIONS_ACTIVE, "Sessions registered with the hub");
    metrics::describe_gauge!(names::ROOMS_ACTIVE, "Rooms with at least one local session");
    metrics::describe_counter!(
        names::EVICTIONS_TOTAL,
        "Sessions evicted for a full outbound queue"
    );
    metrics::describe_counter!(
        names::BUS_DELIVERIES_TOTAL,
        "Bus deliveries by outcome (ack or nack)"
    );
    metrics::describe_histogram!(
        names::DISPATCH_SECONDS,
        "Time from receiving an inbound frame to finishing its dispatch"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors by type");
    metrics::describe_counter!(names::CLOSES_TOTAL, "Session closes by reason");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the exporter cannot be installed.
pub fn start_metrics_server(port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new WebSocket connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a closed WebSocket connection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record one frame crossing the transport.
pub fn record_frame(direction: &'static str, kind: &str) {
    counter!(names::FRAMES_TOTAL, "direction" => direction, "type" => kind.to_string()).increment(1);
}

/// Record how long one inbound frame took to dispatch.
pub fn record_dispatch(elapsed: Duration) {
    histogram!(names::DISPATCH_SECONDS).record(elapsed.as_secs_f64());
}

/// Record a bus delivery outcome.
pub fn record_delivery(acked: bool) {
    let outcome = if acked { "ack" } else { "nack" };
    counter!(names::BUS_DELIVERIES_TOTAL, "outcome" => outcome).increment(1);
}

/// Record why a session ended.
pub fn record_close(reason: &'static str) {
    counter!(names::CLOSES_TOTAL, "reason" => reason).increment(1);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Publish hub statistics every `period` until `shutdown` fires.
pub async fn poll_hub_stats(hub: HubHandle, period: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(period);
    let mut reported_evictions = 0;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if hub.is_closed() {
                    break;
                }
                let stats = hub.stats().await;
                gauge!(names::SESSIONS_ACTIVE).set(stats.sessions as f64);
                gauge!(names::ROOMS_ACTIVE).set(stats.rooms as f64);
                counter!(names::EVICTIONS_TOTAL).increment(stats.evictions.saturating_sub(reported_evictions));
                reported_evictions = stats.evictions;
            }
        }
    }
    debug!("Hub stats poller stopped");
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}

/// A [`FrameSource`] that counts inbound frames and times their dispatch.
///
/// The session asks for the next frame only after the previous one has
/// been dispatched, so the gap between a frame and the next `recv` call
/// is its dispatch time.
pub struct MeteredSource<S> {
    inner: S,
    received_at: Option<Instant>,
}

impl<S> MeteredSource<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            received_at: None,
        }
    }
}

#[async_trait]
impl<S: FrameSource> FrameSource for MeteredSource<S> {
    async fn recv(&mut self) -> Result<Option<Incoming>, TransportError> {
        if let Some(at) = self.received_at.take() {
            record_dispatch(at.elapsed());
        }

        let incoming = self.inner.recv().await;
        match &incoming {
            Ok(Some(Incoming::Frame(frame))) => {
                record_frame("inbound", frame.kind());
                self.received_at = Some(Instant::now());
            }
            Ok(Some(Incoming::Invalid(_))) => record_error("protocol"),
            Ok(Some(Incoming::Heartbeat)) | Ok(None) => {}
            Err(_) => record_error("transport"),
        }
        incoming
    }

    fn remote_addr(&self) -> Option<String> {
        self.inner.remote_addr()
    }
}

/// A [`FrameSink`] that counts outbound frames and write failures.
pub struct MeteredSink<K> {
    inner: K,
}

impl<K> MeteredSink<K> {
    pub fn new(inner: K) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<K: FrameSink> FrameSink for MeteredSink<K> {
    async fn send(&mut self, frame: &ServerFrame) -> Result<(), TransportError> {
        let result = self.inner.send(frame).await;
        match &result {
            Ok(()) => record_frame("outbound", frame.kind()),
            Err(_) => record_error("write"),
        }
        result
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        self.inner.ping().await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.inner.close().await
    }
}
