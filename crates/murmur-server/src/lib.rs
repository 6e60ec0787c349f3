//! # Murmur Server
//!
//! HTTP front end for the Murmur chat hub: configuration, the WebSocket
//! endpoint, Prometheus metrics and the offline-notification bus consumer.

pub mod config;
pub mod handlers;
pub mod metrics;
pub mod notify;

pub use config::Config;
pub use handlers::{app, build_state, run_server, serve, AppState};
