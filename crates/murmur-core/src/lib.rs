//! # murmur-core
//!
//! Hub, sessions and the services around them for the Murmur chat hub.
//!
//! - **Hub** - single-writer actor owning the session registry and room index
//! - **Session** - one client connection: read loop, write loop, liveness watchdog
//! - **Presence** - mirrors local state into a shared, TTL-bounded store
//! - **Delivery** - at-least-once bus consumption with ack/nack
//! - **Unread** - per-(user, room) unread counters
//! - **Reconcile** - revokes room memberships the store no longer grants
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │   Session   │────▶│ Dispatcher  │────▶│ Persistence │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        ▲                   │
//!        │ outbound queue    ▼
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Hub actor  │◀────│  broadcast  │     │ Message bus │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        │
//!        ▼
//! ┌─────────────┐
//! │  Presence   │
//! └─────────────┘
//! ```

pub mod delivery;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod heartbeat;
pub mod hub;
pub mod presence;
pub mod reconcile;
pub mod session;
pub mod store;
pub mod unread;

pub use delivery::{
    BusConfig, BusError, BusMessage, ConsumerPool, Deduplicator, Delivery, DeliveryError,
    DeliveryHandler, DeliveryTag, MemoryBus, MessageBus,
};
pub use dispatch::Dispatcher;
pub use engine::{Engine, EngineConfig};
pub use error::{ChatError, StoreError};
pub use hub::{BroadcastReport, Hub, HubConfig, HubError, HubHandle, HubStats};
pub use presence::{
    MemoryPresenceStore, PresenceConfig, PresenceHandle, PresenceRecord, PresenceStore,
    PresenceSync,
};
#[cfg(feature = "redis")]
pub use presence::RedisPresenceStore;
pub use session::{CloseReason, ConnectionId, Session, SessionConfig, SessionHandle, SessionState};
pub use store::{MemoryStore, NewMessage, PersistenceStore, StoredMessage};
pub use unread::{UnreadCounter, UnreadTracker};
