//! Bus consumer that picks out room members to notify offline.
//!
//! Push delivery itself belongs to an external notifier; this handler
//! decides who needs one and logs the decision.

use std::sync::Arc;

use async_trait::async_trait;
use murmur_core::{BusMessage, Deduplicator, DeliveryError, DeliveryHandler, PersistenceStore, PresenceHandle};
use murmur_protocol::{kind, UserId};
use tracing::{debug, info};

use crate::metrics;

const DEDUP_CAPACITY: usize = 10_000;

/// Bus handler that finds room members who need an offline notification.
///
/// Redeliveries of an already handled message are skipped.
pub struct OfflineNotifier {
    store: Arc<dyn PersistenceStore>,
    presence: PresenceHandle,
    seen: Deduplicator,
}

impl OfflineNotifier {
    #[must_use]
    pub fn new(store: Arc<dyn PersistenceStore>, presence: PresenceHandle) -> Self {
        Self {
            store,
            presence,
            seen: Deduplicator::new(DEDUP_CAPACITY),
        }
    }

    /// Members of the message's room, other than the sender, with no live presence record.
    async fn offline_recipients(&self, message: &BusMessage) -> Result<Vec<UserId>, DeliveryError> {
        let mut offline = Vec::new();
        for member in self.store.room_members(message.room_id).await? {
            if member != message.sender_id && !self.presence.is_online(member).await? {
                offline.push(member);
            }
        }
        Ok(offline)
    }

    async fn process(&self, message: &BusMessage) -> Result<(), DeliveryError> {
        if message.kind != kind::NEW_MESSAGE || self.seen.is_processed(&message.id).await {
            debug!(id = %message.id, kind = %message.kind, "Skipping bus message");
            return Ok(());
        }

        let recipients = self.offline_recipients(message).await?;
        if !recipients.is_empty() {
            info!(
                id = %message.id,
                room = message.room_id,
                recipients = ?recipients,
                "Offline notification due"
            );
        }
        self.seen.mark_processed(&message.id).await;
        Ok(())
    }
}

#[async_trait]
impl DeliveryHandler for OfflineNotifier {
    async fn handle(&self, message: &BusMessage) -> Result<(), DeliveryError> {
        let result = self.process(message).await;
        metrics::record_delivery(result.is_ok());
        result
    }
}
