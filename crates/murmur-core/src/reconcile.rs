//! Periodic reconciliation against the persistence store.
//!
//! Membership is checked against the persistence store only at join time.
//! The reconciler closes the gap: sessions whose user has since lost
//! membership are removed from the room and told with a `room_left` frame.
//! The same pass recomputes unread counters so a cached count that drifted
//! from the read markers heals.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use murmur_protocol::{ServerFrame, UserId};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ChatError;
use crate::hub::{HubError, HubHandle};
use crate::store::PersistenceStore;
use crate::unread::UnreadTracker;

/// Run [`reconcile_once`] and [`UnreadTracker::reconcile_all`] every
/// `interval` until `shutdown` is cancelled.
pub async fn run_reconciler(
    hub: HubHandle,
    store: Arc<dyn PersistenceStore>,
    unread: Arc<UnreadTracker>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => match reconcile_once(&hub, store.as_ref()).await {
                Ok(0) => {}
                Ok(removed) => info!(removed, "Revoked stale room memberships"),
                Err(ChatError::Hub(HubError::Closed)) => break,
                Err(e) => warn!(error = %e, "Membership reconciliation failed"),
            },
        }

        match unread.reconcile_all().await {
            Ok(0) => {}
            Ok(corrected) => debug!(corrected, "Corrected unread counters"),
            Err(e) => warn!(error = %e, "Unread reconciliation failed"),
        }
    }
    debug!("Reconciler stopped");
}

/// Remove every local session whose user is no longer a room member.
///
/// Returns the number of memberships removed. A room whose members cannot
/// be loaded is skipped.
///
/// # Errors
///
/// Returns an error if the hub has stopped.
pub async fn reconcile_once(
    hub: &HubHandle,
    store: &dyn PersistenceStore,
) -> Result<usize, ChatError> {
    let mut removed = 0;
    for room in hub.rooms().await {
        let members: HashSet<UserId> = match store.room_members(room).await {
            Ok(members) => members.into_iter().collect(),
            Err(e) => {
                warn!(room, error = %e, "Skipping room, members unavailable");
                continue;
            }
        };

        for (conn, user) in hub.room_sessions(room).await {
            if members.contains(&user) {
                continue;
            }
            match hub.leave_room(&conn, room).await {
                Ok(true) => {}
                Ok(false) | Err(HubError::UnknownSession(_)) => continue,
                Err(e) => return Err(e.into()),
            }
            removed += 1;
            debug!(connection = %conn, user, room, "Membership revoked");

            match hub.deliver(&conn, Arc::new(ServerFrame::room_left(room))).await {
                Ok(()) | Err(ChatError::Capacity(_)) | Err(ChatError::Hub(HubError::UnknownSession(_))) => {}
                Err(e) => return Err(e),
            }
        }
    }
    Ok(removed)
}
