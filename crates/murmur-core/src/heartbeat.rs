//! Per-session liveness deadline.
//!
//! The inbound side calls [`Liveness::renew`] on every frame or heartbeat
//! response. A separate [`Watchdog`] task owns the deadline and closes the
//! session when it passes without renewal, so the timeout never depends on
//! the read or write tasks making progress.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{self, Instant};
use tracing::debug;

use crate::session::{CloseReason, SessionCloser};

/// Renewal side of the liveness deadline.
#[derive(Debug)]
pub struct Liveness {
    tx: watch::Sender<Instant>,
}

impl Liveness {
    /// Create a deadline of `timeout` starting now.
    #[must_use]
    pub fn new(timeout: Duration) -> (Self, Watchdog) {
        let (tx, rx) = watch::channel(Instant::now());
        (Self { tx }, Watchdog { rx, timeout })
    }

    /// Push the deadline out by a full timeout from now.
    pub fn renew(&self) {
        self.tx.send_replace(Instant::now());
    }
}

/// Expiry side of the liveness deadline.
#[derive(Debug)]
pub struct Watchdog {
    rx: watch::Receiver<Instant>,
    timeout: Duration,
}

impl Watchdog {
    /// Wait for the deadline or for the session to close.
    ///
    /// Returns `true` if the deadline expired, in which case the session
    /// has been closed with [`CloseReason::HeartbeatTimeout`].
    pub async fn run(mut self, closer: SessionCloser) -> bool {
        loop {
            let deadline = *self.rx.borrow_and_update() + self.timeout;

            tokio::select! {
                _ = closer.closed() => return false,
                changed = self.rx.changed() => {
                    if changed.is_err() {
                        // Renewal side dropped, the session is tearing down
                        return false;
                    }
                }
                _ = time::sleep_until(deadline) => {
                    if self.rx.has_changed().unwrap_or(false) {
                        continue;
                    }
                    debug!(timeout = ?self.timeout, "Liveness deadline expired");
                    closer.close(CloseReason::HeartbeatTimeout);
                    return true;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_expires_without_renewal() {
        let closer = SessionCloser::new(&CancellationToken::new());
        let (_liveness, watchdog) = Liveness::new(Duration::from_secs(60));

        let task = tokio::spawn(watchdog.run(closer.clone()));
        time::sleep(Duration::from_secs(61)).await;

        assert!(task.await.unwrap());
        assert!(closer.is_closed());
        assert_eq!(closer.reason(), CloseReason::HeartbeatTimeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_extends_deadline() {
        let closer = SessionCloser::new(&CancellationToken::new());
        let (liveness, watchdog) = Liveness::new(Duration::from_secs(60));
        let task = tokio::spawn(watchdog.run(closer.clone()));

        for _ in 0..5 {
            time::sleep(Duration::from_secs(40)).await;
            liveness.renew();
        }
        assert!(!closer.is_closed());

        closer.close(CloseReason::ClientClosed);
        assert!(!task.await.unwrap());
        assert_eq!(closer.reason(), CloseReason::ClientClosed);
    }
}
