//! Synchronous hand-off of partition revocations.
//!
//! A group member must not give partitions up until their pipelines have
//! drained and checkpointed, otherwise the next owner resumes from a stale
//! checkpoint. Clients that learn about revocation in a blocking callback
//! park that callback in [`RevocationGate::hold`] until the coordinator,
//! reading [`SourceConsumer::next_revocation`], completes the
//! [`PendingRevocation`].
//!
//! ```text
//! client callback thread           coordinator task
//! ──────────────────────           ────────────────
//! hold(tps) ──PendingRevocation──▶ next_revocation()
//!   (blocked)                      drain pipelines of tps
//!   ◀──────────────complete()───── checkpoints written
//! return, rebalance continues
//! ```
//!
//! [`SourceConsumer::next_revocation`]: super::SourceConsumer::next_revocation

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::record::TopicPartition;

/// A revocation the client is waiting on.
#[derive(Debug)]
pub struct PendingRevocation {
    pub partitions: Vec<TopicPartition>,
    done: std_mpsc::SyncSender<()>,
}

impl PendingRevocation {
    /// Let the client continue with the rebalance.
    pub fn complete(self) {
        let _ = self.done.send(());
    }
}

/// Blocks a client thread until the coordinator releases revoked partitions.
pub struct RevocationGate {
    tx: mpsc::UnboundedSender<PendingRevocation>,
    rx: Mutex<mpsc::UnboundedReceiver<PendingRevocation>>,
    wait: Duration,
    closed: AtomicBool,
}

impl RevocationGate {
    /// A gate whose holds give up after `wait`.
    pub fn new(wait: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
            wait,
            closed: AtomicBool::new(false),
        }
    }

    /// Block the calling thread until `partitions` are released.
    ///
    /// Returns `false` right away once the gate is closed; the caller then
    /// reports the revocation some other way. Never call this from an async
    /// task.
    pub fn hold(&self, partitions: Vec<TopicPartition>) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        let (done, released) = std_mpsc::sync_channel(1);
        let revocation = PendingRevocation {
            partitions: partitions.clone(),
            done,
        };
        if self.tx.send(revocation).is_err() {
            return false;
        }

        match released.recv_timeout(self.wait) {
            Ok(()) => debug!(partitions = ?partitions, "Revoked partitions released"),
            Err(std_mpsc::RecvTimeoutError::Timeout) => warn!(
                partitions = ?partitions,
                waited = ?self.wait,
                "Revoked partitions not released in time, giving them up"
            ),
            Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                debug!(partitions = ?partitions, "Revocation abandoned")
            }
        }
        true
    }

    /// Next held revocation. Cancel-safe.
    pub async fn next(&self) -> PendingRevocation {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(revocation) => revocation,
            None => std::future::pending().await,
        }
    }

    /// Stop holding and release every waiting revocation.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Ok(mut rx) = self.rx.try_lock() {
            while let Ok(revocation) = rx.try_recv() {
                revocation.complete();
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    fn tps() -> Vec<TopicPartition> {
        vec![TopicPartition::new("orders", 0), TopicPartition::new("orders", 1)]
    }

    // ---------------------------------------------------------------
    // Hold and release
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn test_hold_blocks_until_completed() {
        let gate = Arc::new(RevocationGate::new(Duration::from_secs(10)));
        let holder = {
            let gate = gate.clone();
            tokio::task::spawn_blocking(move || {
                let started = Instant::now();
                let held = gate.hold(tps());
                (held, started.elapsed())
            })
        };

        let revocation = gate.next().await;
        assert_eq!(revocation.partitions, tps());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!holder.is_finished());

        revocation.complete();
        let (held, waited) = holder.await.unwrap();
        assert!(held);
        assert!(waited >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_hold_gives_up_after_wait() {
        let gate = Arc::new(RevocationGate::new(Duration::from_millis(30)));
        let holder = {
            let gate = gate.clone();
            tokio::task::spawn_blocking(move || gate.hold(tps()))
        };

        let _revocation = gate.next().await;
        let held = tokio::time::timeout(Duration::from_secs(5), holder)
            .await
            .expect("hold should time out")
            .unwrap();
        assert!(held);
    }

    #[tokio::test]
    async fn test_dropped_revocation_releases_hold() {
        let gate = Arc::new(RevocationGate::new(Duration::from_secs(10)));
        let holder = {
            let gate = gate.clone();
            tokio::task::spawn_blocking(move || gate.hold(tps()))
        };

        drop(gate.next().await);
        let held = tokio::time::timeout(Duration::from_secs(5), holder)
            .await
            .expect("hold should return")
            .unwrap();
        assert!(held);
    }

    // ---------------------------------------------------------------
    // Close
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn test_closed_gate_does_not_hold() {
        let gate = RevocationGate::new(Duration::from_secs(10));
        gate.close();

        assert!(gate.is_closed());
        assert!(!gate.hold(tps()));
        assert!(tokio::time::timeout(Duration::from_millis(20), gate.next())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_close_releases_queued_revocations() {
        let gate = Arc::new(RevocationGate::new(Duration::from_secs(10)));
        let holder = {
            let gate = gate.clone();
            tokio::task::spawn_blocking(move || gate.hold(tps()))
        };
        while gate.rx.lock().await.is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        gate.close();
        let held = tokio::time::timeout(Duration::from_secs(5), holder)
            .await
            .expect("close should release the hold")
            .unwrap();
        assert!(held);
    }
}
