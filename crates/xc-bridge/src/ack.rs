//! Acknowledgement tracking
//!
//! Every tracked outbound message registers a waiter under its `mc` before
//! the frame leaves the socket. The frame reader resolves waiters from
//! inbound ACK/NACK frames; session teardown aborts whatever is left so
//! callers fall through to their retry loop instead of hanging.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Outcome delivered to a waiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    /// The bridge acknowledged the message.
    Ack,
    /// The bridge rejected the message, optionally with a reason.
    Nack(Option<String>),
}

/// Map from outbound `mc` to the task awaiting its acknowledgement.
///
/// The map is per-session: it is created with the connection and aborted
/// with it, never carried across reconnects.
#[derive(Default)]
pub struct AckTracker {
    waiters: Mutex<HashMap<u64, oneshot::Sender<AckOutcome>>>,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `mc`. The returned receiver resolves with the
    /// bridge's verdict, or errors if the session dies first.
    pub fn register(&self, mc: u64) -> oneshot::Receiver<AckOutcome> {
        let (tx, rx) = oneshot::channel();
        self.insert(mc, tx);
        rx
    }

    /// Attach a pre-built waiter under `mc` (the writer task's path, where
    /// the receiving side already lives with the caller).
    pub fn insert(&self, mc: u64, waiter: oneshot::Sender<AckOutcome>) {
        if self.lock().insert(mc, waiter).is_some() {
            warn!(mc, "Replaced an existing ack waiter");
        }
    }

    /// Resolve the waiter for `ref_mc`, if any.
    ///
    /// Unmatched references are normal: untracked messages (heartbeats, the
    /// mandatory inbound ACKs) still get acknowledged by the bridge.
    pub fn resolve(&self, ref_mc: u64, outcome: AckOutcome) {
        match self.lock().remove(&ref_mc) {
            Some(waiter) => {
                // The caller may have timed out and dropped the receiver.
                let _ = waiter.send(outcome);
            }
            None => debug!(ref_mc, ?outcome, "Acknowledgement with no waiter"),
        }
    }

    /// Drop the waiter for `mc` without resolving it (send-side failures).
    pub fn forget(&self, mc: u64) {
        self.lock().remove(&mc);
    }

    /// Abort every pending waiter; their receivers observe a closed channel.
    pub fn abort_all(&self) {
        let drained = std::mem::take(&mut *self.lock());
        if !drained.is_empty() {
            debug!(count = drained.len(), "Aborted pending ack waiters");
        }
    }

    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<AckOutcome>>> {
        match self.waiters.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_ack() {
        let tracker = AckTracker::new();
        let rx = tracker.register(5);

        tracker.resolve(5, AckOutcome::Ack);
        assert_eq!(rx.await.unwrap(), AckOutcome::Ack);
        assert_eq!(tracker.pending(), 0);
    }

    #[tokio::test]
    async fn test_resolve_nack_with_info() {
        let tracker = AckTracker::new();
        let rx = tracker.register(7);

        tracker.resolve(7, AckOutcome::Nack(Some("device busy".into())));
        assert_eq!(rx.await.unwrap(), AckOutcome::Nack(Some("device busy".into())));
    }

    #[tokio::test]
    async fn test_unknown_ref_is_ignored() {
        let tracker = AckTracker::new();
        let rx = tracker.register(1);

        tracker.resolve(99, AckOutcome::Ack);
        assert_eq!(tracker.pending(), 1);
        drop(rx);
    }

    #[tokio::test]
    async fn test_abort_all_closes_receivers() {
        let tracker = AckTracker::new();
        let rx1 = tracker.register(1);
        let rx2 = tracker.register(2);

        tracker.abort_all();
        assert!(rx1.await.is_err());
        assert!(rx2.await.is_err());
        assert_eq!(tracker.pending(), 0);
    }

    #[tokio::test]
    async fn test_forget_drops_waiter() {
        let tracker = AckTracker::new();
        let rx = tracker.register(3);
        tracker.forget(3);
        assert!(rx.await.is_err());
    }
}
