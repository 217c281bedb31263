// Pending acknowledgment bookkeeping.
//
// Each `emit_with_ack` registers a one-shot waiter under a fresh id. The
// transport's reader resolves it when an `ack` frame echoing that id comes
// back. A waiter is forgotten when its wait ends, whether by reply, by
// timeout, or by the caller dropping the future; a late reply is dropped.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use crate::lock;

/// Result of a request/acknowledge exchange.
#[derive(Debug, Clone, PartialEq)]
pub enum AckOutcome {
    /// The server acknowledged with this payload.
    Acked(Value),
    /// No acknowledgment arrived within the timeout. A soft signal, not an error.
    NoAck,
}

impl AckOutcome {
    pub fn is_acked(&self) -> bool {
        matches!(self, Self::Acked(_))
    }
}

#[derive(Default)]
struct AckInner {
    next_id: u64,
    pending: HashMap<u64, oneshot::Sender<Value>>,
}

#[derive(Clone, Default)]
pub struct AckTracker {
    inner: Arc<Mutex<AckInner>>,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self) -> (u64, oneshot::Receiver<Value>) {
        let (tx, rx) = oneshot::channel();
        let mut inner = lock(&self.inner);
        inner.next_id += 1;
        let id = inner.next_id;
        inner.pending.insert(id, tx);
        (id, rx)
    }

    /// Deliver an acknowledgment. Returns false for unknown or expired ids.
    pub fn resolve(&self, id: u64, payload: Value) -> bool {
        let waiter = lock(&self.inner).pending.remove(&id);
        match waiter {
            Some(tx) => tx.send(payload).is_ok(),
            None => {
                debug!(ack_id = id, "dropping acknowledgment with no waiter");
                false
            }
        }
    }

    pub fn forget(&self, id: u64) {
        lock(&self.inner).pending.remove(&id);
    }

    pub fn pending(&self) -> usize {
        lock(&self.inner).pending.len()
    }

    /// Wait up to `timeout` for the acknowledgment registered as `id`.
    /// The waiter is released even if the returned future is never polled.
    pub fn wait(
        &self,
        id: u64,
        rx: oneshot::Receiver<Value>,
        timeout: Duration,
    ) -> impl Future<Output = AckOutcome> + Send + 'static {
        let guard = Waiter { tracker: self.clone(), id };
        async move {
            let _guard = guard;
            match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(payload)) => AckOutcome::Acked(payload),
                Ok(Err(_)) | Err(_) => AckOutcome::NoAck,
            }
        }
    }
}

struct Waiter {
    tracker: AckTracker,
    id: u64,
}

impl Drop for Waiter {
    fn drop(&mut self) {
        self.tracker.forget(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn resolved_ack_is_delivered() {
        let tracker = AckTracker::new();
        let (id, rx) = tracker.register();
        assert!(tracker.resolve(id, json!({"ok": true})));
        let outcome = tracker.wait(id, rx, Duration::from_secs(1)).await;
        assert_eq!(outcome, AckOutcome::Acked(json!({"ok": true})));
        assert_eq!(tracker.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_ack_times_out_as_no_ack() {
        let tracker = AckTracker::new();
        let (id, rx) = tracker.register();
        let outcome = tracker.wait(id, rx, Duration::from_millis(500)).await;
        assert_eq!(outcome, AckOutcome::NoAck);
        assert_eq!(tracker.pending(), 0);
        // A late reply finds no waiter.
        assert!(!tracker.resolve(id, Value::Null));
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_wait_releases_its_waiter() {
        let tracker = AckTracker::new();
        let (id, rx) = tracker.register();
        let wait = tracker.wait(id, rx, Duration::from_secs(5));
        assert!(tokio::time::timeout(Duration::from_millis(10), wait).await.is_err());
        assert_eq!(tracker.pending(), 0);

        let (id, rx) = tracker.register();
        drop(tracker.wait(id, rx, Duration::from_secs(5)));
        assert_eq!(tracker.pending(), 0);
    }

    #[test]
    fn ids_are_unique() {
        let tracker = AckTracker::new();
        let (a, _ra) = tracker.register();
        let (b, _rb) = tracker.register();
        assert_ne!(a, b);
        assert_eq!(tracker.pending(), 2);
    }

    #[test]
    fn unknown_id_is_ignored() {
        let tracker = AckTracker::new();
        assert!(!tracker.resolve(42, Value::Null));
    }
}
