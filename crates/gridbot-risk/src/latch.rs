//! Kill-switch latch.
//!
//! Once triggered, the latch stays triggered until an operator resets
//! it. Workers observe the latch through a `watch` channel so a kill
//! preempts whatever they are doing.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Latched global prohibition on new order placement.
///
/// Thread-safe: shared as `Arc<KillLatch>` across the supervisor, the
/// controller and every worker.
pub struct KillLatch {
    triggered: AtomicBool,
    /// Unix milliseconds of the trigger, 0 when not triggered.
    triggered_at_ms: AtomicI64,
    reason: RwLock<Option<String>>,
    notify_tx: watch::Sender<bool>,
}

impl Default for KillLatch {
    fn default() -> Self {
        Self::new()
    }
}

impl KillLatch {
    pub fn new() -> Self {
        let (notify_tx, _) = watch::channel(false);
        Self {
            triggered: AtomicBool::new(false),
            triggered_at_ms: AtomicI64::new(0),
            reason: RwLock::new(None),
            notify_tx,
        }
    }

    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Trigger the latch. A second trigger keeps the original reason.
    pub fn trigger(&self, reason: impl Into<String>) {
        let reason = reason.into();
        if self
            .triggered
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.triggered_at_ms
                .store(chrono::Utc::now().timestamp_millis(), Ordering::SeqCst);
            *self.reason.write() = Some(reason.clone());
            let _ = self.notify_tx.send(true);
            error!(%reason, "KILL SWITCH TRIGGERED");
        } else {
            warn!(new_reason = %reason, "Kill switch already triggered, keeping original reason");
        }
    }

    #[must_use]
    pub fn reason(&self) -> Option<String> {
        if self.is_triggered() {
            self.reason.read().clone()
        } else {
            None
        }
    }

    /// Unix milliseconds of the trigger, `None` when not triggered.
    #[must_use]
    pub fn triggered_at_ms(&self) -> Option<i64> {
        if self.is_triggered() {
            let ts = self.triggered_at_ms.load(Ordering::SeqCst);
            (ts > 0).then_some(ts)
        } else {
            None
        }
    }

    /// Subscribe to latch transitions. The receiver observes `true` on
    /// trigger and `false` on reset.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.notify_tx.subscribe()
    }

    /// Manual reset. Only the controller calls this, and only after the
    /// supervisor confirmed no kill condition currently holds.
    pub fn reset(&self) {
        if self.is_triggered() {
            let previous = self.reason.read().clone();
            info!(?previous, "Kill switch manually reset");
            self.triggered.store(false, Ordering::SeqCst);
            self.triggered_at_ms.store(0, Ordering::SeqCst);
            *self.reason.write() = None;
            let _ = self.notify_tx.send(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initially_not_triggered() {
        let latch = KillLatch::new();
        assert!(!latch.is_triggered());
        assert!(latch.reason().is_none());
        assert!(latch.triggered_at_ms().is_none());
    }

    #[test]
    fn test_trigger_sets_state() {
        let latch = KillLatch::new();
        latch.trigger("Max drawdown exceeded: 31.2%");

        assert!(latch.is_triggered());
        assert_eq!(
            latch.reason().as_deref(),
            Some("Max drawdown exceeded: 31.2%")
        );
        assert!(latch.triggered_at_ms().is_some());
    }

    #[test]
    fn test_second_trigger_keeps_original_reason() {
        let latch = KillLatch::new();
        latch.trigger("first");
        latch.trigger("second");
        assert_eq!(latch.reason().as_deref(), Some("first"));
    }

    #[test]
    fn test_reset_clears_state() {
        let latch = KillLatch::new();
        latch.trigger("anything");
        latch.reset();

        assert!(!latch.is_triggered());
        assert!(latch.reason().is_none());
        assert!(latch.triggered_at_ms().is_none());
    }

    #[tokio::test]
    async fn test_subscribers_observe_transitions() {
        let latch = KillLatch::new();
        let mut rx = latch.subscribe();
        assert!(!*rx.borrow());

        latch.trigger("volatility");
        rx.changed().await.unwrap();
        assert!(*rx.borrow());

        latch.reset();
        rx.changed().await.unwrap();
        assert!(!*rx.borrow());
    }
}
