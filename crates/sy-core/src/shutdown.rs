use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// ShutdownSignal: cooperative shutdown coordination
// ---------------------------------------------------------------------------

/// Broadcast-based shutdown coordinator shared by the daemon, the workers,
/// and the sweep loops.
///
/// Components call `subscribe()` and `select!` on the returned receiver
/// alongside their main loop. Triggering the signal flips an atomic flag
/// and broadcasts once; each component confirms drain when its loop exits
/// so the daemon can wait for a clean stop.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    trigger: broadcast::Sender<()>,
    shutting_down: Arc<AtomicBool>,
    drain_tx: Arc<watch::Sender<usize>>,
    drain_rx: watch::Receiver<usize>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (trigger, _) = broadcast::channel(1);
        let (drain_tx, drain_rx) = watch::channel(0);
        Self {
            trigger,
            shutting_down: Arc::new(AtomicBool::new(false)),
            drain_tx: Arc::new(drain_tx),
            drain_rx,
        }
    }

    /// Subscribe to the shutdown broadcast.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.trigger.subscribe()
    }

    /// Non-blocking check of the shutdown flag.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }

    /// Trigger shutdown for all subscribers. Idempotent.
    pub fn trigger(&self) {
        if self
            .shutting_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            info!("shutdown signal triggered");
            let _ = self.trigger.send(());
        }
    }

    /// Record that one component has finished draining.
    pub fn confirm_drained(&self) {
        self.drain_tx.send_modify(|count| *count += 1);
    }

    /// Wait for `expected` components to confirm drain, up to `timeout`.
    pub async fn wait_for_drain(&mut self, expected: usize, timeout: Duration) -> DrainResult {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let confirmed = *self.drain_rx.borrow();
            if confirmed >= expected {
                info!(count = confirmed, "all components drained");
                return DrainResult::Complete(confirmed);
            }
            match tokio::time::timeout_at(deadline, self.drain_rx.changed()).await {
                Ok(Ok(())) => continue,
                // Sender side gone; report what we saw.
                Ok(Err(_)) => return DrainResult::Complete(*self.drain_rx.borrow()),
                Err(_) => {
                    let confirmed = *self.drain_rx.borrow();
                    warn!(confirmed, expected, "drain timeout");
                    return DrainResult::Timeout { confirmed, expected };
                }
            }
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// DrainResult / DrainGuard
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainResult {
    Complete(usize),
    Timeout { confirmed: usize, expected: usize },
}

impl DrainResult {
    pub fn is_complete(&self) -> bool {
        matches!(self, DrainResult::Complete(_))
    }
}

/// RAII guard that confirms drain on drop. Hand one to every spawned loop
/// that participates in graceful shutdown.
pub struct DrainGuard {
    signal: ShutdownSignal,
}

impl DrainGuard {
    pub fn new(signal: ShutdownSignal) -> Self {
        Self { signal }
    }
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        self.signal.confirm_drained();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_sets_flag_and_is_idempotent() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_shutting_down());
        signal.trigger();
        signal.trigger();
        assert!(signal.is_shutting_down());
    }

    #[test]
    fn clone_shares_state() {
        let signal = ShutdownSignal::new();
        let clone = signal.clone();
        signal.trigger();
        assert!(clone.is_shutting_down());
    }

    #[tokio::test]
    async fn subscriber_receives_trigger() {
        let signal = ShutdownSignal::new();
        let mut rx = signal.subscribe();
        signal.trigger();
        let received = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(received.is_ok());
    }

    #[tokio::test]
    async fn drain_completes_when_guards_drop() {
        let mut signal = ShutdownSignal::new();
        let guard_a = DrainGuard::new(signal.clone());
        let guard_b = DrainGuard::new(signal.clone());
        signal.trigger();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            drop(guard_a);
            drop(guard_b);
        });

        let result = signal.wait_for_drain(2, Duration::from_secs(1)).await;
        assert!(result.is_complete());
    }

    #[tokio::test]
    async fn drain_times_out_when_a_component_hangs() {
        let mut signal = ShutdownSignal::new();
        let _held = DrainGuard::new(signal.clone());
        signal.trigger();

        match signal.wait_for_drain(2, Duration::from_millis(50)).await {
            DrainResult::Timeout { confirmed, expected } => {
                assert_eq!(confirmed, 0);
                assert_eq!(expected, 2);
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }
}
