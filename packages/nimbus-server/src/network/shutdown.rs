//! Readiness and drain control for the gateway's HTTP listener.
//!
//! `/health` reports [`HealthState`] directly; `NetworkModule::serve` flips
//! it to `Ready` right before binding and `bin/nimbus.rs` drives it through
//! `Draining`/`Stopped` once a SIGINT/SIGTERM arrives (§6). State lives
//! behind an `ArcSwap` so a health probe never contends with a request
//! completing, and the in-flight count is a plain atomic behind an RAII
//! guard so a panicking handler still releases its slot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::watch;

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Gateway lifecycle state, surfaced verbatim by `GET /health` (§6).
///
/// `Starting -> Ready -> Draining -> Stopped`; `Draining` never reverts to
/// `Ready` -- once `trigger_shutdown` fires there is no path back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Starting,
    Ready,
    Draining,
    Stopped,
}

/// Owns the gateway's readiness flag, the shutdown broadcast, and the count
/// of requests currently inside a handler.
///
/// `NetworkModule` holds one of these for the lifetime of the process;
/// `bin/nimbus.rs` calls `trigger_shutdown` then `wait_for_drain` from the
/// signal-handling task while the serve task keeps running until its
/// `shutdown_receiver` fires.
#[derive(Debug)]
pub struct ShutdownController {
    signal: watch::Sender<bool>,
    in_flight: Arc<AtomicU64>,
    state: Arc<ArcSwap<HealthState>>,
}

impl ShutdownController {
    #[must_use]
    pub fn new() -> Self {
        let (signal, _rx) = watch::channel(false);
        Self { signal, in_flight: Arc::new(AtomicU64::new(0)), state: Arc::new(ArcSwap::from_pointee(HealthState::Starting)) }
    }

    /// Called once the listener is bound and ready to accept connections.
    pub fn set_ready(&self) {
        self.state.store(Arc::new(HealthState::Ready));
    }

    #[must_use]
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.signal.subscribe()
    }

    /// Moves to `Draining` and wakes every `shutdown_receiver`. Idempotent:
    /// a second call re-sends `true` on a channel that's already `true`,
    /// which is a no-op for any receiver that already observed it.
    pub fn trigger_shutdown(&self) {
        self.state.store(Arc::new(HealthState::Draining));
        let _ = self.signal.send(true);
    }

    #[must_use]
    pub fn health_state(&self) -> HealthState {
        **self.state.load()
    }

    /// A handle onto the same state cell this controller writes to, for
    /// callers that want to poll readiness without holding the whole
    /// controller (and its `in_flight`/`signal` machinery).
    #[must_use]
    pub fn health_state_handle(&self) -> Arc<ArcSwap<HealthState>> {
        Arc::clone(&self.state)
    }

    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard { in_flight: Arc::clone(&self.in_flight) }
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Polls until the in-flight count hits zero or `timeout` elapses.
    /// Transitions to `Stopped` only on a clean drain; a timeout leaves the
    /// state at `Draining` so `/health` keeps reporting it accurately.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.in_flight_count() == 0 {
                self.state.store(Arc::new(HealthState::Stopped));
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the gateway's in-flight count on drop, including on unwind.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_in_starting_state_with_no_in_flight_requests() {
        let controller = ShutdownController::new();
        assert_eq!(controller.health_state(), HealthState::Starting);
        assert_eq!(controller.in_flight_count(), 0);
    }

    #[test]
    fn set_ready_then_trigger_shutdown_walks_the_state_machine() {
        let controller = ShutdownController::new();
        controller.set_ready();
        assert_eq!(controller.health_state(), HealthState::Ready);
        controller.trigger_shutdown();
        assert_eq!(controller.health_state(), HealthState::Draining);
    }

    #[test]
    fn in_flight_guard_increments_and_decrements_on_drop() {
        let controller = ShutdownController::new();
        let guard1 = controller.in_flight_guard();
        assert_eq!(controller.in_flight_count(), 1);
        let guard2 = controller.in_flight_guard();
        assert_eq!(controller.in_flight_count(), 2);
        drop(guard1);
        assert_eq!(controller.in_flight_count(), 1);
        drop(guard2);
        assert_eq!(controller.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_receiver_observes_the_broadcast() {
        let controller = ShutdownController::new();
        let mut rx = controller.shutdown_receiver();
        assert!(!*rx.borrow());
        controller.trigger_shutdown();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn wait_for_drain_completes_immediately_with_nothing_in_flight() {
        let controller = ShutdownController::new();
        controller.set_ready();
        controller.trigger_shutdown();
        assert!(controller.wait_for_drain(Duration::from_secs(1)).await);
        assert_eq!(controller.health_state(), HealthState::Stopped);
    }

    #[tokio::test]
    async fn wait_for_drain_waits_for_the_last_guard_to_drop() {
        let controller = ShutdownController::new();
        controller.set_ready();
        let guard = controller.in_flight_guard();
        controller.trigger_shutdown();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(guard);
        });

        assert!(controller.wait_for_drain(Duration::from_secs(2)).await);
        assert_eq!(controller.health_state(), HealthState::Stopped);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn wait_for_drain_times_out_and_stays_draining() {
        let controller = ShutdownController::new();
        controller.set_ready();
        let _guard = controller.in_flight_guard();
        controller.trigger_shutdown();
        assert!(!controller.wait_for_drain(Duration::from_millis(50)).await);
        assert_eq!(controller.health_state(), HealthState::Draining);
    }

    #[test]
    fn health_state_handle_reflects_later_transitions() {
        let controller = ShutdownController::new();
        let handle = controller.health_state_handle();
        assert_eq!(**handle.load(), HealthState::Starting);
        controller.set_ready();
        assert_eq!(**handle.load(), HealthState::Ready);
    }
}
