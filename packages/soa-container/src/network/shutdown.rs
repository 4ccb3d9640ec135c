//! Shutdown coordination: serving state, the shutdown signal, and in-flight
//! request accounting.
//!
//! Every request holds an [`InFlightGuard`] from the moment its frame is
//! accepted until its pipeline finishes, wherever that happens (connection
//! task or worker thread). Draining waits for the last guard to drop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::{watch, Notify};

/// Serving state of the container.
///
/// `Starting -> Ready -> Draining -> Stopped`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServingState {
    /// Listener not bound yet.
    Starting,
    /// Accepting connections and requests.
    Ready,
    /// No new connections; in-flight requests are finishing.
    Draining,
    /// Every in-flight request has completed.
    Stopped,
}

#[derive(Debug, Default)]
struct InFlight {
    count: AtomicU64,
    idle: Notify,
}

/// Owns the shutdown signal and the in-flight request count.
#[derive(Debug)]
pub struct ShutdownController {
    signal: watch::Sender<bool>,
    in_flight: Arc<InFlight>,
    state: ArcSwap<ServingState>,
}

impl ShutdownController {
    #[must_use]
    pub fn new() -> Self {
        let (signal, _) = watch::channel(false);
        Self {
            signal,
            in_flight: Arc::new(InFlight::default()),
            state: ArcSwap::from_pointee(ServingState::Starting),
        }
    }

    pub fn set_ready(&self) {
        self.state.store(Arc::new(ServingState::Ready));
    }

    #[must_use]
    pub fn state(&self) -> ServingState {
        **self.state.load()
    }

    /// Whether new frames should still be turned into requests.
    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.state() == ServingState::Ready
    }

    /// Receiver flipped to `true` once shutdown starts.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.signal.subscribe()
    }

    /// Moves to `Draining` and notifies every subscriber.
    pub fn trigger_shutdown(&self) {
        self.state.store(Arc::new(ServingState::Draining));
        self.signal.send_replace(true);
    }

    /// Counts one request as in flight until the guard drops.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.count.fetch_add(1, Ordering::AcqRel);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.count.load(Ordering::Acquire)
    }

    /// Waits until no request is in flight, at most `timeout`.
    ///
    /// Returns `true` and moves to `Stopped` when drained; returns `false`
    /// and stays in `Draining` on timeout.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register before checking so a guard dropped in between still
            // wakes us.
            let idle = self.in_flight.idle.notified();
            if self.in_flight_count() == 0 {
                self.state.store(Arc::new(ServingState::Stopped));
                return true;
            }
            if tokio::time::timeout_at(deadline, idle).await.is_err() {
                return false;
            }
        }
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Marks one request as in flight. Dropping it, including during unwinding,
/// ends the request.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<InFlight>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.in_flight.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.in_flight.idle.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_states() {
        let controller = ShutdownController::new();
        assert_eq!(controller.state(), ServingState::Starting);
        assert!(!controller.is_accepting());

        controller.set_ready();
        assert!(controller.is_accepting());

        controller.trigger_shutdown();
        assert_eq!(controller.state(), ServingState::Draining);
        assert!(!controller.is_accepting());
    }

    #[test]
    fn guards_count_in_flight_requests() {
        let controller = ShutdownController::new();
        let a = controller.in_flight_guard();
        let b = controller.in_flight_guard();
        assert_eq!(controller.in_flight_count(), 2);
        drop(a);
        assert_eq!(controller.in_flight_count(), 1);
        drop(b);
        assert_eq!(controller.in_flight_count(), 0);
    }

    #[test]
    fn guard_released_by_worker_thread() {
        let controller = ShutdownController::new();
        let guard = controller.in_flight_guard();
        std::thread::spawn(move || drop(guard)).join().unwrap();
        assert_eq!(controller.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn subscribers_see_the_signal() {
        let controller = ShutdownController::new();
        let mut rx = controller.subscribe();
        assert!(!*rx.borrow());
        controller.trigger_shutdown();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn drain_completes_when_last_guard_drops() {
        let controller = ShutdownController::new();
        controller.set_ready();
        let guard = controller.in_flight_guard();
        controller.trigger_shutdown();

        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            drop(guard);
        });

        assert!(controller.wait_for_drain(Duration::from_secs(2)).await);
        assert_eq!(controller.state(), ServingState::Stopped);
        release.await.unwrap();
    }

    #[tokio::test]
    async fn drain_times_out_with_requests_outstanding() {
        let controller = ShutdownController::new();
        let _guard = controller.in_flight_guard();
        controller.trigger_shutdown();

        assert!(!controller.wait_for_drain(Duration::from_millis(30)).await);
        assert_eq!(controller.state(), ServingState::Draining);
    }
}
