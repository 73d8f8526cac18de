//! Graceful shutdown coordination.
//!
//! Once shutdown starts, the listener stops accepting, new calls get 503,
//! and in-flight calls (including open streams) get `timeout` to finish.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Shutdown state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    Draining,
    Stopped,
}

impl ShutdownState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Running,
            1 => Self::Draining,
            _ => Self::Stopped,
        }
    }
}

/// Result of a shutdown operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownResult {
    Complete,
    Timeout { remaining: u32 },
}

/// Tracks in-flight calls and drives the stop sequence.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    state: Arc<AtomicU8>,
    in_flight: Arc<AtomicU32>,
    notify: Arc<Notify>,
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(ShutdownState::Running as u8)),
            in_flight: Arc::new(AtomicU32::new(0)),
            notify: Arc::new(Notify::new()),
            token: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> ShutdownState {
        ShutdownState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_accepting(&self) -> bool {
        self.state() == ShutdownState::Running
    }

    /// Track an in-flight call. Returns None if shutting down.
    pub fn track(&self) -> Option<ShutdownGuard> {
        if !self.is_accepting() {
            return None;
        }
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        Some(ShutdownGuard {
            counter: Arc::clone(&self.in_flight),
            notify: Arc::clone(&self.notify),
        })
    }

    pub fn in_flight_count(&self) -> u32 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Resolves once shutdown has been requested.
    pub async fn requested(&self) {
        self.token.cancelled().await
    }

    /// Stop accepting new calls without waiting.
    pub fn begin(&self) {
        let _ = self.state.compare_exchange(
            ShutdownState::Running as u8,
            ShutdownState::Draining as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        self.token.cancel();
    }

    /// Stop accepting and wait up to `timeout` for in-flight calls.
    pub async fn initiate(&self, timeout: Duration) -> ShutdownResult {
        self.begin();
        let result = self.wait_for_drain(timeout).await;
        self.state
            .store(ShutdownState::Stopped as u8, Ordering::SeqCst);
        result
    }

    async fn wait_for_drain(&self, timeout: Duration) -> ShutdownResult {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            // Register before checking so a guard dropped in between still wakes us
            let notified = self.notify.notified();
            let count = self.in_flight_count();
            if count == 0 {
                return ShutdownResult::Complete;
            }

            let remaining_time = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining_time.is_zero() {
                return ShutdownResult::Timeout { remaining: count };
            }

            tokio::select! {
                _ = notified => continue,
                _ = tokio::time::sleep(remaining_time) => {
                    let final_count = self.in_flight_count();
                    if final_count == 0 {
                        return ShutdownResult::Complete;
                    }
                    return ShutdownResult::Timeout { remaining: final_count };
                }
            }
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard for one in-flight call.
#[derive(Debug)]
pub struct ShutdownGuard {
    counter: Arc<AtomicU32>,
    notify: Arc<Notify>,
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_guard_tracks_in_flight() {
        let coordinator = ShutdownCoordinator::new();
        let guard = coordinator.track().unwrap();
        assert_eq!(coordinator.in_flight_count(), 1);
        drop(guard);
        assert_eq!(coordinator.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_no_new_calls_after_begin() {
        let coordinator = ShutdownCoordinator::new();
        coordinator.begin();
        assert_eq!(coordinator.state(), ShutdownState::Draining);
        assert!(coordinator.track().is_none());
        coordinator.requested().await;
    }

    #[tokio::test]
    async fn test_initiate_waits_for_drain() {
        let coordinator = ShutdownCoordinator::new();
        let guard = coordinator.track().unwrap();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(guard);
        });
        let result = coordinator.initiate(Duration::from_secs(5)).await;
        assert_eq!(result, ShutdownResult::Complete);
        assert_eq!(coordinator.state(), ShutdownState::Stopped);
    }

    #[tokio::test]
    async fn test_initiate_times_out() {
        let coordinator = ShutdownCoordinator::new();
        let _guard = coordinator.track().unwrap();
        let result = coordinator.initiate(Duration::from_millis(20)).await;
        assert_eq!(result, ShutdownResult::Timeout { remaining: 1 });
    }
}
