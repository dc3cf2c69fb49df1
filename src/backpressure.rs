//! In-flight request limiting.
//!
//! Unbounded pipelining would eventually wrap the 16-bit message-ID space
//! into IDs that are still pending. The [`BackpressureController`] caps the
//! number of outstanding requests with a semaphore: a permit is acquired
//! before a request is registered, travels with the pending entry, and is
//! released when the request settles, whichever way it settles.
//!
//! # Configuration
//!
//! - `max_in_flight`: Maximum outstanding requests (default: 64, ceiling 4096)
//! - Timeout: How long to wait for a free slot (default: 5s)

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

use crate::error::{Mup1Error, Result};

/// Default maximum outstanding requests.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 64;

/// Hard ceiling on outstanding requests.
pub const MAX_IN_FLIGHT_CEILING: usize = 4096;

/// Default backpressure timeout (how long to wait for a slot).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Limits the number of requests awaiting a response.
///
/// Clones share the same slots.
#[derive(Debug, Clone)]
pub struct BackpressureController {
    semaphore: Arc<Semaphore>,
    max_in_flight: usize,
    timeout: Duration,
}

impl BackpressureController {
    /// Create a controller with the given limit, clamped to `1..=4096`.
    pub fn new(max_in_flight: usize) -> Self {
        Self::with_timeout(max_in_flight, DEFAULT_TIMEOUT)
    }

    /// Create a controller with custom timeout.
    pub fn with_timeout(max_in_flight: usize, timeout: Duration) -> Self {
        let max_in_flight = max_in_flight.clamp(1, MAX_IN_FLIGHT_CEILING);
        Self {
            semaphore: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
            timeout,
        }
    }

    /// Get maximum in-flight limit.
    #[inline]
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    /// Get available capacity.
    #[inline]
    pub fn available_capacity(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Get current in-flight count.
    #[inline]
    pub fn in_flight(&self) -> usize {
        self.max_in_flight - self.available_capacity()
    }

    /// Try to reserve a slot without waiting.
    ///
    /// Returns `Err(BackpressureTimeout)` if at capacity.
    pub fn try_reserve(&self) -> Result<OwnedSemaphorePermit> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .map_err(|e| match e {
                TryAcquireError::NoPermits => Mup1Error::BackpressureTimeout,
                TryAcquireError::Closed => Mup1Error::ConnectionClosed,
            })
    }

    /// Reserve a slot, waiting up to the configured timeout.
    ///
    /// The slot is released when the returned permit is dropped.
    pub async fn reserve(&self) -> Result<OwnedSemaphorePermit> {
        let acquire = self.semaphore.clone().acquire_owned();
        match tokio::time::timeout(self.timeout, acquire).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(Mup1Error::ConnectionClosed),
            Err(_) => {
                tracing::warn!(
                    "no in-flight slot freed within {:?} ({} outstanding)",
                    self.timeout,
                    self.max_in_flight
                );
                Err(Mup1Error::BackpressureTimeout)
            }
        }
    }

    /// Fail current and future waiters with `ConnectionClosed`.
    pub fn close(&self) {
        self.semaphore.close();
    }
}

impl Default for BackpressureController {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_IN_FLIGHT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_controller_creation() {
        let ctrl = BackpressureController::new(100);
        assert_eq!(ctrl.max_in_flight(), 100);
        assert_eq!(ctrl.in_flight(), 0);
        assert_eq!(ctrl.available_capacity(), 100);
    }

    #[test]
    fn test_controller_default_and_clamp() {
        assert_eq!(
            BackpressureController::default().max_in_flight(),
            DEFAULT_MAX_IN_FLIGHT
        );
        assert_eq!(BackpressureController::new(0).max_in_flight(), 1);
        assert_eq!(
            BackpressureController::new(100_000).max_in_flight(),
            MAX_IN_FLIGHT_CEILING
        );
    }

    #[test]
    fn test_try_reserve_at_capacity() {
        let ctrl = BackpressureController::new(2);

        let _a = ctrl.try_reserve().unwrap();
        let _b = ctrl.try_reserve().unwrap();
        assert_eq!(ctrl.available_capacity(), 0);
        assert_eq!(ctrl.in_flight(), 2);

        let result = ctrl.try_reserve();
        assert!(matches!(result, Err(Mup1Error::BackpressureTimeout)));
    }

    #[test]
    fn test_release_on_drop() {
        let ctrl = BackpressureController::new(10);

        let permit = ctrl.try_reserve().unwrap();
        assert_eq!(ctrl.available_capacity(), 9);

        drop(permit);
        assert_eq!(ctrl.available_capacity(), 10);
    }

    #[test]
    fn test_clone_shares_state() {
        let ctrl1 = BackpressureController::new(10);
        let ctrl2 = ctrl1.clone();

        let _permit = ctrl1.try_reserve().unwrap();
        assert_eq!(ctrl2.in_flight(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reserve_timeout() {
        let ctrl = BackpressureController::with_timeout(1, Duration::from_millis(10));
        let _held = ctrl.try_reserve().unwrap();

        let start = tokio::time::Instant::now();
        let result = ctrl.reserve().await;

        assert!(matches!(result, Err(Mup1Error::BackpressureTimeout)));
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_reserve_wait_success() {
        let ctrl = BackpressureController::with_timeout(1, Duration::from_secs(1));
        let held = ctrl.try_reserve().unwrap();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            drop(held);
        });

        assert!(ctrl.reserve().await.is_ok());
    }

    #[tokio::test]
    async fn test_close_wakes_waiters() {
        let ctrl = BackpressureController::with_timeout(1, Duration::from_secs(5));
        let _held = ctrl.try_reserve().unwrap();

        let waiter = {
            let ctrl = ctrl.clone();
            tokio::spawn(async move { ctrl.reserve().await })
        };
        tokio::task::yield_now().await;
        ctrl.close();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(Mup1Error::ConnectionClosed)));
    }
}
