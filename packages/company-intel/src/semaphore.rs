//! Counting admission gate for browser and page-fetch operations.
//!
//! Each scraping surface owns its own gate: the authenticated session admits
//! [`SESSION_CONCURRENCY`] operations, the verification fetcher
//! [`FETCH_CONCURRENCY`]. Waiters are served first-come first-served and a
//! permit goes back to the gate when its guard drops, so error paths cannot
//! leak permits.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Permits for the authenticated trade-site session.
pub const SESSION_CONCURRENCY: usize = 2;

/// Permits for the generic verification page fetcher.
pub const FETCH_CONCURRENCY: usize = 5;

#[derive(Debug, Error)]
#[error("admission gate closed")]
pub struct GateClosed;

/// FIFO counting gate. Cloning shares the same permits.
#[derive(Debug, Clone)]
pub struct AdmissionGate {
    inner: Arc<Semaphore>,
    capacity: usize,
}

impl AdmissionGate {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait until a permit is free and take it.
    ///
    /// There is no acquisition timeout; a holder that never finishes starves
    /// the gate.
    pub async fn acquire(&self) -> Result<GatePermit, GateClosed> {
        let permit = self
            .inner
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| GateClosed)?;
        Ok(GatePermit { _permit: permit })
    }

    pub fn available(&self) -> usize {
        self.inner.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Held while an admitted operation runs. Dropping it releases the permit,
/// handing it straight to the longest waiter if there is one.
#[derive(Debug)]
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
}

impl GatePermit {
    /// Give the permit back explicitly (same as dropping it).
    pub fn release(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    #[tokio::test]
    async fn test_acquire_consumes_and_drop_releases() {
        let gate = AdmissionGate::new(2);
        let a = gate.acquire().await.unwrap();
        let b = gate.acquire().await.unwrap();
        assert_eq!(gate.available(), 0);

        drop(a);
        assert_eq!(gate.available(), 1);
        b.release();
        assert_eq!(gate.available(), 2);
    }

    #[tokio::test]
    async fn test_waiters_are_served_in_arrival_order() {
        let gate = AdmissionGate::new(1);
        let order = Arc::new(Mutex::new(Vec::new()));
        let held = gate.acquire().await.unwrap();

        let mut handles = Vec::new();
        for i in 0..4 {
            let gate = gate.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let _permit = gate.acquire().await.unwrap();
                order.lock().unwrap().push(i);
            }));
            // Let each waiter enqueue before the next one arrives.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        drop(held);
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(gate.available(), 1);
    }

    #[tokio::test]
    async fn test_handoff_to_waiter_keeps_available_at_zero() {
        let gate = AdmissionGate::new(1);
        let held = gate.acquire().await.unwrap();

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move {
                let permit = gate.acquire().await.unwrap();
                tokio::time::sleep(Duration::from_millis(30)).await;
                drop(permit);
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        drop(held);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(gate.available(), 0);

        waiter.await.unwrap();
        assert_eq!(gate.available(), 1);
    }

    #[tokio::test]
    async fn test_permit_released_on_error_path() {
        async fn failing(gate: &AdmissionGate) -> Result<(), &'static str> {
            let _permit = gate.acquire().await.map_err(|_| "closed")?;
            Err("navigation failed")
        }

        let gate = AdmissionGate::new(2);
        assert!(failing(&gate).await.is_err());
        assert_eq!(gate.available(), 2);
    }
}
