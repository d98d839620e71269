//! Bounded pool of CPU-bound work permits.
//!
//! Backed by a FIFO-fair `tokio::sync::Semaphore`: an acquirer that finds no
//! free permit is queued behind every earlier waiter. Held and peak counts are
//! tracked alongside so the bound can be observed from outside.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PermitError {
    #[error("permit pool closed")]
    Closed,
}

struct PermitCounters {
    held: AtomicUsize,
    peak: AtomicUsize,
}

impl PermitCounters {
    fn enter(&self) {
        let now = self.held.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak.fetch_max(now, Ordering::AcqRel);
    }
}

/// One unit of CPU-bound work allowance.
///
/// Returns to its pool on drop.
#[must_use = "dropping a CpuPermit releases it immediately"]
pub struct CpuPermit {
    _permit: OwnedSemaphorePermit,
    counters: Arc<PermitCounters>,
}

impl CpuPermit {
    fn new(permit: OwnedSemaphorePermit, counters: Arc<PermitCounters>) -> Self {
        counters.enter();
        Self {
            _permit: permit,
            counters,
        }
    }
}

impl Drop for CpuPermit {
    fn drop(&mut self) {
        // Runs before the semaphore permit field is dropped, so `held` never
        // exceeds the limit from an observer's point of view.
        self.counters.held.fetch_sub(1, Ordering::AcqRel);
        tracing::trace!("CPU-bound permit released");
    }
}

impl std::fmt::Debug for CpuPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuPermit").finish_non_exhaustive()
    }
}

/// Pool of CPU-bound work permits, bounded to `limit`.
pub struct PermitPool {
    semaphore: Arc<Semaphore>,
    limit: usize,
    counters: Arc<PermitCounters>,
}

impl PermitPool {
    pub fn new(limit: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
            counters: Arc::new(PermitCounters {
                held: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }),
        }
    }

    /// Take a permit, suspending until one is free.
    ///
    /// Waiters are served in arrival order. Fails once the pool is closed,
    /// including for waiters already queued when it closes.
    pub async fn acquire(&self) -> Result<CpuPermit, PermitError> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| PermitError::Closed)?;
        tracing::trace!(available = self.available(), "CPU-bound permit acquired");
        Ok(CpuPermit::new(permit, Arc::clone(&self.counters)))
    }

    /// Take a permit only if one is free right now.
    pub fn try_acquire(&self) -> Option<CpuPermit> {
        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => Some(CpuPermit::new(permit, Arc::clone(&self.counters))),
            Err(TryAcquireError::NoPermits) => None,
            Err(TryAcquireError::Closed) => None,
        }
    }

    /// Stop handing out permits and fail every pending acquirer.
    pub fn close(&self) {
        if !self.semaphore.is_closed() {
            tracing::debug!(held = self.held(), "Closing CPU-bound permit pool");
            self.semaphore.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Permits currently held by guards.
    pub fn held(&self) -> usize {
        self.counters.held.load(Ordering::Acquire)
    }

    /// Highest number of permits ever held at the same time.
    pub fn peak(&self) -> usize {
        self.counters.peak.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for PermitPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermitPool")
            .field("limit", &self.limit)
            .field("available", &self.available())
            .field("held", &self.held())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn pool_acquire_until_exhausted() {
        let pool = PermitPool::new(2);

        let p1 = pool.try_acquire();
        assert!(p1.is_some());

        let p2 = pool.try_acquire();
        assert!(p2.is_some());

        let p3 = pool.try_acquire();
        assert!(p3.is_none());

        assert_eq!(pool.available(), 0);
        assert_eq!(pool.held(), 2);
    }

    #[tokio::test]
    async fn permit_returns_to_pool_on_drop() {
        let pool = PermitPool::new(1);

        {
            let _permit = pool.acquire().await.unwrap();
            assert_eq!(pool.available(), 0);
        }

        assert_eq!(pool.available(), 1);
        assert_eq!(pool.held(), 0);
        assert!(pool.try_acquire().is_some());
    }

    #[tokio::test]
    async fn acquire_suspends_until_release() {
        let pool = Arc::new(PermitPool::new(1));
        let held = pool.acquire().await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire().await.map(drop) })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(held);
        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should be released")
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn waiters_served_in_arrival_order() {
        let pool = Arc::new(PermitPool::new(1));
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let held = pool.acquire().await.unwrap();

        let mut waiters = Vec::new();
        for name in ["first", "second", "third"] {
            let pool = Arc::clone(&pool);
            let order = Arc::clone(&order);
            waiters.push(tokio::spawn(async move {
                let _permit = pool.acquire().await.unwrap();
                order.lock().unwrap().push(name);
                tokio::time::sleep(Duration::from_millis(5)).await;
            }));
            // Let the waiter queue up before the next one arrives.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        drop(held);
        for waiter in waiters {
            waiter.await.unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn close_fails_pending_and_future_acquirers() {
        let pool = Arc::new(PermitPool::new(1));
        let _held = pool.acquire().await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire().await.map(drop) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        pool.close();
        assert!(pool.is_closed());
        assert_eq!(waiter.await.unwrap(), Err(PermitError::Closed));
        assert_eq!(pool.acquire().await.map(drop), Err(PermitError::Closed));
        assert!(pool.try_acquire().is_none());
    }

    #[tokio::test]
    async fn peak_tracks_high_water_mark() {
        let pool = PermitPool::new(3);

        let a = pool.try_acquire().unwrap();
        let b = pool.try_acquire().unwrap();
        drop(a);
        let c = pool.try_acquire().unwrap();
        drop(b);
        drop(c);

        assert_eq!(pool.peak(), 2);
        assert_eq!(pool.held(), 0);
        assert_eq!(pool.limit(), 3);
    }

    #[test]
    fn permit_error_display() {
        assert_eq!(format!("{}", PermitError::Closed), "permit pool closed");
    }
}
