//! Scope guards for CPU-bound work done on I/O threads.
//!
//! `CpuBoundWork` holds a permit for the duration of a CPU-heavy section.
//! `IoBoundWorkSlot` hands that permit back while the section waits on I/O,
//! and takes one again before computing resumes.

use std::future::Future;
use std::sync::Arc;

use super::{CpuPermit, PermitError, PermitPool};

/// Holds one CPU-bound permit until `done()` or drop.
pub struct CpuBoundWork {
    pool: Arc<PermitPool>,
    permit: Option<CpuPermit>,
}

impl CpuBoundWork {
    /// Suspend until a permit is free, then hold it.
    pub async fn acquire(pool: &Arc<PermitPool>) -> Result<Self, PermitError> {
        let permit = pool.acquire().await?;
        Ok(Self {
            pool: Arc::clone(pool),
            permit: Some(permit),
        })
    }

    /// Release the permit early. Idempotent.
    pub fn done(&mut self) {
        self.permit.take();
    }

    pub fn is_holding(&self) -> bool {
        self.permit.is_some()
    }

    /// Take a permit again if the guard no longer holds one. No-op otherwise.
    pub async fn reacquire(&mut self) -> Result<(), PermitError> {
        if self.permit.is_none() {
            self.permit = Some(self.pool.acquire().await?);
            tracing::debug!("CPU-bound permit reacquired");
        }
        Ok(())
    }

    /// Run `fut` with the permit handed back to the pool, reacquiring one
    /// before returning.
    ///
    /// If this future is dropped before it completes, for example when raced
    /// against a timer, and no permit is free at that moment, the guard is left
    /// released. Call `reacquire()` before computing again.
    pub async fn io_bound<F>(&mut self, fut: F) -> Result<F::Output, PermitError>
    where
        F: Future,
    {
        let slot = IoBoundWorkSlot::enter(self);
        let output = fut.await;
        slot.finish().await?;
        Ok(output)
    }
}

impl std::fmt::Debug for CpuBoundWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuBoundWork")
            .field("holding", &self.is_holding())
            .finish()
    }
}

/// Scope break inside a `CpuBoundWork` section.
///
/// Borrows the guard mutably for its whole lifetime. Must be closed with
/// `finish()`; a slot dropped without it only reacquires if a permit is free
/// right away.
#[must_use = "call finish() to reacquire the CPU-bound permit"]
pub struct IoBoundWorkSlot<'a> {
    work: &'a mut CpuBoundWork,
    released: bool,
}

impl<'a> IoBoundWorkSlot<'a> {
    pub fn enter(work: &'a mut CpuBoundWork) -> Self {
        let released = work.permit.take().is_some();
        if released {
            tracing::debug!(
                available = work.pool.available(),
                "Entering I/O-bound slot, permit returned"
            );
        }
        Self { work, released }
    }

    /// Suspend until a permit is free again and hand it back to the guard.
    ///
    /// A slot entered on an already released guard has nothing to restore.
    pub async fn finish(mut self) -> Result<(), PermitError> {
        if !self.released {
            return Ok(());
        }
        let permit = self.work.pool.acquire().await?;
        self.work.permit = Some(permit);
        self.released = false;
        tracing::debug!("Leaving I/O-bound slot, permit reacquired");
        Ok(())
    }
}

impl Drop for IoBoundWorkSlot<'_> {
    fn drop(&mut self) {
        if !self.released {
            return;
        }
        match self.work.pool.try_acquire() {
            Some(permit) => self.work.permit = Some(permit),
            None => tracing::warn!(
                "I/O-bound slot dropped without finish() and no permit free, guard left released"
            ),
        }
    }
}
