//! Coroutine spawning and tracking.
//!
//! Every coroutine runs inside an execution wrapper that catches panics at the
//! task boundary. Forced unwinds propagate untouched; anything else becomes a
//! `CoroutineFault` for the driver and a `CoroutineError` for the handle.

use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::FutureExt;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::bridge::{self, CoroutineFault, Disposition, ForcedUnwind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CoroutineId(uuid::Uuid);

impl CoroutineId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl Default for CoroutineId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CoroutineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoroutineError {
    /// The body panicked; the payload went to the engine driver.
    #[error("coroutine panicked: {message}")]
    Panicked { message: String },

    /// Torn down by a forced unwind or by engine shutdown.
    #[error("coroutine unwound before completion")]
    Unwound,
}

/// Live coroutines, keyed by id.
#[derive(Default)]
pub struct CoroutineRegistry {
    live: DashMap<CoroutineId, Instant>,
}

impl CoroutineRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn register(self: &Arc<Self>, id: CoroutineId) -> Registration {
        self.live.insert(id, Instant::now());
        Registration {
            id,
            registry: Arc::clone(self),
        }
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    pub fn contains(&self, id: CoroutineId) -> bool {
        self.live.contains_key(&id)
    }

    /// Age of the longest-running live coroutine.
    pub fn oldest(&self) -> Option<Duration> {
        self.live.iter().map(|entry| entry.value().elapsed()).max()
    }
}

/// Removes its coroutine from the registry when the task finishes or is dropped.
pub(crate) struct Registration {
    id: CoroutineId,
    registry: Arc<CoroutineRegistry>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.live.remove(&self.id);
    }
}

/// Handle to a spawned coroutine.
///
/// Dropping it detaches the coroutine; it keeps running.
pub struct CoroutineHandle<T> {
    id: CoroutineId,
    task: JoinHandle<Result<T, CoroutineError>>,
}

impl<T> CoroutineHandle<T> {
    pub fn id(&self) -> CoroutineId {
        self.id
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the coroutine and return its output.
    pub async fn join(self) -> Result<T, CoroutineError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => match e.try_into_panic() {
                Ok(payload) if !payload.is::<ForcedUnwind>() => Err(CoroutineError::Panicked {
                    message: bridge::panic_message(payload.as_ref()),
                }),
                _ => Err(CoroutineError::Unwound),
            },
        }
    }
}

/// Spawn `fut` on `dispatcher` inside the execution wrapper.
pub(crate) fn spawn_coroutine<F>(
    dispatcher: &Handle,
    registry: &Arc<CoroutineRegistry>,
    faults: mpsc::UnboundedSender<CoroutineFault>,
    fut: F,
) -> CoroutineHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let id = CoroutineId::new();
    let registration = registry.register(id);
    tracing::trace!(coroutine = %id, "Spawning coroutine");

    let task = dispatcher.spawn(async move {
        let _registration = registration;

        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(output) => Ok(output),
            Err(payload) => match bridge::classify(id, payload) {
                Disposition::Unwind(payload) => {
                    tracing::debug!(coroutine = %id, "Coroutine unwound");
                    panic::resume_unwind(payload)
                }
                Disposition::Fault(fault) => {
                    let message = fault.message();
                    tracing::error!(coroutine = %id, error = %message, "Unhandled panic in coroutine");
                    if faults.send(fault).is_err() {
                        tracing::warn!(coroutine = %id, "Engine driver gone, fault not delivered");
                    }
                    Err(CoroutineError::Panicked { message })
                }
            },
        }
    });

    CoroutineHandle { id, task }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Marker(u32);

    fn faults() -> (
        mpsc::UnboundedSender<CoroutineFault>,
        mpsc::UnboundedReceiver<CoroutineFault>,
    ) {
        mpsc::unbounded_channel()
    }

    #[test]
    fn coroutine_ids_are_unique() {
        let a = CoroutineId::new();
        let b = CoroutineId::new();
        assert_ne!(a, b);
        assert_eq!(a.to_string(), a.as_uuid().to_string());
    }

    #[test]
    fn coroutine_error_display() {
        let err = CoroutineError::Panicked {
            message: "boom".to_string(),
        };
        assert_eq!(format!("{}", err), "coroutine panicked: boom");
        assert_eq!(
            format!("{}", CoroutineError::Unwound),
            "coroutine unwound before completion"
        );
    }

    #[test]
    fn registration_removed_on_drop() {
        let registry = CoroutineRegistry::new();
        let id = CoroutineId::new();

        let registration = registry.register(id);
        assert!(registry.contains(id));
        assert_eq!(registry.len(), 1);
        assert!(registry.oldest().is_some());

        drop(registration);
        assert!(registry.is_empty());
        assert!(registry.oldest().is_none());
    }

    #[tokio::test]
    async fn join_returns_output() {
        let registry = CoroutineRegistry::new();
        let (tx, _rx) = faults();

        let handle = spawn_coroutine(&Handle::current(), &registry, tx, async { 40 + 2 });
        assert_eq!(handle.join().await, Ok(42));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn panic_is_bridged_with_payload() {
        let registry = CoroutineRegistry::new();
        let (tx, mut rx) = faults();

        let handle = spawn_coroutine(&Handle::current(), &registry, tx, async {
            std::panic::panic_any(Marker(9));
        });
        let id = handle.id();

        assert_eq!(
            handle.join().await,
            Err(CoroutineError::Panicked {
                message: "non-string panic payload".to_string()
            })
        );

        let fault = rx.recv().await.expect("fault should reach the driver");
        assert_eq!(fault.coroutine(), id);
        assert_eq!(fault.downcast_ref::<Marker>(), Some(&Marker(9)));
    }

    #[tokio::test]
    async fn forced_unwind_is_not_a_fault() {
        let registry = CoroutineRegistry::new();
        let (tx, mut rx) = faults();

        let handle = spawn_coroutine(&Handle::current(), &registry, tx, async {
            bridge::unwind_coroutine();
        });

        assert_eq!(handle.join().await, Err(CoroutineError::Unwound));
        assert!(rx.try_recv().is_err());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn registry_tracks_suspended_coroutine() {
        let registry = CoroutineRegistry::new();
        let (tx, _rx) = faults();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let handle = spawn_coroutine(&Handle::current(), &registry, tx, async move {
            let _ = release_rx.await;
        });
        assert!(registry.contains(handle.id()));

        release_tx.send(()).unwrap();
        handle.join().await.unwrap();
        assert!(registry.is_empty());
    }
}
