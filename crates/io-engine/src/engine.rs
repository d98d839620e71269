//! Process-wide async I/O engine.
//!
//! Owns the tokio runtime whose worker threads run every coroutine, the
//! CPU-bound permit pool, and the driver thread that rethrows bridged
//! coroutine faults and restarts its loop after each one.
//!
//! Flow:
//! 1. `Engine::get()` builds the engine on first use
//! 2. Coroutines are spawned through `Engine::spawn`
//! 3. Panics in coroutine bodies reach the driver, are reported, and the loop restarts
//! 4. `Engine::shutdown()` stops admission, cancels keep-alive, joins the driver
//!    and drops every outstanding coroutine

use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::Duration;

use serde::Serialize;
use tokio::runtime::{Handle, Runtime};
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;

use crate::bridge::{self, CoroutineFault};
use crate::coroutine::{self, CoroutineHandle, CoroutineRegistry};
use crate::permit::{CpuBoundWork, PermitError, PermitPool};

static INSTANCE: OnceLock<Engine> = OnceLock::new();

/// Worker thread stack size. Large enough for deep recursive call chains.
pub const DEFAULT_STACK_SIZE: usize = 8 * 1024 * 1024;

pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Called on the driver thread for every bridged coroutine fault.
pub type FaultHook = Arc<dyn Fn(&CoroutineFault) + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid engine config: {0}")]
    InvalidConfig(String),

    #[error("failed to start engine: {0}")]
    Start(#[from] std::io::Error),

    #[error("engine already initialized")]
    AlreadyInitialized,

    #[error("engine is shutting down")]
    ShuttingDown,
}

#[derive(Clone)]
pub struct EngineConfig {
    pub worker_threads: usize,
    /// Defaults to `worker_threads - 1`, keeping one thread free for I/O.
    pub cpu_bound_limit: Option<usize>,
    pub stack_size: usize,
    pub shutdown_timeout: Duration,
    pub fault_hook: Option<FaultHook>,
}

impl EngineConfig {
    pub fn cpu_bound_limit(&self) -> usize {
        self.cpu_bound_limit
            .unwrap_or_else(|| self.worker_threads.saturating_sub(1).max(1))
    }

    fn validate(&self) -> Result<(), EngineError> {
        if self.worker_threads < 2 {
            return Err(EngineError::InvalidConfig(format!(
                "worker_threads must be at least 2, got {}",
                self.worker_threads
            )));
        }
        let limit = self.cpu_bound_limit();
        if limit == 0 {
            return Err(EngineError::InvalidConfig(
                "cpu_bound_limit must be at least 1".to_string(),
            ));
        }
        if limit > Semaphore::MAX_PERMITS {
            return Err(EngineError::InvalidConfig(format!(
                "cpu_bound_limit must be at most {}, got {}",
                Semaphore::MAX_PERMITS,
                limit
            )));
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        let concurrency = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            worker_threads: concurrency.max(2),
            cpu_bound_limit: None,
            stack_size: DEFAULT_STACK_SIZE,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            fault_hook: None,
        }
    }
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("worker_threads", &self.worker_threads)
            .field("cpu_bound_limit", &self.cpu_bound_limit())
            .field("stack_size", &self.stack_size)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .field("fault_hook", &self.fault_hook.is_some())
            .finish()
    }
}

/// Point-in-time view of the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub worker_threads: usize,
    pub cpu_bound_limit: usize,
    pub available_permits: usize,
    pub held_permits: usize,
    /// Most permits ever held at once.
    pub peak_permits: usize,
    pub coroutines: usize,
    pub accepting: bool,
}

pub struct Engine {
    dispatcher: Handle,
    runtime: Mutex<Option<Runtime>>,
    keep_alive: CancellationToken,
    faults: mpsc::UnboundedSender<CoroutineFault>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    permits: Arc<PermitPool>,
    coroutines: Arc<CoroutineRegistry>,
    accepting: AtomicBool,
    worker_threads: usize,
    shutdown_timeout: Duration,
}

impl Engine {
    /// The process-wide engine, started on first call.
    ///
    /// # Panics
    ///
    /// If the runtime cannot be started. Use `Engine::init` to handle that.
    pub fn get() -> &'static Engine {
        INSTANCE.get_or_init(|| match Engine::new(EngineConfig::default()) {
            Ok(engine) => engine,
            Err(e) => {
                tracing::error!(error = %e, "Failed to start I/O engine");
                panic!("failed to start I/O engine: {e}");
            }
        })
    }

    /// Install the process-wide engine from an explicit config.
    pub fn init(config: EngineConfig) -> Result<&'static Engine, EngineError> {
        if INSTANCE.get().is_some() {
            return Err(EngineError::AlreadyInitialized);
        }
        let engine = Engine::new(config)?;
        match INSTANCE.set(engine) {
            Ok(()) => INSTANCE.get().ok_or(EngineError::AlreadyInitialized),
            Err(spare) => {
                // Lost the race against another initializer.
                spare.shutdown();
                Err(EngineError::AlreadyInitialized)
            }
        }
    }

    pub(crate) fn new(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let cpu_bound_limit = config.cpu_bound_limit();

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.worker_threads)
            .thread_name("io-engine-worker")
            .thread_stack_size(config.stack_size)
            .enable_all()
            .build()?;
        let dispatcher = runtime.handle().clone();

        let keep_alive = CancellationToken::new();
        let (faults_tx, faults_rx) = mpsc::unbounded_channel();

        let driver = {
            let dispatcher = dispatcher.clone();
            let keep_alive = keep_alive.clone();
            let hook = config.fault_hook.clone();
            thread::Builder::new()
                .name("io-engine-driver".to_string())
                .spawn(move || run_event_loop(dispatcher, keep_alive, faults_rx, hook))?
        };

        tracing::info!(
            worker_threads = config.worker_threads,
            cpu_bound_limit,
            "I/O engine started"
        );

        Ok(Self {
            dispatcher,
            runtime: Mutex::new(Some(runtime)),
            keep_alive,
            faults: faults_tx,
            threads: Mutex::new(vec![driver]),
            permits: Arc::new(PermitPool::new(cpu_bound_limit)),
            coroutines: CoroutineRegistry::new(),
            accepting: AtomicBool::new(true),
            worker_threads: config.worker_threads,
            shutdown_timeout: config.shutdown_timeout,
        })
    }

    /// Runtime handle for binding sockets and timers.
    pub fn dispatcher(&self) -> &Handle {
        &self.dispatcher
    }

    pub fn permits(&self) -> &Arc<PermitPool> {
        &self.permits
    }

    pub fn coroutines(&self) -> &Arc<CoroutineRegistry> {
        &self.coroutines
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Spawn a coroutine on the worker pool.
    pub fn spawn<F>(&self, fut: F) -> Result<CoroutineHandle<F::Output>, EngineError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if !self.is_accepting() {
            return Err(EngineError::ShuttingDown);
        }
        Ok(coroutine::spawn_coroutine(
            &self.dispatcher,
            &self.coroutines,
            self.faults.clone(),
            fut,
        ))
    }

    /// Run a plain callback on a worker thread.
    pub fn post<F>(&self, f: F) -> Result<(), EngineError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.spawn(async move { f() }).map(drop)
    }

    /// Acquire a CPU-bound work guard from this engine's pool.
    pub async fn cpu_bound_work(&self) -> Result<CpuBoundWork, PermitError> {
        CpuBoundWork::acquire(&self.permits).await
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            worker_threads: self.worker_threads,
            cpu_bound_limit: self.permits.limit(),
            available_permits: self.permits.available(),
            held_permits: self.permits.held(),
            peak_permits: self.permits.peak(),
            coroutines: self.coroutines.len(),
            accepting: self.is_accepting(),
        }
    }

    /// Stop the engine. Idempotent.
    ///
    /// New spawns fail from here on, pending permit acquirers get
    /// `PermitError::Closed`, and outstanding coroutines are dropped once the
    /// driver has exited. Blocks for at most the configured shutdown timeout
    /// unless called from inside the runtime, where the runtime is shut down
    /// in the background instead. Safe to call from a `FaultHook`; the driver
    /// thread is then left to exit on its own.
    pub fn shutdown(&self) {
        if !self.accepting.swap(false, Ordering::AcqRel) {
            return;
        }
        tracing::info!(
            outstanding = self.coroutines.len(),
            oldest = ?self.coroutines.oldest(),
            "Shutting down I/O engine"
        );

        self.permits.close();
        self.keep_alive.cancel();

        let threads = match self.threads.lock() {
            Ok(mut threads) => std::mem::take(&mut *threads),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        let current = thread::current().id();
        for thread in threads {
            // A fault hook shutting the engine down runs on the driver itself.
            if thread.thread().id() == current {
                continue;
            }
            if thread.join().is_err() {
                tracing::error!("Engine driver thread panicked during shutdown");
            }
        }

        let runtime = match self.runtime.lock() {
            Ok(mut runtime) => runtime.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(runtime) = runtime {
            if Handle::try_current().is_ok() {
                tracing::warn!("Engine shut down from inside its runtime, not waiting for workers");
                runtime.shutdown_background();
            } else {
                runtime.shutdown_timeout(self.shutdown_timeout);
            }
        }

        tracing::info!(remaining = self.coroutines.len(), "I/O engine stopped");
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").field("stats", &self.stats()).finish()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Driver thread body.
///
/// Rethrown faults unwind out of the driver future and are caught here; the
/// loop then restarts. Cancelling `keep_alive` ends it.
fn run_event_loop(
    dispatcher: Handle,
    keep_alive: CancellationToken,
    mut faults: mpsc::UnboundedReceiver<CoroutineFault>,
    hook: Option<FaultHook>,
) {
    loop {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            dispatcher.block_on(drive(&mut faults, &keep_alive))
        }));

        match outcome {
            Ok(()) => break,
            Err(payload) => match payload.downcast::<CoroutineFault>() {
                Ok(fault) => {
                    tracing::error!(
                        coroutine = %fault.coroutine(),
                        error = %fault.message(),
                        "Exception in coroutine, restarting event loop"
                    );
                    if let Some(hook) = &hook {
                        hook(&fault);
                    }
                }
                Err(other) => {
                    tracing::error!(
                        error = %bridge::panic_message(other.as_ref()),
                        "Event loop panicked, restarting"
                    );
                }
            },
        }

        if keep_alive.is_cancelled() {
            break;
        }
        tracing::debug!("Event loop restarted");
    }

    tracing::debug!("Event loop exited");
}

async fn drive(
    faults: &mut mpsc::UnboundedReceiver<CoroutineFault>,
    keep_alive: &CancellationToken,
) {
    tokio::select! {
        biased;

        Some(fault) = faults.recv() => fault.rethrow(),
        _ = keep_alive.cancelled() => {}
    }
}
