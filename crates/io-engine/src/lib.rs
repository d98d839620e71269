//! io-engine: async I/O engine with bounded CPU-bound work admission.
//!
//! Coroutines are tokio tasks multiplexed over a fixed worker pool. CPU-heavy
//! sections take a permit from a pool sized below the worker count, so at
//! least one worker stays free to dispatch I/O.

pub mod bridge;
pub mod condvar;
pub mod coroutine;
pub mod engine;
pub mod permit;

pub use bridge::{CoroutineFault, ForcedUnwind, unwind_coroutine};
pub use condvar::ConditionVariable;
pub use coroutine::{CoroutineError, CoroutineHandle, CoroutineId, CoroutineRegistry};
pub use engine::{Engine, EngineConfig, EngineError, EngineStats, FaultHook};
pub use permit::{CpuBoundWork, CpuPermit, IoBoundWorkSlot, PermitError, PermitPool};
