//! CPU-bound work admission.
//!
//! - `PermitPool` bounds how many coroutines compute at once
//! - `CpuBoundWork` holds one permit for a CPU-heavy section
//! - `IoBoundWorkSlot` lends that permit back while the section waits on I/O

mod pool;
mod work;

pub use pool::{CpuPermit, PermitError, PermitPool};
pub use work::{CpuBoundWork, IoBoundWorkSlot};
