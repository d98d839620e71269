//! Panic bridging between coroutine bodies and the engine driver.
//!
//! A panic escaping a coroutine is caught at the task boundary, wrapped in a
//! `CoroutineFault` with its original payload, and shipped to the driver
//! thread, which rethrows it so it surfaces where the event loop is run.
//!
//! `ForcedUnwind` is the one payload that is never bridged: it tears a
//! coroutine down and always propagates untouched.

use std::any::Any;
use std::panic;

use crate::coroutine::CoroutineId;

/// Panic payload used to abandon a coroutine without reporting a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForcedUnwind;

/// Unwind the current coroutine's stack.
///
/// Destructors run (guards release their permits) and the coroutine's handle
/// reports `CoroutineError::Unwound`. The panic hook is not invoked.
pub fn unwind_coroutine() -> ! {
    panic::resume_unwind(Box::new(ForcedUnwind))
}

/// A panic caught in a coroutine body, carrying the original payload.
pub struct CoroutineFault {
    coroutine: CoroutineId,
    payload: Box<dyn Any + Send>,
}

impl CoroutineFault {
    pub(crate) fn new(coroutine: CoroutineId, payload: Box<dyn Any + Send>) -> Self {
        Self { coroutine, payload }
    }

    pub fn coroutine(&self) -> CoroutineId {
        self.coroutine
    }

    /// Panic message, if the payload is a string.
    pub fn message(&self) -> String {
        panic_message(self.payload.as_ref())
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }

    pub fn into_payload(self) -> Box<dyn Any + Send> {
        self.payload
    }

    /// Resume unwinding on the current thread with this fault as payload.
    pub fn rethrow(self) -> ! {
        panic::resume_unwind(Box::new(self))
    }
}

impl std::fmt::Debug for CoroutineFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoroutineFault")
            .field("coroutine", &self.coroutine)
            .field("message", &self.message())
            .finish()
    }
}

pub(crate) enum Disposition {
    Fault(CoroutineFault),
    Unwind(Box<dyn Any + Send>),
}

pub(crate) fn classify(coroutine: CoroutineId, payload: Box<dyn Any + Send>) -> Disposition {
    if payload.is::<ForcedUnwind>() {
        Disposition::Unwind(payload)
    } else {
        Disposition::Fault(CoroutineFault::new(coroutine, payload))
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(fault) = payload.downcast_ref::<CoroutineFault>() {
        fault.message()
    } else {
        "non-string panic payload".to_string()
    }
}
