//! Condition variable which doesn't block I/O threads.

use tokio::sync::watch;

#[derive(Debug, Clone, Copy)]
struct Signal {
    set: bool,
    /// Bumped on every pending -> signaled transition.
    generation: u64,
}

/// Level-triggered signal that coroutines can wait on.
///
/// While set, `wait()` returns immediately. While pending, `wait()` suspends
/// until the next `set()`, even if a `clear()` follows before the waiter runs.
pub struct ConditionVariable {
    state: watch::Sender<Signal>,
}

impl ConditionVariable {
    pub fn new(signaled: bool) -> Self {
        let (state, _) = watch::channel(Signal {
            set: signaled,
            generation: 0,
        });
        Self { state }
    }

    /// Wake every waiter and let future waits pass until `clear()`.
    pub fn set(&self) {
        self.state.send_if_modified(|signal| {
            if signal.set {
                return false;
            }
            signal.set = true;
            signal.generation = signal.generation.wrapping_add(1);
            true
        });
    }

    pub fn clear(&self) {
        self.state
            .send_if_modified(|signal| std::mem::replace(&mut signal.set, false));
    }

    pub fn is_set(&self) -> bool {
        self.state.borrow().set
    }

    pub async fn wait(&self) {
        let mut rx = self.state.subscribe();
        let seen = {
            let signal = rx.borrow_and_update();
            if signal.set {
                return;
            }
            signal.generation
        };

        if rx
            .wait_for(|signal| signal.set || signal.generation != seen)
            .await
            .is_err()
        {
            tracing::trace!("Condition variable closed, treating as wake");
        }
    }
}

impl Default for ConditionVariable {
    fn default() -> Self {
        Self::new(false)
    }
}

impl std::fmt::Debug for ConditionVariable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConditionVariable")
            .field("set", &self.is_set())
            .finish()
    }
}
