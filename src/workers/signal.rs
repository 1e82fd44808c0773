use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Level-triggered stop flag shared by every worker of a run.
///
/// Once set it stays set; a new run needs a new signal. Clones share the same
/// flag.
#[derive(Clone, Default)]
pub struct StopSignal {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    flag: Mutex<bool>,
    changed: Condvar,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the flag and wakes every waiter. Returns `true` only for the call
    /// that actually flipped it.
    pub fn set(&self) -> bool {
        let mut flag = self.flag();
        if *flag {
            return false;
        }
        *flag = true;
        drop(flag);
        self.inner.changed.notify_all();
        true
    }

    pub fn is_set(&self) -> bool {
        *self.flag()
    }

    /// Blocks until the flag is set.
    pub fn wait(&self) {
        let mut flag = self.flag();
        while !*flag {
            flag = self
                .inner
                .changed
                .wait(flag)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Blocks until the flag is set or `timeout` elapses; returns whether it is set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut flag = self.flag();
        while !*flag {
            let remaining = match deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                None => timeout,
            };
            if remaining.is_zero() {
                break;
            }
            flag = self
                .inner
                .changed
                .wait_timeout(flag, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        *flag
    }

    fn flag(&self) -> MutexGuard<'_, bool> {
        self.inner.flag.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for StopSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StopSignal")
            .field("set", &self.is_set())
            .finish()
    }
}
