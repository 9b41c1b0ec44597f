//! Engine-facing condition variable.

use super::mutex::{HostMutex, MutexImpl};
use parking_lot::Condvar;
use std::fmt;
use std::time::{Duration, Instant};

/// Engine condition-variable interface.
pub trait ConditionVariableImpl: Send + Sync + fmt::Debug {
    /// Wakes one waiter, if any.
    fn notify_one(&self);

    /// Wakes every waiter.
    fn notify_all(&self);

    /// Atomically releases `mutex`, waits for a notification, and re-locks.
    ///
    /// Spurious wakeups are possible; callers re-check their predicate.
    ///
    /// # Panics
    ///
    /// Panics if `mutex` is not a plain mutex or is not locked.
    fn wait(&self, mutex: &dyn MutexImpl);

    /// Like [`wait`](Self::wait) with a relative timeout.
    ///
    /// The absolute deadline is computed from the monotonic clock at call
    /// time. Returns `true` if the deadline passed without a notification.
    /// A delta too large to represent as a deadline waits without a bound.
    fn wait_for(&self, mutex: &dyn MutexImpl, delta: Duration) -> bool;
}

/// Condition variable that pairs with [`HostMutex`].
#[derive(Default)]
pub struct HostCondvar {
    cond: Condvar,
}

impl HostCondvar {
    /// Creates a condition variable with no waiters.
    #[must_use]
    pub fn new() -> Self {
        Self {
            cond: Condvar::new(),
        }
    }

    fn plain(mutex: &dyn MutexImpl) -> &HostMutex {
        match mutex.as_plain() {
            Some(plain) => plain,
            None => panic!("condition variables wait on plain mutexes only"),
        }
    }
}

impl fmt::Debug for HostCondvar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostCondvar").finish_non_exhaustive()
    }
}

impl ConditionVariableImpl for HostCondvar {
    fn notify_one(&self) {
        self.cond.notify_one();
    }

    fn notify_all(&self) {
        self.cond.notify_all();
    }

    fn wait(&self, mutex: &dyn MutexImpl) {
        let mutex = Self::plain(mutex);
        let mut state = mutex.state();
        mutex.release(&mut state);
        self.cond.wait(&mut state);
        mutex.reacquire(&mut state);
    }

    fn wait_for(&self, mutex: &dyn MutexImpl, delta: Duration) -> bool {
        let Some(deadline) = Instant::now().checked_add(delta) else {
            self.wait(mutex);
            return false;
        };
        let mutex = Self::plain(mutex);
        let mut state = mutex.state();
        mutex.release(&mut state);
        let result = self.cond.wait_until(&mut state, deadline);
        mutex.reacquire(&mut state);
        result.timed_out()
    }
}
