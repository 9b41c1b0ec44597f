//! Engine-facing mutexes backed by host blocking primitives.
//!
//! The engine drives its locks with explicit `lock()` / `unlock()` calls
//! rather than RAII guards, so these types keep their ownership state in a
//! small word protected by a `parking_lot` mutex and park contending threads
//! on a `parking_lot` condition variable. No spinning or polling is involved:
//! a blocked `lock()` sleeps until an `unlock()` hands the lock over.
//!
//! [`HostCondvar`](super::HostCondvar) waits on a [`HostMutex`] by releasing
//! the ownership word and parking on the *same* inner mutex, which makes the
//! release-and-wait step atomic with respect to `notify_*` callers that hold
//! the engine mutex.
//!
//! `parking_lot::RawMutex` offers the same explicit lock and unlock calls,
//! but `parking_lot::Condvar` only waits on a `MutexGuard`, so a raw mutex
//! could not be released and re-acquired as part of a condition wait.

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::fmt;
use std::thread::{self, ThreadId};

/// Engine mutex interface (`Lock` / `Unlock` / `TryLock`).
pub trait MutexImpl: Send + Sync + fmt::Debug {
    /// Blocks until the mutex is owned by the caller.
    fn lock(&self);

    /// Releases the mutex.
    ///
    /// # Panics
    ///
    /// Panics if the mutex is not currently locked.
    fn unlock(&self);

    /// Acquires the mutex without blocking. Returns `true` on success.
    fn try_lock(&self) -> bool;

    /// Returns the plain mutex behind this implementation, if it is one.
    ///
    /// Condition variables only pair with plain mutexes.
    fn as_plain(&self) -> Option<&HostMutex> {
        None
    }
}

/// Non-recursive mutex.
///
/// Locking twice from the same thread deadlocks, exactly like the host's
/// plain mutex.
pub struct HostMutex {
    locked: Mutex<bool>,
    released: Condvar,
}

impl HostMutex {
    /// Creates an unlocked mutex.
    #[must_use]
    pub fn new() -> Self {
        Self {
            locked: Mutex::new(false),
            released: Condvar::new(),
        }
    }

    /// Returns `true` if some thread currently owns the mutex.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        *self.locked.lock()
    }

    /// Grants ownership again after a condition-variable wait.
    ///
    /// Called with the inner state guard held; parks on `released` until the
    /// ownership word is clear.
    pub(super) fn reacquire(&self, state: &mut MutexGuard<'_, bool>) {
        while **state {
            self.released.wait(state);
        }
        **state = true;
    }

    /// Clears the ownership word and wakes one contender.
    pub(super) fn release(&self, state: &mut MutexGuard<'_, bool>) {
        assert!(**state, "unlock of an unlocked mutex");
        **state = false;
        self.released.notify_one();
    }

    pub(super) fn state(&self) -> MutexGuard<'_, bool> {
        self.locked.lock()
    }
}

impl Default for HostMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HostMutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostMutex")
            .field("locked", &self.is_locked())
            .finish()
    }
}

impl MutexImpl for HostMutex {
    fn lock(&self) {
        let mut state = self.locked.lock();
        self.reacquire(&mut state);
    }

    fn unlock(&self) {
        let mut state = self.locked.lock();
        self.release(&mut state);
    }

    fn try_lock(&self) -> bool {
        let mut state = self.locked.lock();
        if *state {
            false
        } else {
            *state = true;
            true
        }
    }

    fn as_plain(&self) -> Option<&HostMutex> {
        Some(self)
    }
}

#[derive(Debug, Default)]
struct Ownership {
    owner: Option<ThreadId>,
    depth: usize,
}

/// Recursive mutex: the owning thread may lock it again without blocking.
///
/// Every `lock()` must be matched by an `unlock()` from the owning thread.
pub struct HostRecursiveMutex {
    state: Mutex<Ownership>,
    released: Condvar,
}

impl HostRecursiveMutex {
    /// Creates an unlocked recursive mutex.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(Ownership::default()),
            released: Condvar::new(),
        }
    }

    /// Returns how many times the current owner has locked the mutex.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.state.lock().depth
    }

    /// Returns `true` if the calling thread owns the mutex.
    #[must_use]
    pub fn is_held_by_current_thread(&self) -> bool {
        self.state.lock().owner == Some(thread::current().id())
    }
}

impl Default for HostRecursiveMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HostRecursiveMutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("HostRecursiveMutex")
            .field("owner", &state.owner)
            .field("depth", &state.depth)
            .finish()
    }
}

impl MutexImpl for HostRecursiveMutex {
    fn lock(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.owner == Some(me) {
            state.depth += 1;
            return;
        }
        while state.owner.is_some() {
            self.released.wait(&mut state);
        }
        state.owner = Some(me);
        state.depth = 1;
    }

    fn unlock(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        assert!(
            state.owner == Some(me),
            "recursive mutex unlocked by a thread that does not own it"
        );
        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
            drop(state);
            self.released.notify_one();
        }
    }

    fn try_lock(&self) -> bool {
        let me = thread::current().id();
        let mut state = self.state.lock();
        match state.owner {
            Some(owner) if owner == me => {
                state.depth += 1;
                true
            }
            Some(_) => false,
            None => {
                state.owner = Some(me);
                state.depth = 1;
                true
            }
        }
    }
}
