//! Engine-side contracts the platform drives.
//!
//! The platform never looks inside an engine instance. It only needs an
//! identity to key runners by, an execution lock that serializes work on
//! the instance, and scope hooks that bracket every task it runs.

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identity of an engine instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EngineId(u64);

impl EngineId {
    /// Allocates a process-unique id.
    #[must_use]
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric id.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "engine#{}", self.0)
    }
}

/// The engine's execution lock.
///
/// Reentrant, because engine callbacks running under the lock may post
/// tasks that briefly take it again on the same thread.
#[derive(Default)]
pub struct ExecutionLock {
    inner: ReentrantMutex<()>,
}

impl ExecutionLock {
    /// Creates an unlocked execution lock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until the calling thread holds the lock.
    pub fn lock(&self) -> ExecutionGuard<'_> {
        ExecutionGuard {
            _guard: self.inner.lock(),
        }
    }

    /// Returns `true` if some thread holds the lock.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }

    /// Returns `true` if the calling thread holds the lock.
    #[must_use]
    pub fn is_owned_by_current_thread(&self) -> bool {
        self.inner.is_owned_by_current_thread()
    }
}

impl fmt::Debug for ExecutionLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionLock")
            .field("locked", &self.is_locked())
            .finish()
    }
}

/// Holds an [`ExecutionLock`] until dropped.
#[must_use = "the execution lock is released when the guard is dropped"]
pub struct ExecutionGuard<'a> {
    _guard: ReentrantMutexGuard<'a, ()>,
}

impl fmt::Debug for ExecutionGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionGuard").finish_non_exhaustive()
    }
}

/// An engine instance as seen by the platform.
///
/// `enter` and `exit` bracket every task run on the instance's behalf and
/// are always called with the execution lock held. `exit` runs even when
/// the task panics.
pub trait EngineInstance: Send + Sync + 'static {
    /// Stable identity used to key the instance's task runner.
    fn id(&self) -> EngineId;

    /// The lock serializing all work on this instance.
    fn execution_lock(&self) -> &ExecutionLock;

    /// Opens the instance's execution scope.
    fn enter(&self) {}

    /// Closes the scope opened by [`enter`](Self::enter).
    fn exit(&self) {}

    /// Releases per-instance resources when the platform tears down.
    fn dispose(&self) {}
}

/// A unit of engine work.
pub trait Task: Send {
    /// Runs the task, consuming it.
    fn run(self: Box<Self>);
}

impl<F> Task for F
where
    F: FnOnce() + Send,
{
    fn run(self: Box<Self>) {
        (*self)();
    }
}

/// Engine work run when the foreground thread is otherwise idle.
pub trait IdleTask: Send {
    /// Runs the task. It should return before `deadline_in_seconds`, a
    /// point on the platform's monotonic clock.
    fn run(self: Box<Self>, deadline_in_seconds: f64);
}

impl<F> IdleTask for F
where
    F: FnOnce(f64) + Send,
{
    fn run(self: Box<Self>, deadline_in_seconds: f64) {
        (*self)(deadline_in_seconds);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn init_test(name: &str) {
        crate::test_utils::init_test_logging();
        crate::test_phase!(name);
    }

    #[test]
    fn engine_ids_are_unique() {
        init_test("engine_ids_are_unique");
        let a = EngineId::next();
        let b = EngineId::next();
        crate::assert_with_log!(a != b, "distinct", "a != b", (a, b));
        crate::test_complete!("engine_ids_are_unique");
    }

    #[test]
    fn execution_lock_is_reentrant_and_exclusive() {
        init_test("execution_lock_is_reentrant_and_exclusive");
        let lock = Arc::new(ExecutionLock::new());
        let outer = lock.lock();
        let inner = lock.lock();
        let owned = lock.is_owned_by_current_thread();
        crate::assert_with_log!(owned, "owned", true, owned);

        let other = Arc::clone(&lock);
        let foreign = std::thread::spawn(move || other.is_owned_by_current_thread())
            .join()
            .expect("thread panicked");
        crate::assert_with_log!(!foreign, "not owned elsewhere", false, foreign);

        drop(inner);
        drop(outer);
        crate::assert_with_log!(!lock.is_locked(), "released", false, lock.is_locked());
        crate::test_complete!("execution_lock_is_reentrant_and_exclusive");
    }

    #[test]
    fn closures_are_tasks() {
        init_test("closures_are_tasks");
        let hit = Arc::new(parking_lot::Mutex::new(None));
        let h = Arc::clone(&hit);
        let task: Box<dyn Task> = Box::new(move || *h.lock() = Some(0.0));
        task.run();
        let h = Arc::clone(&hit);
        let idle: Box<dyn IdleTask> = Box::new(move |deadline: f64| *h.lock() = Some(deadline));
        idle.run(1.5);
        let seen = *hit.lock();
        crate::assert_with_log!(seen == Some(1.5), "deadline passed", Some(1.5), seen);
        crate::test_complete!("closures_are_tasks");
    }
}
