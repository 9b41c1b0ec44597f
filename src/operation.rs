//! Cancellable, awaitable units of scheduled work.
//!
//! Every `schedule*` entry point of the platform returns an
//! [`OperationHandle`]: a shared reference to one unit of work that the
//! caller may cancel or block on.
//!
//! # Lifecycle
//!
//! ```text
//! Pending ──perform──▶ Running ──▶ Completed
//!    │
//!    └──cancel──▶ Cancelled
//! ```
//!
//! `Running → Cancelled` does not exist: once started, work runs to the end.
//! Waiters treat `Cancelled` exactly like `Completed`.
//!
//! # Locking
//!
//! All state transitions happen under a single lock shared by every
//! operation of a platform (the [`OperationRegistry`] lock), and each
//! operation's condition variable waits on that lock. The lock is never held
//! while a closure runs, only while flipping state and signalling.

use crate::runtime::main_loop::{DestroyNotify, MainContext, Priority, Source, SourceId};
use crate::runtime::worker_pool::{panic_message, WorkerPool};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Work carried by an operation.
pub type Work = Box<dyn FnOnce() + Send + 'static>;

/// Shared handle to a scheduled operation.
pub type OperationHandle = Arc<dyn Operation>;

/// Identifier of an operation, unique within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OperationId(u64);

impl OperationId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric id.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

/// Lifecycle state of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OperationState {
    /// Scheduled, not started.
    Pending = 0,
    /// The closure is executing.
    Running = 1,
    /// The closure has returned.
    Completed = 2,
    /// Cancelled before it started; the closure will never run.
    Cancelled = 3,
}

impl OperationState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Pending,
            1 => Self::Running,
            2 => Self::Completed,
            _ => Self::Cancelled,
        }
    }

    /// Returns `true` for `Completed` and `Cancelled`.
    #[must_use]
    pub const fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

/// Where an operation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// Dispatched by the foreground loop.
    MainThread,
    /// Run by the worker pool.
    Pool,
    /// Submitted to the worker pool by a delayed foreground timer.
    DelayedPool,
}

/// A cancellable, awaitable unit of work.
pub trait Operation: Send + Sync + fmt::Debug {
    /// The operation's id.
    fn id(&self) -> OperationId;

    /// Where the operation runs.
    fn kind(&self) -> OperationKind;

    /// Current lifecycle state.
    fn state(&self) -> OperationState;

    /// Cancels the operation if it has not started.
    ///
    /// Returns `true` if this call moved it from `Pending` to `Cancelled`,
    /// in which case its closure will never run.
    fn cancel(&self) -> bool;

    /// Blocks until the operation is completed or cancelled.
    ///
    /// Must not be called on the thread that would run the operation.
    fn wait(&self);

    /// Like [`wait`](Self::wait) with a bound. Returns `true` if the
    /// operation finished in time.
    fn wait_timeout(&self, timeout: Duration) -> bool;

    /// Returns `true` once completed or cancelled.
    fn is_finished(&self) -> bool {
        self.state().is_finished()
    }
}

/// The platform lock and the registry of live foreground operations.
#[derive(Default)]
pub struct OperationRegistry {
    live: Mutex<HashMap<OperationId, Arc<MainThreadOperation>>>,
}

impl OperationRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of foreground operations that are pending or running.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live.lock().len()
    }

    /// Cancels every foreground operation still registered.
    ///
    /// Returns how many were cancelled before they started.
    pub fn cancel_all(&self) -> usize {
        let remaining: Vec<_> = self.live.lock().values().cloned().collect();
        remaining.iter().filter(|op| op.cancel()).count()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<OperationId, Arc<MainThreadOperation>>> {
        self.live.lock()
    }
}

impl fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationRegistry")
            .field("live", &self.live_count())
            .finish()
    }
}

/// Completion flag, condition variable and closure slot shared by the
/// operation variants.
struct Completion {
    id: OperationId,
    registry: Arc<OperationRegistry>,
    registered: bool,
    state: AtomicU8,
    work: Mutex<Option<Work>>,
    completed: Condvar,
}

impl Completion {
    fn new(registry: Arc<OperationRegistry>, registered: bool, work: Work) -> Self {
        Self {
            id: OperationId::next(),
            registry,
            registered,
            state: AtomicU8::new(OperationState::Pending as u8),
            work: Mutex::new(Some(work)),
            completed: Condvar::new(),
        }
    }

    fn state(&self) -> OperationState {
        OperationState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set(&self, state: OperationState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Runs the closure unless the operation was cancelled first.
    fn perform(&self) {
        {
            let _live = self.registry.lock();
            if self.state() != OperationState::Pending {
                return;
            }
            self.set(OperationState::Running);
        }

        let work = self.work.lock().take();
        if let Some(work) = work {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(work)) {
                tracing::error!(
                    op = %self.id,
                    panic = %panic_message(payload.as_ref()),
                    "operation closure panicked"
                );
            }
        }

        let mut live = self.registry.lock();
        self.set(OperationState::Completed);
        let registered = if self.registered {
            live.remove(&self.id)
        } else {
            None
        };
        self.completed.notify_all();
        drop(live);
        drop(registered);
        tracing::trace!(op = %self.id, "operation completed");
    }

    /// `Pending → Cancelled`. Returns `false` if already started or done.
    fn cancel_pending(&self) -> bool {
        let mut live = self.registry.lock();
        if self.state() != OperationState::Pending {
            return false;
        }
        self.set(OperationState::Cancelled);
        let registered = if self.registered {
            live.remove(&self.id)
        } else {
            None
        };
        self.completed.notify_all();
        drop(live);
        drop(registered);
        drop(self.work.lock().take());
        true
    }

    fn wait(&self) {
        let mut live = self.registry.lock();
        while !self.state().is_finished() {
            self.completed.wait(&mut live);
        }
    }

    fn wait_for(&self, timeout: Duration) -> bool {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.wait_until(deadline),
            None => {
                self.wait();
                true
            }
        }
    }

    fn wait_until(&self, deadline: Instant) -> bool {
        let mut live = self.registry.lock();
        while !self.state().is_finished() {
            if self.completed.wait_until(&mut live, deadline).timed_out() {
                return self.state().is_finished();
            }
        }
        true
    }
}

/// Work dispatched by the foreground loop.
pub struct MainThreadOperation {
    completion: Completion,
    context: Arc<MainContext>,
    source: Mutex<Option<SourceId>>,
}

impl MainThreadOperation {
    /// Registers `work` and attaches `source` to `context` to run it.
    ///
    /// If the loop has already quit, or quits before dispatching the
    /// source, the operation ends up `Cancelled`.
    pub fn schedule(
        registry: &Arc<OperationRegistry>,
        context: &Arc<MainContext>,
        source: Source,
        work: Work,
    ) -> Arc<Self> {
        let op = Arc::new(Self {
            completion: Completion::new(Arc::clone(registry), true, work),
            context: Arc::clone(context),
            source: Mutex::new(None),
        });
        registry.lock().insert(op.id(), Arc::clone(&op));

        let dispatched = Arc::clone(&op);
        let discarded = Arc::clone(&op);
        let on_discard: DestroyNotify = Box::new(move || {
            discarded.completion.cancel_pending();
        });
        match context.attach(
            source,
            Box::new(move || dispatched.perform()),
            Some(on_discard),
        ) {
            Ok(id) => {
                let mut slot = op.source.lock();
                if op.is_finished() {
                    drop(slot);
                    context.destroy(id);
                } else {
                    *slot = Some(id);
                }
                tracing::trace!(
                    op = %op.id(),
                    source = %id,
                    priority = ?source.priority(),
                    "foreground operation scheduled"
                );
            }
            Err(_) => {
                op.completion.cancel_pending();
                tracing::debug!(op = %op.id(), "foreground loop has quit; operation cancelled");
            }
        }
        op
    }

    /// Runs the closure on the calling (foreground) thread.
    pub fn perform(&self) {
        self.source.lock().take();
        self.completion.perform();
    }
}

impl fmt::Debug for MainThreadOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MainThreadOperation")
            .field("id", &self.completion.id)
            .field("state", &self.completion.state())
            .field("source", &*self.source.lock())
            .finish()
    }
}

impl Operation for MainThreadOperation {
    fn id(&self) -> OperationId {
        self.completion.id
    }

    fn kind(&self) -> OperationKind {
        OperationKind::MainThread
    }

    fn state(&self) -> OperationState {
        self.completion.state()
    }

    fn cancel(&self) -> bool {
        let cancelled = self.completion.cancel_pending();
        let source = self.source.lock().take();
        if let Some(source) = source {
            self.context.destroy(source);
        }
        tracing::debug!(op = %self.id(), cancelled, "foreground operation cancel");
        cancelled
    }

    fn wait(&self) {
        self.completion.wait();
    }

    fn wait_timeout(&self, timeout: Duration) -> bool {
        self.completion.wait_for(timeout)
    }
}

/// Work run by the worker pool.
///
/// Cancellation has no effect once submitted: the closure is already in
/// the pool's queue and will run to completion. The only way it ends up
/// `Cancelled` is the pool shutting down before a worker picked it up.
pub struct PoolOperation {
    completion: Completion,
}

impl PoolOperation {
    /// Submits `work` to `pool`.
    ///
    /// If the pool has shut down the returned operation is `Cancelled`.
    pub fn schedule(registry: &Arc<OperationRegistry>, pool: &WorkerPool, work: Work) -> Arc<Self> {
        let op = Arc::new(Self {
            completion: Completion::new(Arc::clone(registry), false, work),
        });
        let queued = Arc::clone(&op);
        let discarded = Arc::clone(&op);
        let on_discard: DestroyNotify = Box::new(move || {
            discarded.completion.cancel_pending();
        });
        if pool.push(move || queued.completion.perform(), Some(on_discard)) {
            tracing::trace!(op = %op.id(), "pool operation scheduled");
        } else {
            op.completion.cancel_pending();
            tracing::debug!(op = %op.id(), "worker pool has shut down; operation cancelled");
        }
        op
    }
}

impl fmt::Debug for PoolOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolOperation")
            .field("id", &self.completion.id)
            .field("state", &self.completion.state())
            .finish()
    }
}

impl Operation for PoolOperation {
    fn id(&self) -> OperationId {
        self.completion.id
    }

    fn kind(&self) -> OperationKind {
        OperationKind::Pool
    }

    fn state(&self) -> OperationState {
        self.completion.state()
    }

    fn cancel(&self) -> bool {
        tracing::debug!(op = %self.id(), "pool operations cannot be cancelled once submitted");
        false
    }

    fn wait(&self) {
        self.completion.wait();
    }

    fn wait_timeout(&self, timeout: Duration) -> bool {
        self.completion.wait_for(timeout)
    }
}

/// Pool work submitted after a delay by a high-priority foreground timer.
///
/// Cancelling before the delay elapses detaches the timer so the work is
/// never submitted. Waiting blocks until the timer was cancelled or the
/// submitted pool operation finished.
pub struct DelayedPoolOperation {
    id: OperationId,
    timer: Arc<MainThreadOperation>,
    inner: Arc<Mutex<Option<Arc<PoolOperation>>>>,
}

impl DelayedPoolOperation {
    /// Arms the timer that will submit `work` to `pool`.
    pub fn schedule(
        registry: &Arc<OperationRegistry>,
        context: &Arc<MainContext>,
        pool: &Arc<WorkerPool>,
        delay: Duration,
        work: Work,
    ) -> Arc<Self> {
        let inner = Arc::new(Mutex::new(None));
        let submit = {
            let registry = Arc::clone(registry);
            let pool = Arc::clone(pool);
            let slot = Arc::clone(&inner);
            Box::new(move || {
                let op = PoolOperation::schedule(&registry, &pool, work);
                *slot.lock() = Some(op);
            })
        };
        let timer = MainThreadOperation::schedule(
            registry,
            context,
            Source::timeout(delay, Priority::High),
            submit,
        );
        Arc::new(Self {
            id: OperationId::next(),
            timer,
            inner,
        })
    }

    /// The pool operation, once the timer has submitted it.
    #[must_use]
    pub fn submitted(&self) -> Option<Arc<PoolOperation>> {
        self.inner.lock().clone()
    }
}

impl fmt::Debug for DelayedPoolOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelayedPoolOperation")
            .field("id", &self.id)
            .field("timer", &self.timer)
            .field("inner", &*self.inner.lock())
            .finish()
    }
}

impl Operation for DelayedPoolOperation {
    fn id(&self) -> OperationId {
        self.id
    }

    fn kind(&self) -> OperationKind {
        OperationKind::DelayedPool
    }

    fn state(&self) -> OperationState {
        match self.timer.state() {
            OperationState::Completed => self
                .submitted()
                .map_or(OperationState::Cancelled, |op| op.state()),
            OperationState::Running => OperationState::Pending,
            other => other,
        }
    }

    fn cancel(&self) -> bool {
        self.timer.cancel()
    }

    fn wait(&self) {
        self.timer.wait();
        if let Some(op) = self.submitted() {
            op.wait();
        }
    }

    fn wait_timeout(&self, timeout: Duration) -> bool {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            self.wait();
            return true;
        };
        if !self.timer.completion.wait_until(deadline) {
            return false;
        }
        match self.submitted() {
            Some(op) => op.completion.wait_until(deadline),
            None => true,
        }
    }
}
