//! Per-engine foreground task runner.
//!
//! The engine posts three task shapes to its runner: plain tasks, delayed
//! tasks and idle tasks. Each becomes a foreground operation whose closure
//! takes the engine's [`ExecutionLock`](crate::ExecutionLock), opens the
//! engine scope, runs the task and closes the scope again, even if the task
//! panics. Tasks for one engine instance therefore never overlap, whichever
//! threads they were posted from.

use crate::clock::PlatformClock;
use crate::engine::{EngineId, EngineInstance, IdleTask, Task};
use crate::error::{PlatformError, Result};
use crate::operation::{Operation, OperationHandle, OperationId, Work};
use crate::platform::{delay_from_seconds, PlatformCore};
use crate::runtime::main_loop::{Priority, Source};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Closes the engine scope when dropped.
struct EngineScope<'a> {
    engine: &'a dyn EngineInstance,
}

impl<'a> EngineScope<'a> {
    fn enter(engine: &'a dyn EngineInstance) -> Self {
        engine.enter();
        Self { engine }
    }
}

impl Drop for EngineScope<'_> {
    fn drop(&mut self) {
        self.engine.exit();
    }
}

/// Runs `f` holding `engine`'s execution lock inside its scope.
fn run_locked<R>(engine: &dyn EngineInstance, f: impl FnOnce() -> R) -> R {
    let _lock = engine.execution_lock().lock();
    let _scope = EngineScope::enter(engine);
    f()
}

/// Task runner bound to one engine instance.
pub struct ForegroundTaskRunner {
    core: Weak<PlatformCore>,
    engine: Arc<dyn EngineInstance>,
    clock: PlatformClock,
    idle_frame_budget: Duration,
    pending: Mutex<HashMap<OperationId, OperationHandle>>,
    closed: AtomicBool,
}

impl ForegroundTaskRunner {
    pub(crate) fn new(
        core: Weak<PlatformCore>,
        engine: Arc<dyn EngineInstance>,
        clock: PlatformClock,
        idle_frame_budget: Duration,
    ) -> Self {
        Self {
            core,
            engine,
            clock,
            idle_frame_budget,
            pending: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// The engine this runner serves.
    #[must_use]
    pub fn engine_id(&self) -> EngineId {
        self.engine.id()
    }

    /// Idle tasks are always supported.
    #[must_use]
    pub fn idle_tasks_enabled(&self) -> bool {
        true
    }

    /// Returns `true` once the runner has been disposed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of posted tasks that have not finished yet.
    #[must_use]
    pub fn pending_tasks(&self) -> usize {
        self.pending
            .lock()
            .values()
            .filter(|op| !op.is_finished())
            .count()
    }

    /// Posts `task` to run on the foreground thread.
    ///
    /// # Errors
    ///
    /// [`PlatformError::ShutDown`] once the runner or its platform is gone.
    pub fn post_task(&self, task: Box<dyn Task>) -> Result<OperationHandle> {
        let engine = Arc::clone(&self.engine);
        self.post(
            Source::idle(Priority::Default),
            Box::new(move || run_locked(&*engine, || task.run())),
        )
    }

    /// Posts `task` to run no earlier than `delay_in_seconds` from now.
    ///
    /// Negative or NaN delays run as soon as possible.
    ///
    /// # Errors
    ///
    /// [`PlatformError::ShutDown`] once the runner or its platform is gone.
    pub fn post_delayed_task(
        &self,
        task: Box<dyn Task>,
        delay_in_seconds: f64,
    ) -> Result<OperationHandle> {
        let delay = delay_from_seconds(delay_in_seconds);
        let source = if delay.is_zero() {
            Source::idle(Priority::Default)
        } else {
            Source::timeout(delay, Priority::Default)
        };
        let engine = Arc::clone(&self.engine);
        self.post(
            source,
            Box::new(move || run_locked(&*engine, || task.run())),
        )
    }

    /// Posts an idle task at low priority.
    ///
    /// The task receives a deadline one idle frame past the moment it
    /// starts, on the platform's monotonic clock.
    ///
    /// # Errors
    ///
    /// [`PlatformError::ShutDown`] once the runner or its platform is gone.
    pub fn post_idle_task(&self, task: Box<dyn IdleTask>) -> Result<OperationHandle> {
        let engine = Arc::clone(&self.engine);
        let clock = self.clock;
        let budget = self.idle_frame_budget.as_secs_f64();
        self.post(
            Source::idle(Priority::Low),
            Box::new(move || {
                run_locked(&*engine, || {
                    let deadline = clock.monotonic_seconds() + budget;
                    task.run(deadline);
                });
            }),
        )
    }

    fn post(&self, source: Source, work: Work) -> Result<OperationHandle> {
        let core = self.core.upgrade().ok_or(PlatformError::ShutDown)?;
        // `dispose` flips `closed` under this lock, so an operation is either
        // refused here or visible to the drain that cancels it.
        let mut pending = self.pending.lock();
        if self.is_closed() {
            return Err(PlatformError::ShutDown);
        }
        let op: OperationHandle = core.schedule_source(source, work);
        pending.retain(|_, op| !op.is_finished());
        if !op.is_finished() {
            pending.insert(op.id(), Arc::clone(&op));
        }
        drop(pending);
        tracing::trace!(engine = %self.engine.id(), op = %op.id(), "task posted");
        Ok(op)
    }

    /// Closes the runner, cancels its pending tasks and runs the engine's
    /// dispose hook under its execution lock.
    ///
    /// Idempotent.
    pub fn dispose(&self) {
        let pending: Vec<_> = {
            let mut pending = self.pending.lock();
            if self.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            pending.drain().map(|(_, op)| op).collect()
        };
        let cancelled = pending.iter().filter(|op| op.cancel()).count();
        run_locked(&*self.engine, || self.engine.dispose());
        tracing::debug!(engine = %self.engine.id(), cancelled, "task runner disposed");
    }
}

impl fmt::Debug for ForegroundTaskRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForegroundTaskRunner")
            .field("engine", &self.engine.id())
            .field("pending", &self.pending.lock().len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
