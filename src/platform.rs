//! The platform root object.
//!
//! [`Platform`] owns everything the engine schedules onto: the foreground
//! loop thread, the worker pool, the registry of live foreground operations
//! and the per-engine task runners. It also hands out the clocks, the
//! allocator, the executable-memory backend and the synchronization factory.
//!
//! # Scheduling
//!
//! | Entry point | Runs on | Source |
//! |-------------|---------|--------|
//! | [`schedule_on_foreground`](Platform::schedule_on_foreground) | foreground | ready, `Default` priority |
//! | [`schedule_on_foreground_delayed`](Platform::schedule_on_foreground_delayed) | foreground | timer |
//! | [`schedule_on_pool`](Platform::schedule_on_pool) | worker | pool queue |
//! | [`schedule_on_pool_delayed`](Platform::schedule_on_pool_delayed) | worker | `High` timer, then pool queue |
//!
//! The engine-facing `call_*` entry points adapt engine tasks onto these
//! and drop the returned handle.
//!
//! # Teardown
//!
//! Dropping the platform posts a `High` priority dispose operation to the
//! foreground thread and blocks until it has run. Disposal closes every
//! task runner under its engine's execution lock. Foreground operations
//! still registered afterwards are cancelled, then the foreground loop
//! quits and the pool drains. Anything attached to the loop after that
//! drain is cancelled when the loop quits, and anything scheduled after
//! the quit is cancelled on the spot.

use crate::alloc::{BufferAllocator, HostAllocator};
use crate::clock::PlatformClock;
use crate::config::PlatformConfig;
use crate::engine::{EngineId, EngineInstance, IdleTask, Task};
use crate::error::Result;
use crate::memory::{MemoryBackend, PagedMemoryBackend};
use crate::operation::{
    DelayedPoolOperation, MainThreadOperation, Operation, OperationHandle, OperationRegistry,
    PoolOperation, Work,
};
use crate::runner::ForegroundTaskRunner;
use crate::runtime::main_loop::{Priority, Source};
use crate::runtime::scheduler::ScriptScheduler;
use crate::sync::{HostThreadingBackend, ThreadingBackend};
use crate::tracing_controller::{NoopTracingController, TracingController};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Converts an engine delay in seconds to a [`Duration`].
///
/// Negative, NaN and sub-nanosecond delays become zero; delays too large to
/// represent saturate.
pub(crate) fn delay_from_seconds(seconds: f64) -> Duration {
    if seconds.is_nan() || seconds <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX)
}

/// State shared between the platform and its task runners.
pub(crate) struct PlatformCore {
    config: PlatformConfig,
    registry: Arc<OperationRegistry>,
    scheduler: ScriptScheduler,
    clock: PlatformClock,
    allocator: HostAllocator,
    memory: PagedMemoryBackend,
    threading: HostThreadingBackend,
    tracing_controller: NoopTracingController,
    runners: Mutex<HashMap<EngineId, Arc<ForegroundTaskRunner>>>,
}

impl PlatformCore {
    pub(crate) fn schedule_source(&self, source: Source, work: Work) -> Arc<MainThreadOperation> {
        MainThreadOperation::schedule(&self.registry, self.scheduler.context(), source, work)
    }

    fn dispose_runners(&self) {
        let runners: Vec<_> = self.runners.lock().drain().map(|(_, r)| r).collect();
        for runner in &runners {
            runner.dispose();
        }
        tracing::debug!(runners = runners.len(), "engine runners disposed");
    }
}

/// The scheduling platform.
///
/// Built with [`PlatformBuilder`](crate::PlatformBuilder). The platform is
/// the sole owner of its threads; dropping it tears them down.
pub struct Platform {
    core: Arc<PlatformCore>,
}

impl Platform {
    /// Starts a platform from a configuration.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::Spawn`](crate::PlatformError::Spawn) if the
    /// foreground thread or a worker cannot be started.
    pub fn new(mut config: PlatformConfig) -> Result<Self> {
        config.normalize();
        let clock = PlatformClock::new();
        let scheduler = ScriptScheduler::start(&config)?;
        let memory = PagedMemoryBackend::new(Arc::clone(&config.cloak_registry));
        tracing::info!(
            worker_threads = config.worker_threads,
            prefix = %config.thread_name_prefix,
            "platform started"
        );
        Ok(Self {
            core: Arc::new(PlatformCore {
                config,
                registry: Arc::new(OperationRegistry::new()),
                scheduler,
                clock,
                allocator: HostAllocator,
                memory,
                threading: HostThreadingBackend,
                tracing_controller: NoopTracingController,
                runners: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// The normalized configuration the platform runs with.
    #[must_use]
    pub fn config(&self) -> &PlatformConfig {
        &self.core.config
    }

    // ------------------------------------------------------------------
    // Handle-returning scheduling
    // ------------------------------------------------------------------

    /// Runs `work` on the foreground thread at `Default` priority.
    pub fn schedule_on_foreground<F>(&self, work: F) -> OperationHandle
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_on_foreground_with_priority(Priority::Default, work)
    }

    /// Runs `work` on the foreground thread at `priority`.
    pub fn schedule_on_foreground_with_priority<F>(
        &self,
        priority: Priority,
        work: F,
    ) -> OperationHandle
    where
        F: FnOnce() + Send + 'static,
    {
        self.core
            .schedule_source(Source::idle(priority), Box::new(work))
    }

    /// Runs `work` on the foreground thread no earlier than `delay` from now.
    pub fn schedule_on_foreground_delayed<F>(&self, delay: Duration, work: F) -> OperationHandle
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_on_foreground_delayed_with_priority(delay, Priority::Default, work)
    }

    /// Delayed foreground work at `priority`.
    pub fn schedule_on_foreground_delayed_with_priority<F>(
        &self,
        delay: Duration,
        priority: Priority,
        work: F,
    ) -> OperationHandle
    where
        F: FnOnce() + Send + 'static,
    {
        self.core
            .schedule_source(Source::timeout(delay, priority), Box::new(work))
    }

    /// Runs `work` on a worker thread.
    ///
    /// The returned handle cannot cancel it.
    pub fn schedule_on_pool<F>(&self, work: F) -> OperationHandle
    where
        F: FnOnce() + Send + 'static,
    {
        PoolOperation::schedule(&self.core.registry, self.core.scheduler.pool(), Box::new(work))
    }

    /// Submits `work` to the pool after `delay`.
    ///
    /// The delay is timed on the foreground loop. Cancelling the handle
    /// before it elapses prevents the submission.
    pub fn schedule_on_pool_delayed<F>(&self, delay: Duration, work: F) -> OperationHandle
    where
        F: FnOnce() + Send + 'static,
    {
        DelayedPoolOperation::schedule(
            &self.core.registry,
            self.core.scheduler.context(),
            self.core.scheduler.pool(),
            delay,
            Box::new(work),
        )
    }

    /// Returns the task runner of `engine`, creating it on first use.
    pub fn foreground_task_runner(
        &self,
        engine: &Arc<dyn EngineInstance>,
    ) -> Arc<ForegroundTaskRunner> {
        let mut runners = self.core.runners.lock();
        let runner = runners.entry(engine.id()).or_insert_with(|| {
            tracing::debug!(engine = %engine.id(), "task runner created");
            Arc::new(ForegroundTaskRunner::new(
                Arc::downgrade(&self.core),
                Arc::clone(engine),
                self.core.clock,
                self.core.config.idle_frame_budget,
            ))
        });
        Arc::clone(runner)
    }

    // ------------------------------------------------------------------
    // Engine-facing task posting
    // ------------------------------------------------------------------

    /// Runs an engine task on a worker thread.
    pub fn call_on_worker_thread(&self, task: Box<dyn Task>) {
        self.schedule_on_pool(move || task.run());
    }

    /// Runs an engine task on a worker thread after `delay_in_seconds`.
    pub fn call_delayed_on_worker_thread(&self, task: Box<dyn Task>, delay_in_seconds: f64) {
        self.schedule_on_pool_delayed(delay_from_seconds(delay_in_seconds), move || task.run());
    }

    /// Posts an engine task to `engine`'s foreground runner.
    pub fn call_on_foreground_thread(&self, engine: &Arc<dyn EngineInstance>, task: Box<dyn Task>) {
        if let Err(err) = self.foreground_task_runner(engine).post_task(task) {
            tracing::warn!(engine = %engine.id(), error = %err, "foreground task dropped");
        }
    }

    /// Posts a delayed engine task to `engine`'s foreground runner.
    pub fn call_delayed_on_foreground_thread(
        &self,
        engine: &Arc<dyn EngineInstance>,
        task: Box<dyn Task>,
        delay_in_seconds: f64,
    ) {
        if let Err(err) = self
            .foreground_task_runner(engine)
            .post_delayed_task(task, delay_in_seconds)
        {
            tracing::warn!(engine = %engine.id(), error = %err, "delayed foreground task dropped");
        }
    }

    /// Posts an idle task to `engine`'s foreground runner.
    pub fn call_idle_on_foreground_thread(
        &self,
        engine: &Arc<dyn EngineInstance>,
        task: Box<dyn IdleTask>,
    ) {
        if let Err(err) = self.foreground_task_runner(engine).post_idle_task(task) {
            tracing::warn!(engine = %engine.id(), error = %err, "idle task dropped");
        }
    }

    /// Idle tasks are always supported.
    #[must_use]
    pub fn idle_tasks_enabled(&self, _engine: &Arc<dyn EngineInstance>) -> bool {
        true
    }

    // ------------------------------------------------------------------
    // Queries and accessors
    // ------------------------------------------------------------------

    /// Size of the worker pool.
    #[must_use]
    pub fn number_of_worker_threads(&self) -> usize {
        self.core.scheduler.pool().worker_threads()
    }

    /// Seconds since the platform was built, at millisecond resolution.
    #[must_use]
    pub fn monotonically_increasing_time(&self) -> f64 {
        self.core.clock.monotonic_seconds()
    }

    /// Milliseconds since the Unix epoch.
    #[must_use]
    pub fn current_clock_time_millis(&self) -> f64 {
        self.core.clock.wall_clock_millis()
    }

    /// The platform's clock.
    #[must_use]
    pub fn clock(&self) -> &PlatformClock {
        &self.core.clock
    }

    /// Returns `true` on the foreground thread.
    #[must_use]
    pub fn is_foreground_thread(&self) -> bool {
        self.core.scheduler.is_foreground_thread()
    }

    /// Returns `true` on one of this platform's worker threads.
    #[must_use]
    pub fn is_worker_thread(&self) -> bool {
        self.core.scheduler.pool().is_worker_thread()
    }

    /// Foreground operations that are pending or running.
    #[must_use]
    pub fn live_foreground_operations(&self) -> usize {
        self.core.registry.live_count()
    }

    /// The engine's byte allocator.
    #[must_use]
    pub fn allocator(&self) -> &dyn BufferAllocator {
        &self.core.allocator
    }

    /// The executable-memory backend.
    #[must_use]
    pub fn memory_backend(&self) -> &dyn MemoryBackend {
        &self.core.memory
    }

    /// Factory for engine mutexes and condition variables.
    #[must_use]
    pub fn threading_backend(&self) -> &dyn ThreadingBackend {
        &self.core.threading
    }

    /// The engine's tracing controller.
    #[must_use]
    pub fn tracing_controller(&self) -> &dyn TracingController {
        &self.core.tracing_controller
    }

    /// Routes an unrecoverable engine error to the log.
    ///
    /// No recovery is attempted; what happens to the process is up to the
    /// host.
    pub fn on_fatal_error(&self, location: &str, message: &str) {
        tracing::error!(target: "engine", location, message, "fatal engine error");
    }
}

impl fmt::Debug for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Platform")
            .field("config", &self.core.config)
            .field("scheduler", &self.core.scheduler)
            .field("registry", &self.core.registry)
            .field("runners", &self.core.runners.lock().len())
            .finish_non_exhaustive()
    }
}

impl Drop for Platform {
    fn drop(&mut self) {
        tracing::debug!("platform teardown");
        if self.is_foreground_thread() {
            tracing::error!("platform dropped on its own foreground thread; disposing inline");
            self.core.dispose_runners();
        } else {
            let core = Arc::clone(&self.core);
            let dispose = self.schedule_on_foreground_with_priority(Priority::High, move || {
                core.dispose_runners();
            });
            dispose.wait();
        }

        let cancelled = self.core.registry.cancel_all();
        if cancelled > 0 {
            tracing::debug!(cancelled, "foreground operations cancelled at teardown");
        }
        let clean = self.core.scheduler.shutdown(self.core.config.shutdown_timeout);
        if clean {
            tracing::info!("platform stopped");
        } else {
            tracing::warn!("platform stopped without a clean scheduler shutdown");
        }
    }
}
