//! Fixed-size worker pool for background work.
//!
//! The pool starts `worker_threads` OS threads up front and keeps them for
//! its whole life. Jobs are pushed onto a lock-free FIFO queue and picked up
//! by whichever worker is free, so there is no ordering guarantee between
//! jobs running on different workers.
//!
//! # Jobs
//!
//! A job is a closure plus an optional destroy notify. The notify runs after
//! the closure on the same worker, or on the pushing thread if the pool has
//! already shut down. A panicking closure is caught and logged; the worker
//! survives and the notify still runs.
//!
//! # Shutdown
//!
//! [`WorkerPool::shutdown_and_wait`] stops intake, lets the workers drain the
//! queue, and joins them within a bounded timeout. A job that slips in after
//! the workers have exited is discarded: its closure is dropped unrun and its
//! notify runs on the thread that shut the pool down.

use crate::error::{PlatformError, Result};
use crate::runtime::main_loop::DestroyNotify;
use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex};
use std::cell::Cell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle as ThreadJoinHandle};
use std::time::{Duration, Instant};

/// Thread lifecycle callback.
pub type ThreadHook = Arc<dyn Fn() + Send + Sync>;

thread_local! {
    /// Id of the pool the current thread works for, 0 elsewhere.
    static CURRENT_POOL: Cell<u64> = const { Cell::new(0) };
}

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Configuration options for the worker pool.
#[derive(Clone)]
pub struct WorkerPoolOptions {
    /// Number of worker threads.
    pub worker_threads: usize,
    /// Thread name prefix; workers are named `<prefix>-worker-N`.
    pub thread_name_prefix: String,
    /// Stack size of each worker.
    pub thread_stack_size: usize,
    /// Callback when a worker starts.
    pub on_thread_start: Option<ThreadHook>,
    /// Callback when a worker stops.
    pub on_thread_stop: Option<ThreadHook>,
}

impl Default for WorkerPoolOptions {
    fn default() -> Self {
        Self {
            worker_threads: 1,
            thread_name_prefix: "script-platform".to_string(),
            thread_stack_size: 2 * 1024 * 1024,
            on_thread_start: None,
            on_thread_stop: None,
        }
    }
}

impl fmt::Debug for WorkerPoolOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPoolOptions")
            .field("worker_threads", &self.worker_threads)
            .field("thread_name_prefix", &self.thread_name_prefix)
            .field("thread_stack_size", &self.thread_stack_size)
            .field("on_thread_start", &self.on_thread_start.is_some())
            .field("on_thread_stop", &self.on_thread_stop.is_some())
            .finish()
    }
}

/// A job queued on the pool.
struct Job {
    work: Box<dyn FnOnce() + Send + 'static>,
    destroy: Option<DestroyNotify>,
}

impl Job {
    fn run(self) {
        let Self { work, destroy } = self;
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(work)) {
            tracing::error!(
                panic = %panic_message(payload.as_ref()),
                "worker job panicked"
            );
        }
        if let Some(destroy) = destroy {
            destroy();
        }
    }

    fn discard(self) {
        drop(self.work);
        if let Some(destroy) = self.destroy {
            destroy();
        }
    }
}

struct WorkerPoolInner {
    /// Identity used by the thread-local worker marker.
    pool_id: u64,
    /// Number of worker threads still in their loop.
    active_threads: AtomicUsize,
    /// Number of threads currently executing work.
    busy_threads: AtomicUsize,
    /// Number of pending jobs in queue.
    pending_count: AtomicUsize,
    /// Work queue.
    queue: SegQueue<Job>,
    /// Shutdown flag.
    shutdown: AtomicBool,
    /// Condition variable for thread parking.
    condvar: Condvar,
    /// Mutex for condition variable.
    mutex: Mutex<()>,
    /// Thread join handles for cleanup.
    thread_handles: Mutex<Vec<ThreadJoinHandle<()>>>,
}

impl WorkerPoolInner {
    fn notify_one(&self) {
        let _guard = self.mutex.lock();
        self.condvar.notify_one();
    }

    fn notify_all(&self) {
        let _guard = self.mutex.lock();
        self.condvar.notify_all();
    }
}

/// Background worker pool.
pub struct WorkerPool {
    inner: Arc<WorkerPoolInner>,
    worker_threads: usize,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("worker_threads", &self.worker_threads)
            .field("active_threads", &self.active_threads())
            .field("busy_threads", &self.busy_threads())
            .field("pending_jobs", &self.pending_count())
            .finish()
    }
}

impl WorkerPool {
    /// Starts a pool with the given options.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::Spawn`] if a worker thread cannot be
    /// started. Workers that did start are shut down first.
    pub fn new(options: WorkerPoolOptions) -> Result<Self> {
        let worker_threads = options.worker_threads.max(1);
        let inner = Arc::new(WorkerPoolInner {
            pool_id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            active_threads: AtomicUsize::new(0),
            busy_threads: AtomicUsize::new(0),
            pending_count: AtomicUsize::new(0),
            queue: SegQueue::new(),
            shutdown: AtomicBool::new(false),
            condvar: Condvar::new(),
            mutex: Mutex::new(()),
            thread_handles: Mutex::new(Vec::with_capacity(worker_threads)),
        });
        let pool = Self {
            inner,
            worker_threads,
        };

        for index in 0..worker_threads {
            if let Err(source) = spawn_worker(&pool.inner, &options, index) {
                pool.shutdown_and_wait(Duration::from_secs(1));
                return Err(PlatformError::Spawn {
                    what: "worker",
                    source,
                });
            }
        }
        tracing::debug!(
            worker_threads,
            prefix = %options.thread_name_prefix,
            "worker pool started"
        );
        Ok(pool)
    }

    /// Queues `work` with an optional destroy notify.
    ///
    /// Returns `false` if the pool has shut down; the work is dropped
    /// and `destroy` runs on the calling thread.
    pub fn push<F>(&self, work: F, destroy: Option<DestroyNotify>) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_shutdown() {
            drop(work);
            if let Some(destroy) = destroy {
                destroy();
            }
            return false;
        }
        self.inner.pending_count.fetch_add(1, Ordering::Relaxed);
        self.inner.queue.push(Job {
            work: Box::new(work),
            destroy,
        });
        self.inner.notify_one();
        true
    }

    /// Number of worker threads the pool was started with.
    #[must_use]
    pub fn worker_threads(&self) -> usize {
        self.worker_threads
    }

    /// Returns the number of jobs waiting in the queue.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.pending_count.load(Ordering::Relaxed)
    }

    /// Returns the number of live worker threads.
    #[must_use]
    pub fn active_threads(&self) -> usize {
        self.inner.active_threads.load(Ordering::Relaxed)
    }

    /// Returns the number of threads currently executing work.
    #[must_use]
    pub fn busy_threads(&self) -> usize {
        self.inner.busy_threads.load(Ordering::Relaxed)
    }

    /// Returns `true` if the pool is shut down.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    /// Returns `true` if the calling thread is one of this pool's workers.
    #[must_use]
    pub fn is_worker_thread(&self) -> bool {
        CURRENT_POOL.with(Cell::get) == self.inner.pool_id
    }

    /// Initiates shutdown of the pool.
    ///
    /// No new jobs are accepted. Queued jobs still run.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.notify_all();
    }

    /// Shuts down and waits for all workers to exit.
    ///
    /// Returns `true` if all workers exited within `timeout`.
    pub fn shutdown_and_wait(&self, timeout: Duration) -> bool {
        self.shutdown();
        if self.is_worker_thread() {
            tracing::warn!("worker pool shut down from one of its own workers; not joining");
            return false;
        }

        let deadline = Instant::now().checked_add(timeout);
        while self.inner.active_threads.load(Ordering::Acquire) > 0 {
            let remaining = deadline.map_or(Duration::MAX, |deadline| {
                deadline.saturating_duration_since(Instant::now())
            });
            if remaining.is_zero() {
                tracing::warn!(
                    active = self.active_threads(),
                    pending = self.pending_count(),
                    "worker pool did not drain before timeout"
                );
                return false;
            }
            self.inner.notify_all();
            thread::sleep(Duration::from_millis(1).min(remaining));
        }

        let handles: Vec<_> = self.inner.thread_handles.lock().drain(..).collect();
        for handle in handles {
            // Workers have already left their loop, so join returns promptly.
            let _ = handle.join();
        }

        // A push racing with shutdown can land after the last worker left.
        let mut discarded = 0usize;
        while let Some(job) = self.inner.queue.pop() {
            self.inner.pending_count.fetch_sub(1, Ordering::Relaxed);
            job.discard();
            discarded += 1;
        }
        if discarded > 0 {
            tracing::debug!(discarded, "jobs queued after the workers exited were discarded");
        }
        true
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.is_shutdown() {
            let _ = self.shutdown_and_wait(Duration::from_secs(5));
        }
    }
}

fn spawn_worker(
    inner: &Arc<WorkerPoolInner>,
    options: &WorkerPoolOptions,
    index: usize,
) -> std::io::Result<()> {
    let inner_clone = Arc::clone(inner);
    let on_start = options.on_thread_start.clone();
    let on_stop = options.on_thread_stop.clone();
    let name = format!("{}-worker-{}", options.thread_name_prefix, index);

    inner.active_threads.fetch_add(1, Ordering::AcqRel);
    let spawned = thread::Builder::new()
        .name(name)
        .stack_size(options.thread_stack_size)
        .spawn(move || {
            CURRENT_POOL.with(|current| current.set(inner_clone.pool_id));
            if let Some(ref callback) = on_start {
                callback();
            }

            worker_loop(&inner_clone);

            if let Some(ref callback) = on_stop {
                callback();
            }
            inner_clone.active_threads.fetch_sub(1, Ordering::AcqRel);
        });

    match spawned {
        Ok(handle) => {
            inner.thread_handles.lock().push(handle);
            Ok(())
        }
        Err(err) => {
            inner.active_threads.fetch_sub(1, Ordering::AcqRel);
            Err(err)
        }
    }
}

/// The loop each worker runs until shutdown with an empty queue.
fn worker_loop(inner: &WorkerPoolInner) {
    loop {
        if let Some(job) = inner.queue.pop() {
            inner.pending_count.fetch_sub(1, Ordering::Relaxed);
            inner.busy_threads.fetch_add(1, Ordering::Relaxed);
            job.run();
            inner.busy_threads.fetch_sub(1, Ordering::Relaxed);
            continue;
        }

        if inner.shutdown.load(Ordering::Acquire) {
            break;
        }

        let mut guard = inner.mutex.lock();
        // Re-check under the parking mutex so a push between the pop above
        // and this wait is not missed.
        if inner.queue.is_empty() && !inner.shutdown.load(Ordering::Acquire) {
            inner.condvar.wait(&mut guard);
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}
