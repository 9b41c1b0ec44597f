//! The script scheduler: one foreground loop thread plus a worker pool.
//!
//! The foreground thread runs a [`MainContext`] until the scheduler shuts
//! down. It is the only thread on which engine state may be touched.

use crate::config::PlatformConfig;
use crate::error::{PlatformError, Result};
use crate::runtime::main_loop::MainContext;
use crate::runtime::worker_pool::WorkerPool;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle as ThreadJoinHandle, ThreadId};
use std::time::Duration;

/// Owner of the foreground loop thread and the worker pool.
pub struct ScriptScheduler {
    context: Arc<MainContext>,
    pool: Arc<WorkerPool>,
    foreground: Mutex<Option<ThreadJoinHandle<()>>>,
    foreground_id: ThreadId,
}

impl ScriptScheduler {
    /// Starts the foreground thread and the worker pool.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::Spawn`] if either cannot be started.
    pub fn start(config: &PlatformConfig) -> Result<Self> {
        let context = Arc::new(MainContext::new());
        let loop_context = Arc::clone(&context);
        let foreground = thread::Builder::new()
            .name(config.foreground_thread_name())
            .stack_size(config.thread_stack_size)
            .spawn(move || {
                tracing::debug!("foreground loop running");
                loop_context.run();
                tracing::debug!("foreground loop exited");
            })
            .map_err(|source| PlatformError::Spawn {
                what: "foreground",
                source,
            })?;
        let foreground_id = foreground.thread().id();

        let pool = match WorkerPool::new(config.worker_pool_options()) {
            Ok(pool) => Arc::new(pool),
            Err(err) => {
                context.quit();
                let _ = foreground.join();
                return Err(err);
            }
        };

        Ok(Self {
            context,
            pool,
            foreground: Mutex::new(Some(foreground)),
            foreground_id,
        })
    }

    /// The foreground loop.
    #[must_use]
    pub fn context(&self) -> &Arc<MainContext> {
        &self.context
    }

    /// The worker pool.
    #[must_use]
    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Returns `true` on the foreground thread.
    #[must_use]
    pub fn is_foreground_thread(&self) -> bool {
        thread::current().id() == self.foreground_id
    }

    /// Stops the foreground loop and drains the pool.
    ///
    /// Idempotent. Returns `false` if the pool did not drain within
    /// `timeout` or the call was made from a scheduler thread, which
    /// cannot join itself.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        self.context.quit();
        let mut clean = true;
        let handle = self.foreground.lock().take();
        if let Some(handle) = handle {
            if self.is_foreground_thread() {
                tracing::warn!("scheduler shut down from the foreground thread; not joining");
                clean = false;
            } else if handle.join().is_err() {
                tracing::error!("foreground thread panicked");
                clean = false;
            }
        }
        clean &= self.pool.shutdown_and_wait(timeout);
        clean
    }
}

impl fmt::Debug for ScriptScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptScheduler")
            .field("context", &self.context)
            .field("pool", &self.pool)
            .field("foreground_id", &self.foreground_id)
            .finish()
    }
}

impl Drop for ScriptScheduler {
    fn drop(&mut self) {
        if self.foreground.get_mut().is_some() {
            self.shutdown(Duration::from_secs(5));
        }
    }
}
