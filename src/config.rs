//! Platform configuration types.
//!
//! These types hold the concrete values that drive platform behavior. In
//! most cases you should use [`PlatformBuilder`](crate::PlatformBuilder) to
//! construct a platform rather than creating a [`PlatformConfig`] directly.
//!
//! # Defaults
//!
//! | Field | Default |
//! |-------|---------|
//! | `worker_threads` | available CPU parallelism |
//! | `thread_stack_size` | 2 MiB |
//! | `thread_name_prefix` | `"script-platform"` |
//! | `shutdown_timeout` | 5 s |
//! | `idle_frame_budget` | 1/60 s |
//! | `cloak_registry` | process-wide [`CloakedRanges`] |

use crate::memory::{CloakRegistry, CloakedRanges};
use crate::runtime::worker_pool::{ThreadHook, WorkerPoolOptions};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Default stack size of platform threads.
pub const DEFAULT_THREAD_STACK_SIZE: usize = 2 * 1024 * 1024;

/// Default thread name prefix.
pub const DEFAULT_THREAD_NAME_PREFIX: &str = "script-platform";

/// Default bound on the pool drain at teardown.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// One 60 Hz frame.
pub const DEFAULT_IDLE_FRAME_BUDGET: Duration = Duration::from_nanos(1_000_000_000 / 60);

/// Platform configuration.
#[derive(Clone)]
pub struct PlatformConfig {
    /// Number of worker threads (default: available parallelism).
    pub worker_threads: usize,
    /// Stack size per platform thread (default: 2MB).
    pub thread_stack_size: usize,
    /// Name prefix for platform threads.
    pub thread_name_prefix: String,
    /// Maximum time teardown waits for the worker pool to drain.
    pub shutdown_timeout: Duration,
    /// Time budget handed to idle tasks as their deadline.
    pub idle_frame_budget: Duration,
    /// Callback executed when a worker thread starts.
    pub on_thread_start: Option<ThreadHook>,
    /// Callback executed when a worker thread stops.
    pub on_thread_stop: Option<ThreadHook>,
    /// Registry the executable-memory backend reports to.
    pub cloak_registry: Arc<dyn CloakRegistry>,
}

impl PlatformConfig {
    /// Normalize configuration values to safe defaults.
    pub fn normalize(&mut self) {
        if self.worker_threads == 0 {
            self.worker_threads = 1;
        }
        if self.thread_stack_size == 0 {
            self.thread_stack_size = DEFAULT_THREAD_STACK_SIZE;
        }
        if self.thread_name_prefix.is_empty() {
            self.thread_name_prefix = DEFAULT_THREAD_NAME_PREFIX.to_string();
        }
        if self.idle_frame_budget.is_zero() {
            self.idle_frame_budget = DEFAULT_IDLE_FRAME_BUDGET;
        }
    }

    pub(crate) fn default_worker_threads() -> usize {
        std::thread::available_parallelism()
            .map_or(1, std::num::NonZeroUsize::get)
            .max(1)
    }

    /// Name of the foreground thread.
    #[must_use]
    pub fn foreground_thread_name(&self) -> String {
        format!("{}-js", self.thread_name_prefix)
    }

    pub(crate) fn worker_pool_options(&self) -> WorkerPoolOptions {
        WorkerPoolOptions {
            worker_threads: self.worker_threads,
            thread_name_prefix: self.thread_name_prefix.clone(),
            thread_stack_size: self.thread_stack_size,
            on_thread_start: self.on_thread_start.clone(),
            on_thread_stop: self.on_thread_stop.clone(),
        }
    }
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            worker_threads: Self::default_worker_threads(),
            thread_stack_size: DEFAULT_THREAD_STACK_SIZE,
            thread_name_prefix: DEFAULT_THREAD_NAME_PREFIX.to_string(),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            idle_frame_budget: DEFAULT_IDLE_FRAME_BUDGET,
            on_thread_start: None,
            on_thread_stop: None,
            cloak_registry: CloakedRanges::shared(),
        }
    }
}

impl fmt::Debug for PlatformConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlatformConfig")
            .field("worker_threads", &self.worker_threads)
            .field("thread_stack_size", &self.thread_stack_size)
            .field("thread_name_prefix", &self.thread_name_prefix)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .field("idle_frame_budget", &self.idle_frame_budget)
            .field("on_thread_start", &self.on_thread_start.is_some())
            .field("on_thread_stop", &self.on_thread_stop.is_some())
            .field("cloak_registry", &self.cloak_registry)
            .finish()
    }
}
