//! Test utilities for the scheduling platform.
//!
//! Shared helpers for unit tests:
//! - Consistent tracing-based logging initialization
//! - Phase/section macros for readable test output
//! - A platform constructor with a small, named worker pool
//! - A recording engine instance for runner tests

use crate::builder::PlatformBuilder;
use crate::engine::{EngineId, EngineInstance, ExecutionLock};
use crate::platform::Platform;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Once;
use std::time::{Duration, Instant};

static INIT_LOGGING: Once = Once::new();

/// Initialize test logging with trace-level output.
///
/// Safe to call multiple times; only initializes once.
pub fn init_test_logging() {
    init_test_logging_with_level(tracing::Level::TRACE);
}

/// Initialize test logging with a custom level.
///
/// The first call wins; later calls are no-ops.
pub fn init_test_logging_with_level(level: tracing::Level) {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_test_writer()
            .with_file(true)
            .with_line_number(true)
            .with_target(true)
            .with_thread_ids(true)
            .with_thread_names(true)
            .with_ansi(false)
            .try_init();
    });
}

/// Builds a platform with a two-thread pool and a recognizable thread prefix.
#[must_use]
pub fn test_platform() -> Platform {
    PlatformBuilder::new()
        .worker_threads(2)
        .thread_name_prefix("test-platform")
        .shutdown_timeout(Duration::from_secs(5))
        .build()
        .expect("failed to build test platform")
}

static ENV_LOCK: parking_lot::Mutex<()> = parking_lot::Mutex::new(());

/// Serializes tests that read or write process environment variables.
pub fn env_lock() -> parking_lot::MutexGuard<'static, ()> {
    ENV_LOCK.lock()
}

/// Polls `cond` until it holds or `timeout` elapses. Returns the final value.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while !cond() {
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    true
}

/// Engine instance that counts scope entries and flags overlapping scopes.
#[derive(Debug)]
pub struct RecordingEngine {
    id: EngineId,
    lock: ExecutionLock,
    active: AtomicUsize,
    entered: AtomicUsize,
    overlaps: AtomicUsize,
    disposed: AtomicUsize,
}

impl RecordingEngine {
    /// Creates an engine with a fresh identity.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: EngineId::next(),
            lock: ExecutionLock::new(),
            active: AtomicUsize::new(0),
            entered: AtomicUsize::new(0),
            overlaps: AtomicUsize::new(0),
            disposed: AtomicUsize::new(0),
        }
    }

    /// Number of times a task scope was entered.
    #[must_use]
    pub fn entered(&self) -> usize {
        self.entered.load(Ordering::SeqCst)
    }

    /// Number of times a scope was entered while another was still open.
    #[must_use]
    pub fn overlaps(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }

    /// Number of times the dispose hook ran.
    #[must_use]
    pub fn disposed(&self) -> usize {
        self.disposed.load(Ordering::SeqCst)
    }
}

impl Default for RecordingEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineInstance for RecordingEngine {
    fn id(&self) -> EngineId {
        self.id
    }

    fn execution_lock(&self) -> &ExecutionLock {
        &self.lock
    }

    fn enter(&self) {
        if self.active.fetch_add(1, Ordering::SeqCst) != 0 {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        self.entered.fetch_add(1, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    fn dispose(&self) {
        self.disposed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Log a test phase transition with a visual separator.
#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        tracing::info!(phase = %$name, "========================================");
        tracing::info!(phase = %$name, "TEST PHASE: {}", $name);
        tracing::info!(phase = %$name, "========================================");
    };
}

/// Log a section within a test phase.
#[macro_export]
macro_rules! test_section {
    ($name:expr) => {
        tracing::debug!(section = %$name, "--- {} ---", $name);
    };
}

/// Log test completion with summary.
#[macro_export]
macro_rules! test_complete {
    ($name:expr) => {
        tracing::info!(test = %$name, "test completed successfully: {}", $name);
    };
    ($name:expr, $($key:ident = $value:expr),* $(,)?) => {
        tracing::info!(
            test = %$name,
            $($key = %$value,)*
            "test completed successfully: {}",
            $name
        );
    };
}

/// Log before assertions for context.
#[macro_export]
macro_rules! assert_with_log {
    ($cond:expr, $msg:expr, $expected:expr, $actual:expr) => {
        tracing::debug!(
            expected = ?$expected,
            actual = ?$actual,
            "Asserting: {}",
            $msg
        );
        assert!($cond, "{}: expected {:?}, got {:?}", $msg, $expected, $actual);
    };
}
