//! Script-platform: the host side of an embedded script engine.
//!
//! # Overview
//!
//! An embedded engine does not own threads. It asks its host to run tasks
//! on "the" foreground thread, on background workers, after a delay, or when
//! the foreground is idle. It also asks the host for clocks, buffer memory,
//! executable pages and synchronization primitives. This crate is that host.
//!
//! A [`Platform`] owns:
//!
//! - one foreground thread running a priority event loop
//!   ([`runtime::MainContext`])
//! - a fixed pool of worker threads ([`runtime::WorkerPool`])
//! - a registry of live foreground operations so teardown can cancel them
//! - one [`ForegroundTaskRunner`] per engine instance
//!
//! Every scheduling call returns an [`OperationHandle`] that can be waited
//! on or cancelled. Cancelling before dispatch guarantees the closure never
//! runs; cancelling afterwards has no effect on a closure already running.
//!
//! # Example
//!
//! ```
//! use script_platform::{Operation, PlatformBuilder};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! let platform = PlatformBuilder::new().worker_threads(2).build()?;
//! let hits = Arc::new(AtomicUsize::new(0));
//! let h = Arc::clone(&hits);
//! let op = platform.schedule_on_pool(move || {
//!     h.fetch_add(1, Ordering::SeqCst);
//! });
//! op.wait();
//! assert_eq!(hits.load(Ordering::SeqCst), 1);
//! # Ok::<(), script_platform::PlatformError>(())
//! ```
//!
//! # Module Structure
//!
//! - [`platform`]: the root object and its scheduling entry points
//! - [`operation`]: waitable, cancellable handles for scheduled work
//! - [`runner`]: per-engine foreground task runners
//! - [`engine`]: what the platform needs from an engine instance
//! - [`runtime`]: event loop, worker pool and their threads
//! - [`memory`]: executable page allocation and cloaked-range reporting
//! - [`alloc`]: byte buffers for engine array buffers
//! - [`sync`]: mutexes and condition variables handed to the engine
//! - [`clock`]: monotonic and wall clocks
//! - [`config`], [`env_config`], [`builder`]: configuration
//! - [`error`]: error types

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::doc_markdown)]

pub mod alloc;
pub mod builder;
pub mod clock;
pub mod config;
pub mod engine;
pub mod env_config;
pub mod error;
pub mod memory;
pub mod operation;
pub mod platform;
pub mod runner;
pub mod runtime;
pub mod sync;
pub mod tracing_controller;

#[cfg(any(test, feature = "test-internals"))]
pub mod test_utils;

pub use alloc::{BufferAllocator, HostAllocator};
pub use builder::PlatformBuilder;
pub use clock::PlatformClock;
pub use config::PlatformConfig;
pub use engine::{EngineId, EngineInstance, ExecutionGuard, ExecutionLock, IdleTask, Task};
pub use error::{BuildError, PlatformError, Result};
pub use memory::{CloakRegistry, CloakedRanges, MemoryBackend, MemoryRange, PagedMemoryBackend};
pub use operation::{Operation, OperationHandle, OperationId, OperationKind, OperationState};
pub use platform::Platform;
pub use runner::ForegroundTaskRunner;
pub use runtime::Priority;
pub use sync::{
    ConditionVariableImpl, HostCondvar, HostMutex, HostRecursiveMutex, HostThreadingBackend,
    MutexImpl, ThreadingBackend,
};
pub use tracing_controller::{NoopTracingController, TracingController};
