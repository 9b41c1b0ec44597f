//! Threads and queues the platform schedules onto.
//!
//! - [`main_loop`]: the foreground event loop (ready and timer sources,
//!   priority then FIFO dispatch)
//! - [`worker_pool`]: fixed-size pool of worker threads draining a shared queue
//! - [`scheduler`]: owns the foreground thread and the pool, starts and
//!   stops them together
//!
//! Nothing in this module knows about operations or engines. Callbacks
//! pushed here are plain closures; [`crate::operation`] builds cancellation
//! and waiting on top.

pub mod main_loop;
pub mod scheduler;
pub mod worker_pool;

pub use main_loop::{Callback, DestroyNotify, LoopQuit, MainContext, Priority, Source, SourceId};
pub use scheduler::ScriptScheduler;
pub use worker_pool::{ThreadHook, WorkerPool, WorkerPoolOptions};
