//! Synchronization primitives handed to the engine.
//!
//! The engine's internal locking is delegated to the platform through a
//! [`ThreadingBackend`]. The primitives map onto host blocking primitives
//! (`parking_lot`): a blocked caller parks until it is handed the lock or
//! notified, it never polls.
//!
//! # Primitives
//!
//! - [`HostMutex`]: plain mutex with explicit `lock` / `unlock` / `try_lock`
//! - [`HostRecursiveMutex`]: reentrant for the owning thread
//! - [`HostCondvar`]: condition variable paired with [`HostMutex`];
//!   `wait_for` reports whether the deadline passed without a signal

mod backend;
mod condvar;
mod mutex;

pub use backend::{HostThreadingBackend, ThreadingBackend};
pub use condvar::{ConditionVariableImpl, HostCondvar};
pub use mutex::{HostMutex, HostRecursiveMutex, MutexImpl};
