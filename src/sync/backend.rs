//! Factory the engine uses to obtain synchronization primitives.

use super::condvar::{ConditionVariableImpl, HostCondvar};
use super::mutex::{HostMutex, HostRecursiveMutex, MutexImpl};
use std::fmt;

/// Creates mutexes and condition variables on behalf of the engine.
pub trait ThreadingBackend: Send + Sync + fmt::Debug {
    /// Creates a non-recursive mutex.
    fn create_plain_mutex(&self) -> Box<dyn MutexImpl>;

    /// Creates a mutex the owning thread may lock repeatedly.
    fn create_recursive_mutex(&self) -> Box<dyn MutexImpl>;

    /// Creates a condition variable usable with plain mutexes.
    fn create_condition_variable(&self) -> Box<dyn ConditionVariableImpl>;
}

/// The production backend: host-blocking primitives from this module.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostThreadingBackend;

impl ThreadingBackend for HostThreadingBackend {
    fn create_plain_mutex(&self) -> Box<dyn MutexImpl> {
        Box::new(HostMutex::new())
    }

    fn create_recursive_mutex(&self) -> Box<dyn MutexImpl> {
        Box::new(HostRecursiveMutex::new())
    }

    fn create_condition_variable(&self) -> Box<dyn ConditionVariableImpl> {
        Box::new(HostCondvar::new())
    }
}
