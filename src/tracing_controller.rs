//! Tracing controller handed to the engine.
//!
//! The platform passes the controller through without interpreting it.
//! The default controller reports every category as disabled, so the engine
//! never emits trace events through it.

use std::fmt;

/// Engine trace-event controller.
pub trait TracingController: Send + Sync + fmt::Debug {
    /// Returns `true` if events in `category` should be recorded.
    fn category_group_enabled(&self, category: &str) -> bool {
        let _ = category;
        false
    }
}

/// Controller with every category disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTracingController;

impl TracingController for NoopTracingController {}
