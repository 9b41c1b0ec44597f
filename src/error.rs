//! Error types for the scheduling platform.
//!
//! Error handling follows a narrow policy:
//!
//! - Construction failures are hard errors: a platform that cannot start its
//!   foreground thread or its worker pool is never handed out half-built.
//! - Allocation failures are *not* errors. The allocator and the
//!   executable-memory backend report exhaustion as `None` / `false`, which is
//!   the contract the engine expects.
//! - Failures inside scheduled work belong to the work itself. A panicking
//!   closure is caught at the operation boundary, logged, and the operation
//!   still completes so that waiters are released.

use std::io;
use thiserror::Error;

/// Errors produced by the platform and its task runners.
#[derive(Debug, Error)]
pub enum PlatformError {
    /// A platform thread could not be spawned.
    #[error("failed to spawn {what} thread: {source}")]
    Spawn {
        /// Which thread failed to start.
        what: &'static str,
        /// The underlying OS error.
        #[source]
        source: io::Error,
    },

    /// Configuration was rejected while building the platform.
    #[error(transparent)]
    Build(#[from] BuildError),

    /// The platform backing this runner has been disposed.
    #[error("platform has shut down")]
    ShutDown,
}

/// Errors that can occur while assembling a [`PlatformConfig`](crate::PlatformConfig).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    /// A configured value failed validation.
    #[error("invalid value for {field}: {reason}")]
    InvalidValue {
        /// Name of the offending field.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },

    /// An environment variable held an unparseable value.
    #[error("invalid value for {var}: expected {expected}, got {value:?}")]
    Env {
        /// The environment variable name.
        var: &'static str,
        /// The raw value found in the environment.
        value: String,
        /// Description of the accepted format.
        expected: &'static str,
    },

    /// A configuration file could not be read or parsed.
    #[error("config file {path}: {reason}")]
    ConfigFile {
        /// Path (or `<inline>` for string input).
        path: String,
        /// Reader or parser message.
        reason: String,
    },
}

impl BuildError {
    /// Creates an [`BuildError::InvalidValue`].
    #[must_use]
    pub fn invalid_value(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field,
            reason: reason.into(),
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T, E = PlatformError> = std::result::Result<T, E>;
