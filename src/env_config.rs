//! Environment variable and config file support for [`PlatformBuilder`](crate::PlatformBuilder).
//!
//! # Configuration Precedence
//!
//! Settings are resolved in this order (highest priority first):
//!
//! 1. **Programmatic**: values set via builder methods (`worker_threads(4)`)
//! 2. **Environment variables**: values from `SCRIPT_PLATFORM_*` env vars
//! 3. **Config file**: values loaded from a TOML file (requires `config-file` feature)
//! 4. **Defaults**: built-in defaults from [`PlatformConfig::default()`]
//!
//! # Supported Environment Variables
//!
//! | Variable | Type | Maps to |
//! |----------|------|---------|
//! | `SCRIPT_PLATFORM_WORKER_THREADS` | `usize` | `worker_threads` |
//! | `SCRIPT_PLATFORM_THREAD_NAME_PREFIX` | `String` | `thread_name_prefix` |
//! | `SCRIPT_PLATFORM_THREAD_STACK_SIZE` | `usize` | `thread_stack_size` |
//! | `SCRIPT_PLATFORM_SHUTDOWN_TIMEOUT_MS` | `u64` | `shutdown_timeout` |

use crate::config::PlatformConfig;
use crate::error::BuildError;
use std::time::Duration;

/// Environment variable name for worker thread count.
pub const ENV_WORKER_THREADS: &str = "SCRIPT_PLATFORM_WORKER_THREADS";
/// Environment variable name for thread name prefix.
pub const ENV_THREAD_NAME_PREFIX: &str = "SCRIPT_PLATFORM_THREAD_NAME_PREFIX";
/// Environment variable name for thread stack size.
pub const ENV_THREAD_STACK_SIZE: &str = "SCRIPT_PLATFORM_THREAD_STACK_SIZE";
/// Environment variable name for the teardown drain bound, in milliseconds.
pub const ENV_SHUTDOWN_TIMEOUT_MS: &str = "SCRIPT_PLATFORM_SHUTDOWN_TIMEOUT_MS";

/// Every variable [`apply_env_overrides`] reads.
pub const ENV_VARS: [&str; 4] = [
    ENV_WORKER_THREADS,
    ENV_THREAD_NAME_PREFIX,
    ENV_THREAD_STACK_SIZE,
    ENV_SHUTDOWN_TIMEOUT_MS,
];

/// Apply environment variable overrides to a [`PlatformConfig`].
///
/// Only variables that are set in the environment are applied.
/// Returns an error if a variable is set but contains an unparseable value.
pub fn apply_env_overrides(config: &mut PlatformConfig) -> Result<(), BuildError> {
    if let Some(val) = read_env(ENV_WORKER_THREADS) {
        config.worker_threads = parse_usize(ENV_WORKER_THREADS, &val)?;
    }
    if let Some(val) = read_env(ENV_THREAD_NAME_PREFIX) {
        config.thread_name_prefix = val;
    }
    if let Some(val) = read_env(ENV_THREAD_STACK_SIZE) {
        config.thread_stack_size = parse_usize(ENV_THREAD_STACK_SIZE, &val)?;
    }
    if let Some(val) = read_env(ENV_SHUTDOWN_TIMEOUT_MS) {
        config.shutdown_timeout =
            Duration::from_millis(parse_u64(ENV_SHUTDOWN_TIMEOUT_MS, &val)?);
    }
    Ok(())
}

/// Read an environment variable, returning `None` if unset.
fn read_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn parse_usize(var: &'static str, val: &str) -> Result<usize, BuildError> {
    val.trim().parse::<usize>().map_err(|_| BuildError::Env {
        var,
        value: val.to_string(),
        expected: "unsigned integer",
    })
}

fn parse_u64(var: &'static str, val: &str) -> Result<u64, BuildError> {
    val.trim().parse::<u64>().map_err(|_| BuildError::Env {
        var,
        value: val.to_string(),
        expected: "milliseconds as unsigned integer",
    })
}

// =========================================================================
// TOML config file support (feature-gated)
// =========================================================================

/// TOML-deserializable platform configuration.
///
/// ```toml
/// [pool]
/// worker_threads = 4
/// shutdown_timeout_ms = 5000
///
/// [threads]
/// thread_name_prefix = "myapp"
/// thread_stack_size = 2097152
/// idle_frame_budget_us = 16666
/// ```
#[cfg(feature = "config-file")]
#[derive(serde::Deserialize, Default, Debug)]
#[serde(deny_unknown_fields)]
pub struct PlatformTomlConfig {
    /// Worker pool settings.
    #[serde(default)]
    pub pool: PoolToml,
    /// Thread settings.
    #[serde(default)]
    pub threads: ThreadsToml,
}

/// Pool section of the TOML config.
#[cfg(feature = "config-file")]
#[derive(serde::Deserialize, Default, Debug)]
#[serde(deny_unknown_fields)]
pub struct PoolToml {
    /// Number of worker threads.
    pub worker_threads: Option<usize>,
    /// Teardown drain bound in milliseconds.
    pub shutdown_timeout_ms: Option<u64>,
}

/// Threads section of the TOML config.
#[cfg(feature = "config-file")]
#[derive(serde::Deserialize, Default, Debug)]
#[serde(deny_unknown_fields)]
pub struct ThreadsToml {
    /// Name prefix for platform threads.
    pub thread_name_prefix: Option<String>,
    /// Stack size per thread in bytes.
    pub thread_stack_size: Option<usize>,
    /// Idle-task deadline budget in microseconds.
    pub idle_frame_budget_us: Option<u64>,
}

/// Apply a parsed TOML config to a [`PlatformConfig`].
///
/// Only fields that are `Some` in the TOML struct override the config.
#[cfg(feature = "config-file")]
pub fn apply_toml_config(config: &mut PlatformConfig, toml: &PlatformTomlConfig) {
    if let Some(v) = toml.pool.worker_threads {
        config.worker_threads = v;
    }
    if let Some(v) = toml.pool.shutdown_timeout_ms {
        config.shutdown_timeout = Duration::from_millis(v);
    }
    if let Some(ref v) = toml.threads.thread_name_prefix {
        config.thread_name_prefix.clone_from(v);
    }
    if let Some(v) = toml.threads.thread_stack_size {
        config.thread_stack_size = v;
    }
    if let Some(v) = toml.threads.idle_frame_budget_us {
        config.idle_frame_budget = Duration::from_micros(v);
    }
}

/// Parse a TOML string into a [`PlatformTomlConfig`].
#[cfg(feature = "config-file")]
pub fn parse_toml_str(toml_str: &str) -> Result<PlatformTomlConfig, BuildError> {
    toml::from_str(toml_str).map_err(|e| BuildError::ConfigFile {
        path: "<inline>".to_string(),
        reason: e.to_string(),
    })
}

/// Read and parse a TOML file into a [`PlatformTomlConfig`].
#[cfg(feature = "config-file")]
pub fn parse_toml_file(path: &std::path::Path) -> Result<PlatformTomlConfig, BuildError> {
    let content = std::fs::read_to_string(path).map_err(|e| BuildError::ConfigFile {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    toml::from_str(&content).map_err(|e| BuildError::ConfigFile {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

// =========================================================================
// Tests
// =========================================================================
