//! Platform builder.
//!
//! Values set through builder methods always win over environment variables,
//! which win over a TOML file, which wins over [`PlatformConfig::default`].

use crate::config::PlatformConfig;
use crate::env_config;
use crate::error::{BuildError, Result};
use crate::memory::CloakRegistry;
use crate::platform::Platform;
use crate::runtime::worker_pool::ThreadHook;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Values set explicitly on the builder.
#[derive(Clone, Default)]
struct Overrides {
    worker_threads: Option<usize>,
    thread_stack_size: Option<usize>,
    thread_name_prefix: Option<String>,
    shutdown_timeout: Option<Duration>,
    idle_frame_budget: Option<Duration>,
    on_thread_start: Option<ThreadHook>,
    on_thread_stop: Option<ThreadHook>,
    cloak_registry: Option<Arc<dyn CloakRegistry>>,
}

impl Overrides {
    fn apply(self, config: &mut PlatformConfig) {
        if let Some(v) = self.worker_threads {
            config.worker_threads = v;
        }
        if let Some(v) = self.thread_stack_size {
            config.thread_stack_size = v;
        }
        if let Some(v) = self.thread_name_prefix {
            config.thread_name_prefix = v;
        }
        if let Some(v) = self.shutdown_timeout {
            config.shutdown_timeout = v;
        }
        if let Some(v) = self.idle_frame_budget {
            config.idle_frame_budget = v;
        }
        if self.on_thread_start.is_some() {
            config.on_thread_start = self.on_thread_start;
        }
        if self.on_thread_stop.is_some() {
            config.on_thread_stop = self.on_thread_stop;
        }
        if let Some(v) = self.cloak_registry {
            config.cloak_registry = v;
        }
    }
}

/// Builder for constructing a platform with custom configuration.
#[derive(Clone)]
pub struct PlatformBuilder {
    base: PlatformConfig,
    env_overrides: bool,
    overrides: Overrides,
}

impl PlatformBuilder {
    /// Create a new builder with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self {
            base: PlatformConfig::default(),
            env_overrides: false,
            overrides: Overrides::default(),
        }
    }

    /// Set the number of worker threads.
    #[must_use]
    pub fn worker_threads(mut self, n: usize) -> Self {
        self.overrides.worker_threads = Some(n);
        self
    }

    /// Set the stack size of platform threads.
    #[must_use]
    pub fn thread_stack_size(mut self, size: usize) -> Self {
        self.overrides.thread_stack_size = Some(size);
        self
    }

    /// Set the thread name prefix.
    #[must_use]
    pub fn thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.overrides.thread_name_prefix = Some(prefix.into());
        self
    }

    /// Bound the worker pool drain at teardown.
    #[must_use]
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.overrides.shutdown_timeout = Some(timeout);
        self
    }

    /// Set the deadline budget handed to idle tasks.
    #[must_use]
    pub fn idle_frame_budget(mut self, budget: Duration) -> Self {
        self.overrides.idle_frame_budget = Some(budget);
        self
    }

    /// Register a callback to run when a worker thread starts.
    #[must_use]
    pub fn on_thread_start<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.overrides.on_thread_start = Some(Arc::new(f));
        self
    }

    /// Register a callback to run when a worker thread stops.
    #[must_use]
    pub fn on_thread_stop<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.overrides.on_thread_stop = Some(Arc::new(f));
        self
    }

    /// Report executable-memory ranges to `registry` instead of the
    /// process-wide one.
    #[must_use]
    pub fn cloak_registry(mut self, registry: Arc<dyn CloakRegistry>) -> Self {
        self.overrides.cloak_registry = Some(registry);
        self
    }

    /// Apply `SCRIPT_PLATFORM_*` environment variables when building.
    ///
    /// See [`env_config`] for the supported variables.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        self.env_overrides = true;
        self
    }

    /// Start from a TOML file instead of the defaults.
    ///
    /// # Errors
    ///
    /// [`BuildError::ConfigFile`] if the file cannot be read or parsed.
    #[cfg(feature = "config-file")]
    pub fn from_toml(path: impl AsRef<std::path::Path>) -> Result<Self, BuildError> {
        let parsed = env_config::parse_toml_file(path.as_ref())?;
        let mut builder = Self::new();
        env_config::apply_toml_config(&mut builder.base, &parsed);
        Ok(builder)
    }

    /// Start from TOML text instead of the defaults.
    ///
    /// # Errors
    ///
    /// [`BuildError::ConfigFile`] if the text cannot be parsed.
    #[cfg(feature = "config-file")]
    pub fn from_toml_str(toml: &str) -> Result<Self, BuildError> {
        let parsed = env_config::parse_toml_str(toml)?;
        let mut builder = Self::new();
        env_config::apply_toml_config(&mut builder.base, &parsed);
        Ok(builder)
    }

    /// Resolves the final configuration without starting anything.
    ///
    /// # Errors
    ///
    /// Returns a [`BuildError`] for unparseable environment values or
    /// invalid settings.
    pub fn resolve(&self) -> Result<PlatformConfig, BuildError> {
        let mut config = self.base.clone();
        if self.env_overrides {
            env_config::apply_env_overrides(&mut config)?;
        }
        self.overrides.clone().apply(&mut config);
        if config.thread_name_prefix.contains('\0') {
            return Err(BuildError::invalid_value(
                "thread_name_prefix",
                "must not contain NUL bytes",
            ));
        }
        config.normalize();
        Ok(config)
    }

    /// Starts the platform.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::Build`](crate::PlatformError::Build) for a
    /// rejected configuration and
    /// [`PlatformError::Spawn`](crate::PlatformError::Spawn) if a platform
    /// thread cannot be started.
    pub fn build(self) -> Result<Platform> {
        let config = self.resolve()?;
        Platform::new(config)
    }
}

impl Default for PlatformBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PlatformBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlatformBuilder")
            .field("base", &self.base)
            .field("env_overrides", &self.env_overrides)
            .finish_non_exhaustive()
    }
}
