//! Pool and runtime configuration structures.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::core::{AppResult, SchedulerLimits};
use crate::util::PoolTypes;

/// Environment variable naming the JSON runtime configuration file.
pub const CONFIG_PATH_ENV: &str = "PROMETHEUS_WORK_CONFIG";

const DEFAULT_STACK_SIZE: usize = 2 * 1024 * 1024;

fn default_stack_size() -> usize {
    DEFAULT_STACK_SIZE
}

fn default_program() -> String {
    "work-host".to_string()
}

fn default_container_runtime() -> String {
    "docker".to_string()
}

/// Worker backend selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    /// Tokio tasks on the pool's runtime.
    Local,
    /// Dedicated OS thread per worker.
    Thread {
        /// Stack size of each worker thread.
        #[serde(default = "default_stack_size")]
        stack_size: usize,
    },
    /// Child process per worker speaking RPC over stdio.
    Process {
        /// Executable to launch.
        #[serde(default = "default_program")]
        program: String,
        /// Extra arguments.
        #[serde(default)]
        args: Vec<String>,
        /// Extra environment variables.
        #[serde(default)]
        env: HashMap<String, String>,
        /// First debug port handed out to children, if debugging is enabled.
        #[serde(default)]
        debug_port_base: Option<u16>,
    },
    /// Container per worker, launched through a container CLI.
    Container {
        /// Container CLI (`docker`, `podman`).
        #[serde(default = "default_container_runtime")]
        runtime: String,
        /// Image containing a worker host entrypoint.
        image: String,
        /// Extra arguments passed to the entrypoint.
        #[serde(default)]
        args: Vec<String>,
    },
}

/// Worker pool configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Pool name, reported as the consumer when claiming work.
    pub name: String,
    /// Workers kept alive even when idle.
    pub min_size: usize,
    /// Upper bound on concurrently existing workers.
    pub max_size: usize,
    /// Pool types this pool declares when polling.
    pub pool_types: PoolTypes,
    /// Back-off between polls that found nothing.
    pub poll_interval_ms: u64,
    /// Idle time after which a worker above `min_size` is retired.
    pub idle_timeout_ms: u64,
    /// Interval between batched log flushes.
    pub log_flush_interval_ms: u64,
    /// Time a cooperative abort gets before the host is killed.
    pub abort_grace_ms: u64,
    /// Worker backend.
    pub backend: BackendConfig,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            min_size: 0,
            max_size: num_cpus::get().max(1),
            pool_types: PoolTypes::new(),
            poll_interval_ms: 100,
            idle_timeout_ms: 30_000,
            log_flush_interval_ms: 250,
            abort_grace_ms: 2_000,
            backend: BackendConfig::Local,
        }
    }
}

impl WorkerPoolConfig {
    /// Configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the pool name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set both size bounds.
    #[must_use]
    pub const fn with_size(mut self, min_size: usize, max_size: usize) -> Self {
        self.min_size = min_size;
        self.max_size = max_size;
        self
    }

    /// Set the pool types declared when polling.
    #[must_use]
    pub fn with_pool_types<I, S>(mut self, pool_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.pool_types = pool_types.into_iter().map(Into::into).collect();
        self
    }

    /// Set the poll back-off.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = duration_ms(interval);
        self
    }

    /// Set the idle retirement timeout.
    #[must_use]
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout_ms = duration_ms(timeout);
        self
    }

    /// Set the log flush interval.
    #[must_use]
    pub fn with_log_flush_interval(mut self, interval: Duration) -> Self {
        self.log_flush_interval_ms = duration_ms(interval);
        self
    }

    /// Set the abort grace period.
    #[must_use]
    pub fn with_abort_grace(mut self, grace: Duration) -> Self {
        self.abort_grace_ms = duration_ms(grace);
        self
    }

    /// Set the backend.
    #[must_use]
    pub fn with_backend(mut self, backend: BackendConfig) -> Self {
        self.backend = backend;
        self
    }

    /// Poll back-off as a duration.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Idle timeout as a duration.
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Log flush interval as a duration.
    #[must_use]
    pub const fn log_flush_interval(&self) -> Duration {
        Duration::from_millis(self.log_flush_interval_ms)
    }

    /// Abort grace as a duration.
    #[must_use]
    pub const fn abort_grace(&self) -> Duration {
        Duration::from_millis(self.abort_grace_ms)
    }

    /// Validate pool configuration values.
    ///
    /// # Errors
    ///
    /// A description of the first invalid value.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("name must not be empty".into());
        }
        if self.max_size == 0 {
            return Err("max_size must be greater than 0".into());
        }
        if self.min_size > self.max_size {
            return Err(format!(
                "min_size ({}) must not exceed max_size ({})",
                self.min_size, self.max_size
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err("poll_interval_ms must be greater than 0".into());
        }
        if self.log_flush_interval_ms == 0 {
            return Err("log_flush_interval_ms must be greater than 0".into());
        }
        match &self.backend {
            BackendConfig::Process { program, .. } if program.trim().is_empty() => {
                Err("process backend needs a program".into())
            }
            BackendConfig::Container { image, .. } if image.trim().is_empty() => {
                Err("container backend needs an image".into())
            }
            BackendConfig::Container { runtime, .. } if runtime.trim().is_empty() => {
                Err("container backend needs a runtime".into())
            }
            _ => Ok(()),
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Root runtime configuration: one scheduler and its named pools.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Scheduler capacity limits.
    #[serde(default)]
    pub scheduler: SchedulerLimits,
    /// Map of pool name to configuration.
    pub pools: HashMap<String, WorkerPoolConfig>,
}

impl RuntimeConfig {
    /// Validate all pools and ensure at least one pool exists.
    ///
    /// # Errors
    ///
    /// A description naming the offending pool.
    pub fn validate(&self) -> Result<(), String> {
        if self.pools.is_empty() {
            return Err("at least one pool must be defined".into());
        }
        if self.scheduler.max_queue_depth == 0 {
            return Err("scheduler.max_queue_depth must be greater than 0".into());
        }
        for (name, pool) in &self.pools {
            pool.validate()
                .map_err(|e| format!("pool `{name}` invalid: {e}"))?;
        }
        Ok(())
    }

    /// Parse runtime configuration from a JSON string and validate.
    ///
    /// Pools left with the default name take their map key as name.
    ///
    /// # Errors
    ///
    /// Parse or validation failure.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let mut cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        let default_name = WorkerPoolConfig::default().name;
        for (key, pool) in &mut cfg.pools {
            if pool.name == default_name {
                pool.name.clone_from(key);
            }
        }
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load `.env` (if present), then read the file named by
    /// [`CONFIG_PATH_ENV`].
    ///
    /// # Errors
    ///
    /// Missing variable, unreadable file, or invalid configuration.
    pub fn from_env() -> AppResult<Self> {
        let _ = dotenvy::dotenv();
        let path = std::env::var(CONFIG_PATH_ENV)
            .with_context(|| format!("{CONFIG_PATH_ENV} is not set"))?;
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("cannot read runtime config `{path}`"))?;
        Self::from_json_str(&raw).map_err(|e| anyhow::anyhow!("runtime config `{path}`: {e}"))
    }
}
