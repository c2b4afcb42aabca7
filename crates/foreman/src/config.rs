//! Configuration for the task execution engine.
//!
//! Mirrors the builder-configuration idiom used elsewhere in this codebase:
//! construct via [`EngineConfig::builder`], or fall back to [`EngineConfig::default`].

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Tunables controlling scheduling, concurrency, retries, and storage locations.
///
/// # Construction
///
/// ```rust,ignore
/// let config = EngineConfig::builder()
///     .max_concurrent_executions(8)
///     .scheduler_interval(Duration::from_secs(5))
///     .build();
/// ```
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct EngineConfig {
    max_concurrent_executions: usize,
    scheduler_interval: Duration,
    default_timeout_seconds: u64,
    default_max_retries: u32,
    default_retry_delay_seconds: u64,
    result_cache_size: usize,
    cache_ttl_seconds: u64,
    data_dir: PathBuf,
}

impl EngineConfig {
    /// Creates a new configuration builder with default values.
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Maximum number of concurrently running executions (`N`).
    pub fn max_concurrent_executions(&self) -> usize {
        self.max_concurrent_executions
    }

    /// How often the scheduler ticks in the absence of wake-up events.
    pub fn scheduler_interval(&self) -> Duration {
        self.scheduler_interval
    }

    /// Default per-execution timeout when not overridden by the caller.
    pub fn default_timeout_seconds(&self) -> u64 {
        self.default_timeout_seconds
    }

    /// Default retry ceiling when not overridden by the caller.
    pub fn default_max_retries(&self) -> u32 {
        self.default_max_retries
    }

    /// Default base retry delay in seconds when not overridden by the caller.
    pub fn default_retry_delay_seconds(&self) -> u64 {
        self.default_retry_delay_seconds
    }

    /// Maximum number of entries kept in the in-memory result cache.
    pub fn result_cache_size(&self) -> usize {
        self.result_cache_size
    }

    /// How long a Workflow Cache (C2) entry stays valid before `Get` treats
    /// it as a miss.
    pub fn cache_ttl_seconds(&self) -> u64 {
        self.cache_ttl_seconds
    }

    /// Root directory under which `executions/`, `workflow_statuses.json`,
    /// `results/`, and `cache/` are stored.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn executions_dir(&self) -> PathBuf {
        self.data_dir.join("executions")
    }

    pub fn status_file(&self) -> PathBuf {
        self.data_dir.join("workflow_statuses.json")
    }

    pub fn results_dir(&self) -> PathBuf {
        self.data_dir.join("results")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.data_dir.join("cache")
    }

    /// Loads a configuration from a TOML file, falling back to defaults for
    /// any field the file omits.
    pub fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        #[derive(serde::Deserialize, Default)]
        #[serde(default)]
        struct Raw {
            max_concurrent_executions: Option<usize>,
            scheduler_interval_secs: Option<u64>,
            default_timeout_seconds: Option<u64>,
            default_max_retries: Option<u32>,
            default_retry_delay_seconds: Option<u64>,
            result_cache_size: Option<usize>,
            cache_ttl_seconds: Option<u64>,
            data_dir: Option<PathBuf>,
        }

        let raw: Raw = toml::from_str(contents)?;
        let mut builder = EngineConfigBuilder::default();
        if let Some(v) = raw.max_concurrent_executions {
            builder = builder.max_concurrent_executions(v);
        }
        if let Some(v) = raw.scheduler_interval_secs {
            builder = builder.scheduler_interval(Duration::from_secs(v));
        }
        if let Some(v) = raw.default_timeout_seconds {
            builder = builder.default_timeout_seconds(v);
        }
        if let Some(v) = raw.default_max_retries {
            builder = builder.default_max_retries(v);
        }
        if let Some(v) = raw.default_retry_delay_seconds {
            builder = builder.default_retry_delay_seconds(v);
        }
        if let Some(v) = raw.result_cache_size {
            builder = builder.result_cache_size(v);
        }
        if let Some(v) = raw.cache_ttl_seconds {
            builder = builder.cache_ttl_seconds(v);
        }
        if let Some(v) = raw.data_dir {
            builder = builder.data_dir(v);
        }
        Ok(builder.build())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfigBuilder::default().build()
    }
}

/// Builder for [`EngineConfig`].
#[derive(Debug, Clone)]
pub struct EngineConfigBuilder {
    max_concurrent_executions: usize,
    scheduler_interval: Duration,
    default_timeout_seconds: u64,
    default_max_retries: u32,
    default_retry_delay_seconds: u64,
    result_cache_size: usize,
    cache_ttl_seconds: u64,
    data_dir: PathBuf,
}

impl Default for EngineConfigBuilder {
    fn default() -> Self {
        Self {
            max_concurrent_executions: 4,
            scheduler_interval: Duration::from_secs(5),
            default_timeout_seconds: 3600,
            default_max_retries: 3,
            default_retry_delay_seconds: 5,
            result_cache_size: 100,
            cache_ttl_seconds: 3600,
            data_dir: PathBuf::from("./foreman-data"),
        }
    }
}

impl EngineConfigBuilder {
    pub fn max_concurrent_executions(mut self, n: usize) -> Self {
        self.max_concurrent_executions = n;
        self
    }

    pub fn scheduler_interval(mut self, d: Duration) -> Self {
        self.scheduler_interval = d;
        self
    }

    pub fn default_timeout_seconds(mut self, s: u64) -> Self {
        self.default_timeout_seconds = s;
        self
    }

    pub fn default_max_retries(mut self, n: u32) -> Self {
        self.default_max_retries = n;
        self
    }

    pub fn default_retry_delay_seconds(mut self, s: u64) -> Self {
        self.default_retry_delay_seconds = s;
        self
    }

    pub fn result_cache_size(mut self, n: usize) -> Self {
        self.result_cache_size = n;
        self
    }

    pub fn cache_ttl_seconds(mut self, s: u64) -> Self {
        self.cache_ttl_seconds = s;
        self
    }

    pub fn data_dir(mut self, p: impl Into<PathBuf>) -> Self {
        self.data_dir = p.into();
        self
    }

    pub fn build(self) -> EngineConfig {
        EngineConfig {
            max_concurrent_executions: self.max_concurrent_executions.max(1),
            scheduler_interval: self.scheduler_interval,
            default_timeout_seconds: self.default_timeout_seconds,
            default_max_retries: self.default_max_retries,
            default_retry_delay_seconds: self.default_retry_delay_seconds,
            result_cache_size: self.result_cache_size,
            cache_ttl_seconds: self.cache_ttl_seconds,
            data_dir: self.data_dir,
        }
    }
}
