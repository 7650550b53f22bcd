use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::errors::{GuardError, Result};
use crate::model::TaskType;

/// Runtime configuration shared by the guard, logger, workflow and worker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    // Storage configuration
    /// Backend data directory, parent of the task log directory
    pub data_dir: PathBuf,
    /// Task log directory relative to `data_dir`
    pub tasks_dir: PathBuf,
    /// Sled database path; `None` keeps records in memory
    pub db_path: Option<PathBuf>,

    // Task execution configuration
    /// Interval between `last_ping` updates of a running task
    pub heartbeat_interval: Duration,
    /// A running task without a heartbeat for this long is presumed dead
    pub stall_timeout: Duration,
    /// Task types that exclude each other on the same project
    pub conflicting_types: Vec<TaskType>,

    // Worker pool configuration
    /// Maximum number of resets running at once
    pub max_workers: usize,
    /// How often the worker scans for pending resets and stale tasks
    pub schedule_interval: Duration,

    // Query configuration
    pub default_page_limit: usize,
}

impl Default for GuardConfig {
    fn default() -> Self {
        let cpu_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        Self {
            data_dir: PathBuf::from("data"),
            tasks_dir: PathBuf::from("tasks"),
            db_path: None,

            heartbeat_interval: Duration::from_secs(10),
            stall_timeout: Duration::from_secs(120),
            conflicting_types: vec![TaskType::Analysis, TaskType::Reset, TaskType::Delete],

            max_workers: cpu_count.max(1),
            schedule_interval: Duration::from_secs(30),

            default_page_limit: 20,
        }
    }
}

impl GuardConfig {
    /// Create a new builder for GuardConfig
    pub fn builder() -> GuardConfigBuilder {
        GuardConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(GuardError::configuration_field(
                "max_workers must be greater than 0",
                "max_workers",
            ));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(GuardError::configuration_field(
                "heartbeat_interval must be greater than 0",
                "heartbeat_interval",
            ));
        }
        if self.schedule_interval.is_zero() {
            return Err(GuardError::configuration_field(
                "schedule_interval must be greater than 0",
                "schedule_interval",
            ));
        }
        if self.stall_timeout <= self.heartbeat_interval {
            return Err(GuardError::configuration_field(
                "stall_timeout should be greater than heartbeat_interval",
                "stall_timeout",
            ));
        }
        if self.conflicting_types.is_empty() {
            return Err(GuardError::configuration_field(
                "conflicting_types cannot be empty",
                "conflicting_types",
            ));
        }
        if self.default_page_limit == 0 {
            return Err(GuardError::configuration_field(
                "default_page_limit must be greater than 0",
                "default_page_limit",
            ));
        }
        Ok(())
    }

    /// Create a configuration suited for tests and local runs
    pub fn development() -> Self {
        Self {
            max_workers: 2,
            schedule_interval: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(1),
            stall_timeout: Duration::from_secs(10),
            ..Default::default()
        }
    }

    /// Create a configuration for production workers
    pub fn production() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/projectguard"),
            db_path: Some(PathBuf::from("/var/lib/projectguard/records.db")),
            heartbeat_interval: Duration::from_secs(30),
            stall_timeout: Duration::from_secs(300),
            ..Default::default()
        }
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| GuardError::io(format!("read config {}", path.display()), e))?;
        Self::from_yaml_str(&raw)
    }

    /// Apply `PROJECTGUARD_*` environment variables on top of this configuration
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(dir) = std::env::var("PROJECTGUARD_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Ok(secs) = std::env::var("PROJECTGUARD_HEARTBEAT_SECS") {
            let secs: u64 = secs.parse().map_err(|_| {
                GuardError::configuration_field(
                    format!("invalid heartbeat seconds: {}", secs),
                    "PROJECTGUARD_HEARTBEAT_SECS",
                )
            })?;
            self.heartbeat_interval = Duration::from_secs(secs);
        }
        if let Ok(workers) = std::env::var("PROJECTGUARD_MAX_WORKERS") {
            self.max_workers = workers.parse().map_err(|_| {
                GuardError::configuration_field(
                    format!("invalid worker count: {}", workers),
                    "PROJECTGUARD_MAX_WORKERS",
                )
            })?;
        }
        self.validate()?;
        Ok(self)
    }

    /// Directory holding the per-task log files
    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join(&self.tasks_dir)
    }

    /// Log file of the task with the given primary key
    pub fn log_path(&self, task_pk: &str) -> PathBuf {
        self.log_dir().join(format!("{}.log", task_pk))
    }
}

/// Builder for GuardConfig
pub struct GuardConfigBuilder {
    config: GuardConfig,
}

impl GuardConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: GuardConfig::default(),
        }
    }

    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.data_dir = dir.into();
        self
    }

    pub fn tasks_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.tasks_dir = dir.into();
        self
    }

    pub fn db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.db_path = Some(path.into());
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    pub fn stall_timeout(mut self, timeout: Duration) -> Self {
        self.config.stall_timeout = timeout;
        self
    }

    pub fn conflicting_types(mut self, types: Vec<TaskType>) -> Self {
        self.config.conflicting_types = types;
        self
    }

    pub fn max_workers(mut self, workers: usize) -> Self {
        self.config.max_workers = workers;
        self
    }

    pub fn schedule_interval(mut self, interval: Duration) -> Self {
        self.config.schedule_interval = interval;
        self
    }

    pub fn default_page_limit(mut self, limit: usize) -> Self {
        self.config.default_page_limit = limit;
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<GuardConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for GuardConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
