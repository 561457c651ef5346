//! Configuration and settings management
//!
//! Loads sandbox settings from config files and `SANDBOX_*` environment
//! variables and defines the default limits.

use crate::sandbox::ResourceLimits;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

// Container images
/// Image used for Python kernels
pub const SANDBOX_PYTHON_IMAGE: &str = "python:3.12-slim";
/// Image used for Bash kernels
pub const SANDBOX_BASH_IMAGE: &str = "bash:5.2";

// Shared mount
/// Host directory shared with every kernel
pub const SANDBOX_SHARED_DIR: &str = "./sandbox-data";
/// Fixed in-container path of the shared directory
pub const SANDBOX_MOUNT_PATH: &str = "/workspace";

// Global limits
/// Maximum number of live kernels
pub const SANDBOX_MAX_KERNELS: usize = 8;
/// Maximum kernel lifetime regardless of activity
pub const SANDBOX_MAX_LIFETIME_SECS: u64 = 3600; // 1 hour
/// Interval between reaper sweeps
pub const SANDBOX_REAPER_INTERVAL_SECS: u64 = 15;
/// How long a failed kernel stays listed before it is reaped
pub const SANDBOX_FAILED_GRACE_SECS: u64 = 60;
/// Time allowed for a container to start and its interpreter to answer the probe
pub const SANDBOX_STARTUP_TIMEOUT_SECS: u64 = 60;

// Per-kernel defaults
/// CPU share per kernel (number of CPUs)
pub const SANDBOX_CPUS: f64 = 1.0;
/// Memory limit per kernel (512MB)
pub const SANDBOX_MEMORY_LIMIT: i64 = 512 * 1024 * 1024;
/// CPU period used to express the CPU quota
pub const SANDBOX_CPU_PERIOD: i64 = 100_000;
/// Process limit per kernel
pub const SANDBOX_PIDS_LIMIT: i64 = 256;
/// Default wall-clock limit per execution
pub const SANDBOX_EXEC_TIMEOUT_SECS: u64 = 60; // 1 minute per call
/// Upper bound for any per-call or per-kernel execution timeout
pub const SANDBOX_MAX_EXEC_TIMEOUT_SECS: u64 = 600;
/// Default idle timeout per kernel
pub const SANDBOX_IDLE_TIMEOUT_SECS: u64 = 600; // 10 minutes
/// Output cap per stream (1MB)
pub const SANDBOX_MAX_OUTPUT_BYTES: usize = 1024 * 1024;
/// Docker network mode for kernels
pub const SANDBOX_NETWORK_MODE: &str = "none";

/// Sandbox settings loaded from files and environment variables
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SandboxSettings {
    /// Host directory mounted read-write into every kernel
    #[serde(default = "default_shared_dir")]
    pub shared_dir: PathBuf,
    /// In-container mount point of `shared_dir`
    #[serde(default = "default_container_mount_path")]
    pub container_mount_path: String,

    /// Image for Python kernels
    #[serde(default = "default_python_image")]
    pub python_image: String,
    /// Image for Bash kernels
    #[serde(default = "default_bash_image")]
    pub bash_image: String,
    /// Pull an image when the engine does not have it locally
    #[serde(default = "default_true")]
    pub pull_missing_images: bool,

    /// Maximum number of live kernels
    #[serde(default = "default_max_kernels")]
    pub max_kernels: usize,
    /// Maximum kernel lifetime in seconds
    #[serde(default = "default_max_lifetime_secs")]
    pub max_lifetime_secs: u64,
    /// Reaper sweep interval in seconds
    #[serde(default = "default_reaper_interval_secs")]
    pub reaper_interval_secs: u64,
    /// Seconds a failed kernel remains visible before it is reaped
    #[serde(default = "default_failed_grace_secs")]
    pub failed_grace_secs: u64,
    /// Container start plus readiness probe deadline in seconds
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,

    /// Default CPUs per kernel
    #[serde(default = "default_cpus")]
    pub cpus: f64,
    /// Default memory limit per kernel in bytes
    #[serde(default = "default_memory_bytes")]
    pub memory_bytes: i64,
    /// Default process limit per kernel
    #[serde(default = "default_pids_limit")]
    pub pids_limit: i64,
    /// Default per-call timeout in seconds
    #[serde(default = "default_exec_timeout_secs")]
    pub exec_timeout_secs: u64,
    /// Upper bound for per-call and per-kernel timeouts in seconds
    #[serde(default = "default_max_exec_timeout_secs")]
    pub max_exec_timeout_secs: u64,
    /// Default idle timeout per kernel in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Output cap per stream in bytes
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    /// Docker network mode for kernel containers
    #[serde(default = "default_network_mode")]
    pub network_mode: String,

    /// `uid[:gid]` for kernel containers; defaults to the owner of `shared_dir`
    pub container_user: Option<String>,

    /// Durable kernel to container record, enables orphan recovery across restarts
    pub ledger_path: Option<PathBuf>,
}

fn default_shared_dir() -> PathBuf {
    PathBuf::from(SANDBOX_SHARED_DIR)
}

fn default_container_mount_path() -> String {
    SANDBOX_MOUNT_PATH.to_string()
}

fn default_python_image() -> String {
    SANDBOX_PYTHON_IMAGE.to_string()
}

fn default_bash_image() -> String {
    SANDBOX_BASH_IMAGE.to_string()
}

const fn default_true() -> bool {
    true
}

const fn default_max_kernels() -> usize {
    SANDBOX_MAX_KERNELS
}

const fn default_max_lifetime_secs() -> u64 {
    SANDBOX_MAX_LIFETIME_SECS
}

const fn default_reaper_interval_secs() -> u64 {
    SANDBOX_REAPER_INTERVAL_SECS
}

const fn default_failed_grace_secs() -> u64 {
    SANDBOX_FAILED_GRACE_SECS
}

const fn default_startup_timeout_secs() -> u64 {
    SANDBOX_STARTUP_TIMEOUT_SECS
}

const fn default_cpus() -> f64 {
    SANDBOX_CPUS
}

const fn default_memory_bytes() -> i64 {
    SANDBOX_MEMORY_LIMIT
}

const fn default_pids_limit() -> i64 {
    SANDBOX_PIDS_LIMIT
}

const fn default_exec_timeout_secs() -> u64 {
    SANDBOX_EXEC_TIMEOUT_SECS
}

const fn default_max_exec_timeout_secs() -> u64 {
    SANDBOX_MAX_EXEC_TIMEOUT_SECS
}

const fn default_idle_timeout_secs() -> u64 {
    SANDBOX_IDLE_TIMEOUT_SECS
}

const fn default_max_output_bytes() -> usize {
    SANDBOX_MAX_OUTPUT_BYTES
}

fn default_network_mode() -> String {
    SANDBOX_NETWORK_MODE.to_string()
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            shared_dir: default_shared_dir(),
            container_mount_path: default_container_mount_path(),
            python_image: default_python_image(),
            bash_image: default_bash_image(),
            pull_missing_images: default_true(),
            max_kernels: default_max_kernels(),
            max_lifetime_secs: default_max_lifetime_secs(),
            reaper_interval_secs: default_reaper_interval_secs(),
            failed_grace_secs: default_failed_grace_secs(),
            startup_timeout_secs: default_startup_timeout_secs(),
            cpus: default_cpus(),
            memory_bytes: default_memory_bytes(),
            pids_limit: default_pids_limit(),
            exec_timeout_secs: default_exec_timeout_secs(),
            max_exec_timeout_secs: default_max_exec_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            max_output_bytes: default_max_output_bytes(),
            network_mode: default_network_mode(),
            container_user: None,
            ledger_path: None,
        }
    }
}

impl SandboxSettings {
    /// Create new settings by loading from config files and environment
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use oxide_sandbox::config::SandboxSettings;
    ///
    /// let settings = SandboxSettings::new().expect("Failed to load configuration");
    /// ```
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if loading fails or a value is out of range.
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{run_mode}")).required(false))
            // Local overrides, not checked into git
            .add_source(File::with_name("config/local").required(false))
            // Eg. `SANDBOX_MAX_KERNELS=4 ./target/oxide-sandbox`
            .add_source(
                Environment::with_prefix("SANDBOX")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .ignore_empty(true),
            )
            .build()?;

        let settings: Self = s.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject settings the manager cannot operate with
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Message` naming the offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Message(msg.to_string()));

        if self.max_kernels == 0 {
            return invalid("max_kernels must be at least 1");
        }
        if self.reaper_interval_secs == 0 {
            return invalid("reaper_interval_secs must be at least 1");
        }
        if self.startup_timeout_secs == 0 {
            return invalid("startup_timeout_secs must be at least 1");
        }
        if self.max_output_bytes == 0 {
            return invalid("max_output_bytes must be at least 1");
        }
        if !self.container_mount_path.starts_with('/') {
            return invalid("container_mount_path must be an absolute path");
        }
        if self
            .container_user
            .as_deref()
            .is_some_and(|user| user.trim().is_empty())
        {
            return invalid("container_user must not be empty");
        }
        if self.exec_timeout_secs == 0 || self.exec_timeout_secs > self.max_exec_timeout_secs {
            return invalid("exec_timeout_secs must be within 1..=max_exec_timeout_secs");
        }
        self.default_limits()
            .validate(self.max_exec_timeout())
            .or_else(|e| invalid(&e.to_string()))
    }

    /// Per-kernel limits used when a caller does not supply its own
    #[must_use]
    pub fn default_limits(&self) -> ResourceLimits {
        ResourceLimits {
            cpus: self.cpus,
            memory_bytes: self.memory_bytes,
            pids_limit: self.pids_limit,
            exec_timeout: Duration::from_secs(self.exec_timeout_secs),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
        }
    }

    /// Maximum kernel lifetime
    #[must_use]
    pub const fn max_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_lifetime_secs)
    }

    /// Reaper sweep interval
    #[must_use]
    pub const fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }

    /// Grace window for failed kernels
    #[must_use]
    pub const fn failed_grace(&self) -> Duration {
        Duration::from_secs(self.failed_grace_secs)
    }

    /// Container start plus readiness deadline
    #[must_use]
    pub const fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    /// Upper bound for execution timeouts
    #[must_use]
    pub const fn max_exec_timeout(&self) -> Duration {
        Duration::from_secs(self.max_exec_timeout_secs)
    }
}
