//! Kernel data model and state machine.
//!
//! A kernel is one live interpreter session bound to exactly one container.
//! Mutable status lives behind a short-lived `std::sync::Mutex`; lifecycle
//! operations that await (destroy, reap) serialize on a per-kernel async lock
//! so they never contend with other kernels.

use super::error::SandboxError;
use super::queue::ExecutionQueue;
use super::runtime::ContainerRef;
use crate::config::SandboxSettings;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::protocol::{BASH_DRIVER, PYTHON_DRIVER};

/// Opaque kernel identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KernelId(String);

impl KernelId {
    /// Generate a fresh random identifier
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("k-{}", Uuid::new_v4().simple()))
    }
}

impl fmt::Display for KernelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for KernelId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for KernelId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Interpreter flavour of a kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    /// Persistent Python interpreter; globals survive across calls
    Python,
    /// Persistent Bash shell; variables and cwd survive across calls
    Bash,
}

impl Language {
    /// Container image for this language
    #[must_use]
    pub fn image(self, settings: &SandboxSettings) -> &str {
        match self {
            Self::Python => &settings.python_image,
            Self::Bash => &settings.bash_image,
        }
    }

    /// Command line of the in-container driver; the marker is always the last argument
    #[must_use]
    pub fn driver_command(self, marker: &str) -> Vec<String> {
        match self {
            Self::Python => vec![
                "python3".to_string(),
                "-u".to_string(),
                "-c".to_string(),
                PYTHON_DRIVER.to_string(),
                marker.to_string(),
            ],
            Self::Bash => vec![
                "bash".to_string(),
                "-c".to_string(),
                BASH_DRIVER.to_string(),
                "oxide-kernel".to_string(),
                marker.to_string(),
            ],
        }
    }

    /// No-op snippet that must round-trip before the kernel is Ready
    #[must_use]
    pub const fn readiness_probe(self) -> &'static str {
        match self {
            Self::Python => "pass",
            Self::Bash => "true",
        }
    }

    /// Lowercase name used on the wire
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::Bash => "bash",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "python" | "python3" => Ok(Self::Python),
            "bash" | "sh" | "shell" => Ok(Self::Bash),
            other => Err(SandboxError::Validation(format!(
                "Unsupported language: {other}"
            ))),
        }
    }
}

/// Kernel lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelState {
    /// Allocated, no container yet
    Created,
    /// Container starting, waiting for the readiness probe
    Starting,
    /// Idle and accepting work
    Ready,
    /// Running exactly one request
    Executing,
    /// Being torn down
    Terminating,
    /// Torn down; terminal
    Terminated,
    /// Crashed, timed out, cancelled mid-run or failed to start; terminal
    Failed,
}

impl KernelState {
    /// `Terminated` and `Failed` absorb every further transition
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated | Self::Failed)
    }
}

/// Per-kernel resource limits
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceLimits {
    /// CPUs available to the container
    pub cpus: f64,
    /// Memory limit in bytes
    pub memory_bytes: i64,
    /// Maximum number of processes
    pub pids_limit: i64,
    /// Default wall-clock limit per call
    pub exec_timeout: Duration,
    /// Idle time after which the reaper destroys a Ready kernel
    pub idle_timeout: Duration,
}

/// Smallest memory limit a container engine reliably accepts (6MB)
const MIN_MEMORY_BYTES: i64 = 6 * 1024 * 1024;

impl ResourceLimits {
    /// Check the limits are usable
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::Validation` describing the first bad field.
    pub fn validate(&self, max_exec_timeout: Duration) -> Result<(), SandboxError> {
        if !self.cpus.is_finite() || self.cpus <= 0.0 {
            return Err(SandboxError::Validation(format!(
                "cpus must be positive, got {}",
                self.cpus
            )));
        }
        if self.memory_bytes < MIN_MEMORY_BYTES {
            return Err(SandboxError::Validation(format!(
                "memory limit must be at least {MIN_MEMORY_BYTES} bytes"
            )));
        }
        if self.pids_limit <= 0 {
            return Err(SandboxError::Validation(
                "pids limit must be positive".to_string(),
            ));
        }
        if self.exec_timeout.is_zero() || self.exec_timeout > max_exec_timeout {
            return Err(SandboxError::Validation(format!(
                "execution timeout must be within 1..={}s",
                max_exec_timeout.as_secs()
            )));
        }
        if self.idle_timeout.is_zero() {
            return Err(SandboxError::Validation(
                "idle timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// A single code submission; immutable once enqueued
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    /// Caller-visible identifier, usable for cancellation
    pub request_id: String,
    /// Target kernel
    pub kernel_id: KernelId,
    /// Source text
    pub code: String,
    /// Per-call wall-clock limit replacing the kernel default
    pub timeout_override: Option<Duration>,
}

impl ExecutionRequest {
    /// Build a request with a generated id
    #[must_use]
    pub fn new(kernel_id: KernelId, code: impl Into<String>) -> Self {
        Self {
            request_id: format!("r-{}", Uuid::new_v4().simple()),
            kernel_id,
            code: code.into(),
            timeout_override: None,
        }
    }

    /// Use a caller-provided request id
    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    /// Override the kernel's default timeout for this call
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout_override = timeout;
        self
    }
}

/// Outcome of a completed execution
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    /// Request this result answers
    pub request_id: String,
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
    /// Interpreter exit status of the snippet
    pub exit_code: i64,
    /// Shared-mount paths (relative to the mount root) created or modified during the call
    pub artifacts: Vec<String>,
    /// Wall-clock duration of the call
    pub duration_ms: u64,
    /// Output exceeded the size cap and was cut
    pub truncated: bool,
}

impl ExecutionResult {
    /// Check if the snippet succeeded (exit code 0)
    #[must_use]
    pub const fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Read-only view of a kernel for listings
#[derive(Debug, Clone, Serialize)]
pub struct KernelSummary {
    /// Kernel identifier
    pub kernel_id: KernelId,
    /// Interpreter language
    pub language: Language,
    /// Current state
    pub state: KernelState,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last completed call (or creation)
    pub last_active_at: DateTime<Utc>,
    /// Failure reason when `state` is `Failed`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

#[derive(Debug)]
struct KernelStatus {
    state: KernelState,
    container: Option<ContainerRef>,
    last_active: Instant,
    last_active_at: DateTime<Utc>,
    failure: Option<String>,
    failed_at: Option<Instant>,
}

/// A live execution session bound to one container
#[derive(Debug)]
pub struct Kernel {
    id: KernelId,
    language: Language,
    limits: ResourceLimits,
    created: Instant,
    created_at: DateTime<Utc>,
    status: Mutex<KernelStatus>,
    queue: ExecutionQueue,
    lifecycle: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
}

impl Kernel {
    /// Allocate a kernel in the `Created` state
    #[must_use]
    pub fn new(language: Language, limits: ResourceLimits, queue: ExecutionQueue) -> Self {
        let now = Utc::now();
        Self {
            id: KernelId::generate(),
            language,
            limits,
            created: Instant::now(),
            created_at: now,
            status: Mutex::new(KernelStatus {
                state: KernelState::Created,
                container: None,
                last_active: Instant::now(),
                last_active_at: now,
                failure: None,
                failed_at: None,
            }),
            queue,
            lifecycle: tokio::sync::Mutex::new(()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Kernel identifier
    #[must_use]
    pub const fn id(&self) -> &KernelId {
        &self.id
    }

    /// Interpreter language
    #[must_use]
    pub const fn language(&self) -> Language {
        self.language
    }

    /// Resource limits
    #[must_use]
    pub const fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Monotonic creation instant
    #[must_use]
    pub const fn created(&self) -> Instant {
        self.created
    }

    /// The kernel's execution queue
    #[must_use]
    pub const fn queue(&self) -> &ExecutionQueue {
        &self.queue
    }

    /// Token cancelled when the kernel is being torn down
    #[must_use]
    pub const fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Async lock serializing destroy and reap of this kernel
    pub(crate) async fn lock_lifecycle(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.lifecycle.lock().await
    }

    fn status(&self) -> MutexGuard<'_, KernelStatus> {
        // Status updates are plain field writes; a poisoned guard is still consistent
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> KernelState {
        self.status().state
    }

    /// Monotonic instant of the last completed call
    #[must_use]
    pub fn last_active(&self) -> Instant {
        self.status().last_active
    }

    /// Instant the kernel entered `Failed`
    #[must_use]
    pub fn failed_at(&self) -> Option<Instant> {
        self.status().failed_at
    }

    /// Container currently owned by the kernel
    #[must_use]
    pub fn container(&self) -> Option<ContainerRef> {
        self.status().container.clone()
    }

    /// Snapshot for listings
    #[must_use]
    pub fn summary(&self) -> KernelSummary {
        let status = self.status();
        KernelSummary {
            kernel_id: self.id.clone(),
            language: self.language,
            state: status.state,
            created_at: self.created_at,
            last_active_at: status.last_active_at,
            failure: status.failure.clone(),
        }
    }

    /// Error to report for a kernel that can no longer take work, if any
    #[must_use]
    pub fn unusable_error(&self) -> Option<SandboxError> {
        let status = self.status();
        match status.state {
            KernelState::Failed => Some(SandboxError::KernelFailed {
                kernel_id: self.id.clone(),
                reason: status
                    .failure
                    .clone()
                    .unwrap_or_else(|| "unknown failure".to_string()),
            }),
            KernelState::Terminating | KernelState::Terminated => {
                Some(SandboxError::NotFound(self.id.clone()))
            }
            _ => None,
        }
    }

    /// `Created -> Starting`, taking ownership of the container reference
    pub(crate) fn begin_start(&self, container: ContainerRef) -> bool {
        let mut status = self.status();
        if status.state != KernelState::Created {
            return false;
        }
        status.state = KernelState::Starting;
        status.container = Some(container);
        true
    }

    /// Replace the provisional container reference once the engine assigned an id
    pub(crate) fn update_container(&self, container: ContainerRef) -> bool {
        let mut status = self.status();
        if status.state != KernelState::Starting {
            return false;
        }
        status.container = Some(container);
        true
    }

    /// `Starting -> Ready`
    pub(crate) fn mark_ready(&self) -> bool {
        let mut status = self.status();
        if status.state != KernelState::Starting {
            return false;
        }
        status.state = KernelState::Ready;
        status.last_active = Instant::now();
        status.last_active_at = Utc::now();
        true
    }

    /// `Ready -> Executing`
    pub(crate) fn begin_execution(&self) -> bool {
        let mut status = self.status();
        if status.state != KernelState::Ready {
            return false;
        }
        status.state = KernelState::Executing;
        true
    }

    /// Hold off the idle reaper while work is queued on a Ready kernel.
    ///
    /// The reported `last_active_at` only moves when a call completes.
    pub(crate) fn touch(&self) {
        let mut status = self.status();
        if status.state == KernelState::Ready {
            status.last_active = Instant::now();
        }
    }

    /// `Executing -> Ready`, refreshing the activity timestamps
    pub(crate) fn finish_execution(&self) -> bool {
        let mut status = self.status();
        if status.state != KernelState::Executing {
            return false;
        }
        status.state = KernelState::Ready;
        status.last_active = Instant::now();
        status.last_active_at = Utc::now();
        true
    }

    /// Move to `Failed` from any live state, handing back the container to release.
    ///
    /// Returns `None` when the kernel was already terminal or terminating, or
    /// when another caller already took the container.
    pub(crate) fn fail(&self, reason: impl Into<String>) -> Option<ContainerRef> {
        let mut status = self.status();
        if status.state.is_terminal() || status.state == KernelState::Terminating {
            return None;
        }
        status.state = KernelState::Failed;
        status.failure = Some(reason.into());
        status.failed_at = Some(Instant::now());
        status.container.take()
    }

    /// Enter `Terminating` (a `Failed` kernel stays `Failed`) and hand back the container
    pub(crate) fn begin_termination(&self) -> Option<ContainerRef> {
        let mut status = self.status();
        if status.state != KernelState::Failed && status.state != KernelState::Terminated {
            status.state = KernelState::Terminating;
        }
        status.container.take()
    }

    /// `Terminating -> Terminated`
    pub(crate) fn mark_terminated(&self) {
        let mut status = self.status();
        if status.state == KernelState::Terminating {
            status.state = KernelState::Terminated;
        }
    }
}
