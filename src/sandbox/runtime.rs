//! Container runtime adapter interface.
//!
//! The manager only talks to the container engine through [`ContainerRuntime`],
//! so tests can substitute an in-memory engine.

use super::error::SandboxError;
use super::kernel::{KernelId, ResourceLimits};
use async_trait::async_trait;
use futures_util::Stream;
use std::collections::HashMap;
use std::path::PathBuf;
use std::pin::Pin;
use tokio::io::AsyncWrite;

/// Label marking every container this crate owns
pub const LABEL_SANDBOX: &str = "oxide.sandbox";
/// Label carrying the owning kernel id
pub const LABEL_KERNEL_ID: &str = "oxide.sandbox.kernel_id";
/// Label carrying the kernel language
pub const LABEL_LANGUAGE: &str = "oxide.sandbox.language";

/// Handle to a container owned by one kernel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRef {
    /// Engine id, or the name until the engine assigned one
    pub id: String,
    /// Unique container name
    pub name: String,
}

impl ContainerRef {
    /// Reference a container by name only (before creation)
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: name.clone(),
            name,
        }
    }
}

/// Host directory bound into a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    /// Host path
    pub host_path: PathBuf,
    /// Path inside the container
    pub container_path: String,
    /// Mount read-only
    pub read_only: bool,
}

/// Everything needed to start one kernel container
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Unique container name
    pub name: String,
    /// Image reference
    pub image: String,
    /// Bind mounts
    pub mounts: Vec<Mount>,
    /// CPU, memory and process limits
    pub limits: ResourceLimits,
    /// Ownership labels
    pub labels: HashMap<String, String>,
    /// Network mode (`none`, `bridge`, ...)
    pub network_mode: String,
    /// Working directory inside the container
    pub working_dir: String,
    /// `uid:gid` the container runs as; the image default when `None`
    pub user: Option<String>,
}

/// One piece of exec output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputChunk {
    /// Bytes written to stdout
    Stdout(Vec<u8>),
    /// Bytes written to stderr
    Stderr(Vec<u8>),
}

/// Stream of exec output chunks; ends when the process exits
pub type OutputStream = Pin<Box<dyn Stream<Item = Result<OutputChunk, SandboxError>> + Send>>;

/// A process running inside a container with stdin attached
pub struct ExecSession {
    /// Process stdin
    pub input: Pin<Box<dyn AsyncWrite + Send>>,
    /// Process stdout and stderr
    pub output: OutputStream,
}

impl std::fmt::Debug for ExecSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecSession").finish_non_exhaustive()
    }
}

/// Observed container status
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerStatus {
    /// Running normally
    Running,
    /// Stopped
    Exited {
        /// Exit code of PID 1, when known
        exit_code: Option<i64>,
        /// Killed by the OOM killer
        oom_killed: bool,
    },
    /// The engine does not know the container
    Missing,
}

/// Container discovered through labels
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    /// The container
    pub container: ContainerRef,
    /// Owning kernel, from the kernel id label
    pub kernel_id: Option<KernelId>,
}

/// Capability interface to the host container engine
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create and start an isolated container
    async fn start_container(&self, spec: &ContainerSpec) -> Result<ContainerRef, SandboxError>;

    /// Start a process inside a running container with stdin, stdout and stderr attached
    async fn exec_attached(
        &self,
        container: &ContainerRef,
        argv: Vec<String>,
    ) -> Result<ExecSession, SandboxError>;

    /// Report whether the container is still running
    async fn inspect_container(
        &self,
        container: &ContainerRef,
    ) -> Result<ContainerStatus, SandboxError>;

    /// Kill the container; succeeds on an already-dead or missing container
    async fn kill_container(&self, container: &ContainerRef) -> Result<(), SandboxError>;

    /// Remove the container; succeeds on a missing container
    async fn remove_container(&self, container: &ContainerRef) -> Result<(), SandboxError>;

    /// List containers carrying `label`, running or not
    async fn list_containers(&self, label: &str) -> Result<Vec<ContainerSummary>, SandboxError>;
}
