//! Error taxonomy for sandbox operations.

use super::kernel::KernelId;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the sandbox manager and its collaborators
#[derive(Debug, Error)]
pub enum SandboxError {
    /// Malformed request or unsupported value, rejected before touching a container
    #[error("Invalid request: {0}")]
    Validation(String),
    /// Unknown or terminated kernel
    #[error("Kernel {0} not found")]
    NotFound(KernelId),
    /// Kernel is in the `Failed` state and cannot be used again
    #[error("Kernel {kernel_id} failed: {reason}")]
    KernelFailed {
        /// Kernel that failed
        kernel_id: KernelId,
        /// Recorded failure reason
        reason: String,
    },
    /// Container engine failed to start, exec, inspect or kill
    #[error("Container error: {0}")]
    Container(String),
    /// Execution exceeded its wall-clock limit; the kernel was killed
    #[error("Execution {request_id} timed out after {}s", .limit.as_secs())]
    Timeout {
        /// Request that timed out
        request_id: String,
        /// Limit that was exceeded
        limit: Duration,
    },
    /// Global kernel cap reached
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),
    /// Execution was cancelled by the caller
    #[error("Execution {0} was cancelled")]
    Cancelled(String),
    /// Durable ledger could not be read or written
    #[error("Ledger error: {0}")]
    Ledger(String),
}

impl SandboxError {
    /// Stable machine-readable tag for the error class
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::NotFound(_) => "not_found",
            Self::KernelFailed { .. } => "kernel_failed",
            Self::Container(_) => "container_error",
            Self::Timeout { .. } => "timeout",
            Self::ResourceExhausted(_) => "resource_exhausted",
            Self::Cancelled(_) => "cancelled",
            Self::Ledger(_) => "ledger_error",
        }
    }
}

impl From<bollard::errors::Error> for SandboxError {
    fn from(e: bollard::errors::Error) -> Self {
        Self::Container(e.to_string())
    }
}

impl From<std::io::Error> for SandboxError {
    fn from(e: std::io::Error) -> Self {
        Self::Container(format!("I/O error: {e}"))
    }
}
