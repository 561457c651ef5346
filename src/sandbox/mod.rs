//! Sandbox kernels
//!
//! This module provides per-session container kernels:
//! - One long-lived Docker container and interpreter per kernel
//! - A FIFO execution queue per kernel, kernels run in parallel
//! - A reaper for idle, expired, failed and orphaned kernels
//! - A durable ledger so containers survive a process crash without leaking

/// Shared-mount change detection
pub mod artifacts;
/// Single container teardown path
pub mod cleanup;
/// Docker implementation of the runtime adapter
pub mod docker;
/// Error taxonomy
pub mod error;
/// Kernel model and state machine
pub mod kernel;
/// Durable kernel to container record
pub mod ledger;
/// Kernel registry and public operations
pub mod manager;
/// Interpreter line protocol
pub mod protocol;
/// Per-kernel execution queue and worker
pub mod queue;
/// Background reclamation of kernels
pub mod reaper;
/// Container runtime adapter interface
pub mod runtime;

pub use artifacts::ArtifactScanner;
pub use cleanup::Reclaimer;
pub use docker::DockerRuntime;
pub use error::SandboxError;
pub use kernel::{
    ExecutionRequest, ExecutionResult, Kernel, KernelId, KernelState, KernelSummary, Language,
    ResourceLimits,
};
pub use ledger::{ContainerLedger, LedgerEntry};
pub use manager::SandboxManager;
pub use reaper::{ReapReason, ReapReport, Reaper};
pub use runtime::{ContainerRef, ContainerRuntime, ContainerSpec, ContainerStatus};
