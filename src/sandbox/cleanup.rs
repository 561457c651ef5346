//! The single container teardown path.
//!
//! Destroy, reap, timeout-kill and crash handling all hand their container to
//! [`Reclaimer::release`]. Callers obtain the container by taking it out of the
//! kernel status, so each container reaches this routine at most once.

use super::error::SandboxError;
use super::kernel::{Kernel, KernelId};
use super::ledger::{ContainerLedger, LedgerEntry};
use super::runtime::{ContainerRef, ContainerRuntime};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Kills and removes containers, keeping the ledger in sync
#[derive(Clone)]
pub struct Reclaimer {
    runtime: Arc<dyn ContainerRuntime>,
    ledger: Option<Arc<ContainerLedger>>,
}

impl Reclaimer {
    /// Reclaimer over `runtime`, optionally recording to `ledger`
    #[must_use]
    pub fn new(runtime: Arc<dyn ContainerRuntime>, ledger: Option<Arc<ContainerLedger>>) -> Self {
        Self { runtime, ledger }
    }

    /// Container engine
    #[must_use]
    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    /// Durable ledger, when configured
    #[must_use]
    pub const fn ledger(&self) -> Option<&Arc<ContainerLedger>> {
        self.ledger.as_ref()
    }

    /// Record a kernel's container before it can leak
    pub async fn track(&self, kernel: &Kernel, container: &ContainerRef) {
        let Some(ledger) = &self.ledger else {
            return;
        };
        let entry = LedgerEntry {
            container_id: container.id.clone(),
            container_name: container.name.clone(),
            language: kernel.language(),
            created_at: Utc::now(),
        };
        if let Err(e) = ledger.record(kernel.id(), entry).await {
            // Label-based discovery still finds the container
            warn!(kernel_id = %kernel.id(), error = %e, "Failed to record container in ledger");
        }
    }

    /// Kill and remove a container.
    ///
    /// Kill failures are logged and removal is still attempted (forced removal
    /// also stops the container). The ledger entry is dropped only after a
    /// successful removal, so a failed release stays discoverable.
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::Container` if removal fails.
    pub async fn release(
        &self,
        kernel_id: &KernelId,
        container: ContainerRef,
    ) -> Result<(), SandboxError> {
        debug!(kernel_id = %kernel_id, container_id = %container.id, "Releasing container");

        if let Err(e) = self.runtime.kill_container(&container).await {
            warn!(kernel_id = %kernel_id, container_id = %container.id, error = %e, "Kill failed, forcing removal");
        }

        self.runtime.remove_container(&container).await?;

        if let Some(ledger) = &self.ledger {
            if let Err(e) = ledger.forget(kernel_id).await {
                warn!(kernel_id = %kernel_id, error = %e, "Failed to drop ledger entry");
            }
        }

        info!(kernel_id = %kernel_id, container_id = %container.id, "Container released");
        Ok(())
    }

    /// [`release`](Self::release), logging instead of returning the error
    pub async fn release_logged(&self, kernel_id: &KernelId, container: ContainerRef) {
        let container_id = container.id.clone();
        if let Err(e) = self.release(kernel_id, container).await {
            error!(kernel_id = %kernel_id, container_id = %container_id, error = %e, "Container release failed; left for the reaper");
        }
    }
}

/// Scoped ownership of a starting kernel's container.
///
/// Until [`disarm`](Self::disarm) is called, dropping the guard (error return,
/// cancelled future, panic) fails the kernel and releases its container on a
/// background task.
pub struct StartGuard {
    reclaimer: Reclaimer,
    kernel: Option<Arc<Kernel>>,
}

impl StartGuard {
    /// Guard `kernel` until it is Ready
    #[must_use]
    pub fn new(reclaimer: Reclaimer, kernel: Arc<Kernel>) -> Self {
        Self {
            reclaimer,
            kernel: Some(kernel),
        }
    }

    /// Fail the kernel with `reason` and release its container now
    pub async fn fail(mut self, reason: &str) {
        if let Some(kernel) = self.kernel.take() {
            if let Some(container) = kernel.fail(reason) {
                self.reclaimer.release_logged(kernel.id(), container).await;
            }
        }
    }

    /// The kernel reached Ready; keep the container
    pub fn disarm(mut self) {
        self.kernel = None;
    }
}

impl Drop for StartGuard {
    fn drop(&mut self) {
        let Some(kernel) = self.kernel.take() else {
            return;
        };
        let Some(container) = kernel.fail("kernel creation aborted") else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let reclaimer = self.reclaimer.clone();
                handle.spawn(async move {
                    reclaimer.release_logged(kernel.id(), container).await;
                });
            }
            Err(_) => {
                error!(kernel_id = %kernel.id(), container_id = %container.id, "No runtime to release container; left for orphan recovery");
            }
        }
    }
}
