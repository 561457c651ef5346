//! Reaper
//!
//! Periodic sweep that destroys idle, expired and failed kernels, marks
//! kernels whose container died as `Failed`, and removes labelled containers
//! no kernel owns. Each kernel is torn down under its own lifecycle lock, so
//! a sweep never waits on another kernel's queue.

use super::kernel::{Kernel, KernelId, KernelState};
use super::manager::SandboxManager;
use super::runtime::ContainerStatus;
use futures_util::future::join_all;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Why a kernel was reaped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapReason {
    /// Ready for longer than its idle timeout
    Idle,
    /// Older than the maximum lifetime
    Lifetime,
    /// Failed and past the grace window
    Failed,
}

impl fmt::Display for ReapReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Lifetime => "lifetime",
            Self::Failed => "failed",
        })
    }
}

/// Outcome of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Kernels destroyed in this sweep
    pub reaped: Vec<(KernelId, ReapReason)>,
    /// Kernels moved to `Failed` because their container died
    pub crashed: Vec<KernelId>,
    /// Unowned labelled containers removed
    pub orphans_removed: usize,
    /// Engine errors, retried on the next sweep
    pub errors: usize,
}

impl ReapReport {
    /// Nothing happened
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.reaped.is_empty()
            && self.crashed.is_empty()
            && self.orphans_removed == 0
            && self.errors == 0
    }
}

/// Decide whether `kernel` is due for reaping at `now`
#[must_use]
pub fn verdict(
    kernel: &Kernel,
    now: Instant,
    max_lifetime: Duration,
    failed_grace: Duration,
) -> Option<ReapReason> {
    match kernel.state() {
        KernelState::Terminating | KernelState::Terminated => None,
        KernelState::Failed => kernel
            .failed_at()
            .filter(|at| now.saturating_duration_since(*at) >= failed_grace)
            .map(|_| ReapReason::Failed),
        state => {
            if now.saturating_duration_since(kernel.created()) > max_lifetime {
                Some(ReapReason::Lifetime)
            } else if state == KernelState::Ready
                && now.saturating_duration_since(kernel.last_active()) > kernel.limits().idle_timeout
            {
                Some(ReapReason::Idle)
            } else {
                None
            }
        }
    }
}

/// Background reclamation loop
pub struct Reaper {
    manager: Arc<SandboxManager>,
    interval: Duration,
}

impl Reaper {
    /// Reaper sweeping at the configured interval
    #[must_use]
    pub fn new(manager: Arc<SandboxManager>) -> Self {
        let interval = manager.settings().reaper_interval();
        Self { manager, interval }
    }

    /// Override the sweep interval
    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sweep on a background task until `stop` is cancelled
    pub fn spawn(self, stop: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(stop))
    }

    async fn run(self, stop: CancellationToken) {
        info!(interval_secs = self.interval.as_secs_f64(), "Reaper started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                () = stop.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep().await;
                }
            }
        }
        info!("Reaper stopped");
    }

    /// Run one sweep now
    #[instrument(skip(self))]
    pub async fn sweep(&self) -> ReapReport {
        let mut report = ReapReport::default();
        let kernels = self.manager.kernels().await;

        for kernel in &kernels {
            if kernel.state() == KernelState::Ready {
                self.check_liveness(kernel, &mut report).await;
            }
        }

        self.reap_due(kernels, &mut report).await;

        match self.manager.remove_unowned_containers().await {
            Ok(removed) => report.orphans_removed = removed,
            Err(e) => {
                warn!(error = %e, "Orphan sweep failed, retrying next cycle");
                report.errors += 1;
            }
        }

        if report.is_empty() {
            debug!("Sweep found nothing to reclaim");
        } else {
            info!(
                reaped = report.reaped.len(),
                crashed = report.crashed.len(),
                orphans = report.orphans_removed,
                errors = report.errors,
                "Sweep finished"
            );
        }
        report
    }

    /// Fail a Ready kernel whose container is no longer running
    async fn check_liveness(&self, kernel: &Arc<Kernel>, report: &mut ReapReport) {
        let Some(container) = kernel.container() else {
            return;
        };
        let reclaimer = self.manager.reclaimer();
        let reason = match reclaimer.runtime().inspect_container(&container).await {
            Ok(ContainerStatus::Running) => return,
            Ok(ContainerStatus::Exited {
                oom_killed: true, ..
            }) => "container was killed: out of memory".to_string(),
            Ok(ContainerStatus::Exited { exit_code, .. }) => format!(
                "container exited unexpectedly (code {})",
                exit_code.map_or_else(|| "unknown".to_string(), |c| c.to_string())
            ),
            Ok(ContainerStatus::Missing) => "container disappeared".to_string(),
            Err(e) => {
                warn!(kernel_id = %kernel.id(), error = %e, "Liveness probe failed");
                report.errors += 1;
                return;
            }
        };

        warn!(kernel_id = %kernel.id(), reason = %reason, "Kernel container died");
        if let Some(container) = kernel.fail(reason) {
            reclaimer.release_logged(kernel.id(), container).await;
            report.crashed.push(kernel.id().clone());
        }
    }

    async fn reap_due(&self, kernels: Vec<Arc<Kernel>>, report: &mut ReapReport) {
        let settings = self.manager.settings();
        let max_lifetime = settings.max_lifetime();
        let failed_grace = settings.failed_grace();
        let now = Instant::now();

        let due: Vec<(Arc<Kernel>, ReapReason)> = kernels
            .into_iter()
            .filter_map(|k| verdict(&k, now, max_lifetime, failed_grace).map(|r| (k, r)))
            .collect();
        if due.is_empty() {
            return;
        }

        let outcomes = join_all(due.iter().map(|(kernel, reason)| {
            let reason = *reason;
            // Re-checked under the kernel's lifecycle lock; new activity wins
            self.manager.terminate_if(kernel, move |k| {
                verdict(k, Instant::now(), max_lifetime, failed_grace) == Some(reason)
            })
        }))
        .await;

        for ((kernel, reason), outcome) in due.into_iter().zip(outcomes) {
            match outcome {
                Ok(true) => {
                    info!(kernel_id = %kernel.id(), reason = %reason, "Kernel reaped");
                    report.reaped.push((kernel.id().clone(), reason));
                }
                Ok(false) => debug!(kernel_id = %kernel.id(), "Kernel no longer due"),
                Err(e) => {
                    warn!(kernel_id = %kernel.id(), error = %e, "Failed to reap kernel");
                    report.errors += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::kernel::{Language, ResourceLimits};
    use crate::sandbox::queue::ExecutionQueue;
    use crate::sandbox::runtime::ContainerRef;
    use crate::sandbox::SandboxError;
    use crate::testing::{test_manager, wait_for_state};
    use crate::config::SandboxSettings;

    const HOUR: Duration = Duration::from_secs(3600);
    const MINUTE: Duration = Duration::from_secs(60);

    fn ready_kernel() -> Kernel {
        let (queue, _jobs) = ExecutionQueue::channel();
        let limits = ResourceLimits {
            idle_timeout: Duration::from_secs(600),
            ..SandboxSettings::default().default_limits()
        };
        let kernel = Kernel::new(Language::Python, limits, queue);
        kernel.begin_start(ContainerRef::named("oxide-kernel-test"));
        kernel.mark_ready();
        kernel
    }

    fn short_idle() -> ResourceLimits {
        ResourceLimits {
            idle_timeout: Duration::from_millis(50),
            ..SandboxSettings::default().default_limits()
        }
    }

    #[test]
    fn test_verdict_idle_only_when_ready() {
        let kernel = ready_kernel();
        let later = kernel.created() + Duration::from_secs(601);
        assert_eq!(verdict(&kernel, later, HOUR, MINUTE), Some(ReapReason::Idle));
        assert_eq!(
            verdict(&kernel, kernel.created() + MINUTE, HOUR, MINUTE),
            None
        );

        kernel.begin_execution();
        assert_eq!(verdict(&kernel, later, HOUR, MINUTE), None);
    }

    #[test]
    fn test_verdict_lifetime_applies_to_busy_kernels() {
        let kernel = ready_kernel();
        kernel.begin_execution();
        let later = kernel.created() + HOUR + Duration::from_secs(1);
        assert_eq!(
            verdict(&kernel, later, HOUR, MINUTE),
            Some(ReapReason::Lifetime)
        );
    }

    #[test]
    fn test_verdict_failed_waits_for_grace() {
        let kernel = ready_kernel();
        assert!(kernel.fail("oom").is_some());
        let failed_at = kernel.failed_at().unwrap_or_else(Instant::now);

        assert_eq!(
            verdict(&kernel, failed_at + Duration::from_secs(10), HOUR, MINUTE),
            None
        );
        assert_eq!(
            verdict(&kernel, failed_at + MINUTE, HOUR, MINUTE),
            Some(ReapReason::Failed)
        );
    }

    #[test]
    fn test_verdict_skips_terminating() {
        let kernel = ready_kernel();
        assert!(kernel.begin_termination().is_some());
        let later = kernel.created() + HOUR * 2;
        assert_eq!(verdict(&kernel, later, HOUR, MINUTE), None);
    }

    #[tokio::test]
    async fn test_idle_kernel_reaped_and_container_removed(
    ) -> Result<(), Box<dyn std::error::Error>> {
        let (_dir, runtime, manager) = test_manager(|_| {}).await?;
        let manager = Arc::new(manager);
        let idle = manager
            .create_kernel(Language::Python, Some(short_idle()))
            .await?;
        let active = manager.create_kernel(Language::Python, None).await?;

        tokio::time::sleep(Duration::from_millis(100)).await;
        let report = Reaper::new(Arc::clone(&manager)).sweep().await;

        assert_eq!(report.reaped, vec![(idle.clone(), ReapReason::Idle)]);
        assert_eq!(runtime.container_count(), 1);
        let err = manager.execute(&idle, "print(1)", None).await.err();
        assert!(matches!(err, Some(SandboxError::NotFound(_))));
        assert!(manager.execute(&active, "pass", None).await.is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn test_executing_kernel_is_not_idle() -> Result<(), Box<dyn std::error::Error>> {
        let (_dir, _runtime, manager) = test_manager(|_| {}).await?;
        let manager = Arc::new(manager);
        let id = manager
            .create_kernel(Language::Python, Some(short_idle()))
            .await?;

        let running = {
            let manager = Arc::clone(&manager);
            let id = id.clone();
            tokio::spawn(async move { manager.execute(&id, "sleep 0.3\necho ok", None).await })
        };
        wait_for_state(&manager, &id, KernelState::Executing).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let report = Reaper::new(Arc::clone(&manager)).sweep().await;
        assert!(report.reaped.is_empty());
        assert_eq!(running.await??.stdout, "ok\n");
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_kernel_visible_until_grace() -> Result<(), Box<dyn std::error::Error>> {
        let (_dir, _runtime, manager) = test_manager(|_| {}).await?;
        let manager = Arc::new(manager);
        let id = manager.create_kernel(Language::Python, None).await?;
        let _ = manager
            .execute(&id, "sleep 5", Some(Duration::from_millis(20)))
            .await;

        let reaper = Reaper::new(Arc::clone(&manager));
        assert!(reaper.sweep().await.reaped.is_empty());
        assert_eq!(manager.kernel_info(&id).await?.state, KernelState::Failed);

        let (_dir, _runtime, manager) = test_manager(|s| s.failed_grace_secs = 0).await?;
        let manager = Arc::new(manager);
        let id = manager.create_kernel(Language::Python, None).await?;
        let _ = manager
            .execute(&id, "sleep 5", Some(Duration::from_millis(20)))
            .await;

        let report = Reaper::new(Arc::clone(&manager)).sweep().await;
        assert_eq!(report.reaped, vec![(id, ReapReason::Failed)]);
        assert!(manager.list_kernels().await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_dead_container_fails_kernel() -> Result<(), Box<dyn std::error::Error>> {
        let (_dir, runtime, manager) = test_manager(|_| {}).await?;
        let manager = Arc::new(manager);
        let id = manager.create_kernel(Language::Bash, None).await?;
        let container = manager
            .get(&id)
            .await
            .and_then(|k| k.container())
            .ok_or("kernel has no container")?;

        runtime.stop_externally(&container, true);
        let report = Reaper::new(Arc::clone(&manager)).sweep().await;

        assert_eq!(report.crashed, vec![id.clone()]);
        let info = manager.kernel_info(&id).await?;
        assert_eq!(info.state, KernelState::Failed);
        assert!(info.failure.is_some_and(|r| r.contains("out of memory")));
        assert_eq!(runtime.container_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_orphans_removed_and_errors_retried() -> Result<(), Box<dyn std::error::Error>> {
        let (_dir, runtime, manager) = test_manager(|_| {}).await?;
        let manager = Arc::new(manager);
        let owned = manager.create_kernel(Language::Python, None).await?;
        runtime.add_orphan(Some("k-gone"));

        let reaper = Reaper::new(Arc::clone(&manager));
        runtime.fail_next_list();
        let report = reaper.sweep().await;
        assert_eq!(report.errors, 1);
        assert_eq!(runtime.container_count(), 2);

        let report = reaper.sweep().await;
        assert_eq!(report.orphans_removed, 1);
        assert_eq!(runtime.container_count(), 1);
        assert!(manager.kernel_info(&owned).await.is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn test_background_loop_stops_on_cancel() -> Result<(), Box<dyn std::error::Error>> {
        let (_dir, runtime, manager) = test_manager(|_| {}).await?;
        let manager = Arc::new(manager);
        manager
            .create_kernel(Language::Python, Some(short_idle()))
            .await?;

        let stop = CancellationToken::new();
        let handle = Reaper::new(Arc::clone(&manager))
            .with_interval(Duration::from_millis(20))
            .spawn(stop.clone());

        for _ in 0..100 {
            if runtime.container_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(runtime.container_count(), 0);

        stop.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle).await??;
        Ok(())
    }
}
