//! Sandbox manager
//!
//! Process-wide registry of kernels. Creates kernels, routes executions to
//! their queues, destroys kernels and recovers containers left behind by an
//! earlier process.

use super::artifacts::ArtifactScanner;
use super::cleanup::{Reclaimer, StartGuard};
use super::error::SandboxError;
use super::kernel::{
    ExecutionRequest, ExecutionResult, Kernel, KernelId, KernelSummary, Language, ResourceLimits,
};
use super::ledger::ContainerLedger;
use super::protocol::InterpreterSession;
use super::queue::{Claim, ExecutionQueue, Job, KernelWorker};
use super::runtime::{
    ContainerRef, ContainerRuntime, ContainerSpec, Mount, LABEL_KERNEL_ID, LABEL_LANGUAGE,
    LABEL_SANDBOX,
};
use crate::config::SandboxSettings;
use crate::utils::truncate_str;
use futures_util::future::join_all;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{oneshot, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Container name prefix for kernel containers
pub const CONTAINER_PREFIX: &str = "oxide-kernel-";

struct Inflight {
    kernel_id: KernelId,
    cancel: CancellationToken,
}

type InflightMap = Arc<Mutex<HashMap<String, Inflight>>>;

/// Drops the request's cancellation entry once its caller stops waiting
struct InflightGuard {
    map: InflightMap,
    request_id: String,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.map
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.request_id);
    }
}

/// Process-wide kernel registry
pub struct SandboxManager {
    settings: SandboxSettings,
    container_user: Option<String>,
    reclaimer: Reclaimer,
    scanner: ArtifactScanner,
    kernels: RwLock<HashMap<KernelId, Arc<Kernel>>>,
    inflight: InflightMap,
}

impl SandboxManager {
    /// Create a manager over `runtime`.
    ///
    /// Creates the shared directory if needed and opens the ledger when
    /// `ledger_path` is configured.
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::Container` if the shared directory cannot be
    /// created, or `SandboxError::Ledger` if the ledger cannot be read.
    pub async fn new(
        runtime: Arc<dyn ContainerRuntime>,
        mut settings: SandboxSettings,
    ) -> Result<Self, SandboxError> {
        tokio::fs::create_dir_all(&settings.shared_dir).await?;
        // Bind mounts need an absolute host path
        settings.shared_dir = tokio::fs::canonicalize(&settings.shared_dir).await?;
        let container_user = match &settings.container_user {
            Some(user) => Some(user.clone()),
            None => mount_owner(&settings.shared_dir).await?,
        };

        let ledger = match &settings.ledger_path {
            Some(path) => Some(Arc::new(ContainerLedger::open(path).await?)),
            None => None,
        };

        info!(
            shared_dir = %settings.shared_dir.display(),
            container_user = container_user.as_deref().unwrap_or("image default"),
            max_kernels = settings.max_kernels,
            ledger = ledger.is_some(),
            "Sandbox manager initialized"
        );

        Ok(Self {
            scanner: ArtifactScanner::new(&settings.shared_dir),
            reclaimer: Reclaimer::new(runtime, ledger),
            kernels: RwLock::new(HashMap::new()),
            inflight: Arc::new(Mutex::new(HashMap::new())),
            container_user,
            settings,
        })
    }

    /// Effective settings
    #[must_use]
    pub const fn settings(&self) -> &SandboxSettings {
        &self.settings
    }

    /// Container teardown routine shared with the reaper
    #[must_use]
    pub const fn reclaimer(&self) -> &Reclaimer {
        &self.reclaimer
    }

    /// Start a kernel and wait until its interpreter is ready.
    ///
    /// `limits` defaults to the configured per-kernel limits.
    ///
    /// # Errors
    ///
    /// - `SandboxError::Validation` for unusable limits
    /// - `SandboxError::ResourceExhausted` when the kernel cap is reached
    /// - `SandboxError::Container` when the container or interpreter does not
    ///   come up within the startup timeout; the kernel is left `Failed`
    #[instrument(skip(self, limits), fields(language = %language))]
    pub async fn create_kernel(
        &self,
        language: Language,
        limits: Option<ResourceLimits>,
    ) -> Result<KernelId, SandboxError> {
        let limits = limits.unwrap_or_else(|| self.settings.default_limits());
        limits.validate(self.settings.max_exec_timeout())?;

        let (queue, jobs) = ExecutionQueue::channel();
        let kernel = Arc::new(Kernel::new(language, limits, queue));
        self.register(&kernel).await?;

        // Provisional reference: the name is enough to clean up a half-started container
        let provisional = ContainerRef::named(format!("{CONTAINER_PREFIX}{}", kernel.id()));
        kernel.begin_start(provisional.clone());
        let guard = StartGuard::new(self.reclaimer.clone(), Arc::clone(&kernel));
        self.reclaimer.track(&kernel, &provisional).await;

        let spec = self.container_spec(&kernel, &provisional.name);
        let deadline = self.settings.startup_timeout();
        let session = match tokio::time::timeout(deadline, self.boot(&kernel, &spec)).await {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                warn!(kernel_id = %kernel.id(), error = %e, "Kernel failed to start");
                guard.fail(&format!("startup failed: {e}")).await;
                return Err(e);
            }
            Err(_) => {
                let reason = format!("startup exceeded {}s", deadline.as_secs());
                warn!(kernel_id = %kernel.id(), "Kernel {reason}");
                guard.fail(&reason).await;
                return Err(SandboxError::Container(format!(
                    "Kernel {} {reason}",
                    kernel.id()
                )));
            }
        };

        if !kernel.mark_ready() {
            // Destroyed while starting
            guard.fail("destroyed during startup").await;
            return Err(kernel
                .unusable_error()
                .unwrap_or_else(|| SandboxError::NotFound(kernel.id().clone())));
        }
        guard.disarm();

        KernelWorker::new(
            Arc::clone(&kernel),
            session,
            jobs,
            self.reclaimer.clone(),
            self.scanner.clone(),
        )
        .spawn();

        info!(kernel_id = %kernel.id(), "Kernel ready");
        Ok(kernel.id().clone())
    }

    async fn register(&self, kernel: &Arc<Kernel>) -> Result<(), SandboxError> {
        let mut kernels = self.kernels.write().await;
        let live = kernels
            .values()
            .filter(|k| !k.state().is_terminal())
            .count();
        if live >= self.settings.max_kernels {
            warn!(live, max = self.settings.max_kernels, "Kernel cap reached");
            return Err(SandboxError::ResourceExhausted(format!(
                "{live} of {} kernels in use",
                self.settings.max_kernels
            )));
        }
        kernels.insert(kernel.id().clone(), Arc::clone(kernel));
        Ok(())
    }

    fn container_spec(&self, kernel: &Kernel, name: &str) -> ContainerSpec {
        let labels = HashMap::from([
            (LABEL_SANDBOX.to_string(), "true".to_string()),
            (LABEL_KERNEL_ID.to_string(), kernel.id().to_string()),
            (LABEL_LANGUAGE.to_string(), kernel.language().to_string()),
        ]);
        ContainerSpec {
            name: name.to_string(),
            image: kernel.language().image(&self.settings).to_string(),
            mounts: vec![Mount {
                host_path: self.settings.shared_dir.clone(),
                container_path: self.settings.container_mount_path.clone(),
                read_only: false,
            }],
            limits: kernel.limits().clone(),
            labels,
            network_mode: self.settings.network_mode.clone(),
            working_dir: self.settings.container_mount_path.clone(),
            user: self.container_user.clone(),
        }
    }

    /// Start the container, open the interpreter and run the readiness probe
    async fn boot(
        &self,
        kernel: &Kernel,
        spec: &ContainerSpec,
    ) -> Result<InterpreterSession, SandboxError> {
        let runtime = self.reclaimer.runtime();
        let container = runtime.start_container(spec).await?;
        if !kernel.update_container(container.clone()) {
            // Destroyed while the engine was creating the container
            self.reclaimer.release_logged(kernel.id(), container).await;
            return Err(kernel
                .unusable_error()
                .unwrap_or_else(|| SandboxError::NotFound(kernel.id().clone())));
        }
        self.reclaimer.track(kernel, &container).await;

        let mut session = InterpreterSession::open(
            runtime.as_ref(),
            &container,
            kernel.language(),
            self.settings.max_output_bytes,
        )
        .await?;
        let probe = session.run(kernel.language().readiness_probe()).await?;
        if probe.exit_code != 0 {
            return Err(SandboxError::Container(format!(
                "Readiness probe exited with {}: {}",
                probe.exit_code,
                truncate_str(probe.stderr.trim(), 200)
            )));
        }

        debug!(kernel_id = %kernel.id(), container_id = %container.id, "Readiness probe passed");
        Ok(session)
    }

    /// Run `code` on a kernel, waiting for every earlier request on it first.
    ///
    /// `timeout` overrides the kernel's per-call limit.
    ///
    /// # Errors
    ///
    /// See [`execute_request`](Self::execute_request).
    pub async fn execute(
        &self,
        kernel_id: &KernelId,
        code: impl Into<String>,
        timeout: Option<Duration>,
    ) -> Result<ExecutionResult, SandboxError> {
        self.execute_request(ExecutionRequest::new(kernel_id.clone(), code).with_timeout(timeout))
            .await
    }

    /// Enqueue a request and wait for its result.
    ///
    /// A non-zero exit code is a normal result, not an error.
    ///
    /// # Errors
    ///
    /// - `SandboxError::Validation` for a bad timeout or a request id already in flight
    /// - `SandboxError::NotFound` for an unknown or terminated kernel
    /// - `SandboxError::KernelFailed` for a failed kernel
    /// - `SandboxError::Timeout` / `SandboxError::Cancelled` when the call was
    ///   interrupted; the kernel is `Failed` afterwards
    #[instrument(skip(self, request), fields(kernel_id = %request.kernel_id, request_id = %request.request_id))]
    pub async fn execute_request(
        &self,
        request: ExecutionRequest,
    ) -> Result<ExecutionResult, SandboxError> {
        if request.request_id.trim().is_empty() {
            return Err(SandboxError::Validation(
                "request id must not be empty".to_string(),
            ));
        }
        if let Some(limit) = request.timeout_override {
            let max = self.settings.max_exec_timeout();
            if limit.is_zero() || limit > max {
                return Err(SandboxError::Validation(format!(
                    "timeout must be within 1..={}s",
                    max.as_secs()
                )));
            }
        }

        let kernel = self
            .get(&request.kernel_id)
            .await
            .ok_or_else(|| SandboxError::NotFound(request.kernel_id.clone()))?;
        if let Some(err) = kernel.unusable_error() {
            return Err(err);
        }

        let cancel = CancellationToken::new();
        let _inflight = self.track_request(&request, cancel.clone())?;
        let (reply, mut result) = oneshot::channel();
        let claim = Claim::default();
        let request_id = request.request_id.clone();

        kernel.touch();
        kernel
            .queue()
            .enqueue(Job {
                request,
                cancel: cancel.clone(),
                reply,
                claim: claim.clone(),
            })
            .map_err(|_| unusable(&kernel))?;

        tokio::select! {
            biased;
            outcome = &mut result => return outcome.unwrap_or_else(|_| Err(unusable(&kernel))),
            () = cancel.cancelled() => {}
        }
        if claim.withdraw() {
            debug!("Request withdrawn before dispatch");
            return Err(SandboxError::Cancelled(request_id));
        }
        // Already running: the worker kills the interpreter and answers
        result.await.unwrap_or_else(|_| Err(unusable(&kernel)))
    }

    fn track_request(
        &self,
        request: &ExecutionRequest,
        cancel: CancellationToken,
    ) -> Result<InflightGuard, SandboxError> {
        let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
        if inflight.contains_key(&request.request_id) {
            return Err(SandboxError::Validation(format!(
                "request {} is already in flight",
                request.request_id
            )));
        }
        inflight.insert(
            request.request_id.clone(),
            Inflight {
                kernel_id: request.kernel_id.clone(),
                cancel,
            },
        );
        Ok(InflightGuard {
            map: Arc::clone(&self.inflight),
            request_id: request.request_id.clone(),
        })
    }

    /// Cancel a pending or running request.
    ///
    /// A pending request is dropped before it reaches the interpreter. A
    /// running one is killed and its kernel moves to `Failed`. Returns
    /// `false` when no such request is waiting.
    pub fn cancel(&self, request_id: &str) -> bool {
        let inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
        match inflight.get(request_id) {
            Some(entry) => {
                entry.cancel.cancel();
                info!(request_id, kernel_id = %entry.kernel_id, "Cancellation requested");
                true
            }
            None => {
                debug!(request_id, "No request to cancel");
                false
            }
        }
    }

    /// Destroy a kernel. Unknown and already destroyed kernels are a no-op.
    ///
    /// Any queued or running request on the kernel is answered with an error.
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::Container` if the container could not be
    /// removed. The registry entry is dropped anyway and the container is
    /// left for the reaper's orphan sweep.
    #[instrument(skip(self), fields(kernel_id = %kernel_id))]
    pub async fn destroy_kernel(&self, kernel_id: &KernelId) -> Result<(), SandboxError> {
        let Some(kernel) = self.get(kernel_id).await else {
            debug!("Destroy of unknown kernel ignored");
            return Ok(());
        };
        self.terminate_if(&kernel, |_| true).await.map(|_| ())
    }

    /// Tear down `kernel` if `due` still holds once its lifecycle lock is held.
    ///
    /// Returns whether the kernel was torn down.
    pub(crate) async fn terminate_if<F>(
        &self,
        kernel: &Arc<Kernel>,
        due: F,
    ) -> Result<bool, SandboxError>
    where
        F: Fn(&Kernel) -> bool + Send,
    {
        let _lifecycle = kernel.lock_lifecycle().await;
        if !due(kernel.as_ref()) {
            return Ok(false);
        }

        let container = kernel.begin_termination();
        kernel.shutdown_token().cancel();
        let released = match container {
            Some(container) => self.reclaimer.release(kernel.id(), container).await,
            None => Ok(()),
        };
        kernel.mark_terminated();

        self.kernels.write().await.remove(kernel.id());
        info!(kernel_id = %kernel.id(), state = ?kernel.state(), "Kernel destroyed");
        released.map(|()| true)
    }

    /// Snapshot of every registered kernel, oldest first
    pub async fn list_kernels(&self) -> Vec<KernelSummary> {
        let mut summaries: Vec<KernelSummary> = {
            let kernels = self.kernels.read().await;
            kernels.values().map(|k| k.summary()).collect()
        };
        summaries.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.kernel_id.cmp(&b.kernel_id))
        });
        summaries
    }

    /// Summary of one kernel, including a failure reason if it failed
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::NotFound` for an unknown kernel.
    pub async fn kernel_info(&self, kernel_id: &KernelId) -> Result<KernelSummary, SandboxError> {
        self.get(kernel_id)
            .await
            .map(|k| k.summary())
            .ok_or_else(|| SandboxError::NotFound(kernel_id.clone()))
    }

    pub(crate) async fn get(&self, kernel_id: &KernelId) -> Option<Arc<Kernel>> {
        let kernels = self.kernels.read().await;
        kernels.get(kernel_id).cloned()
    }

    pub(crate) async fn kernels(&self) -> Vec<Arc<Kernel>> {
        let kernels = self.kernels.read().await;
        kernels.values().cloned().collect()
    }

    /// Reclaim containers left behind by a previous process.
    ///
    /// Releases every ledger entry and every labelled container whose kernel
    /// is not registered here. Call once at startup, before serving requests.
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::Container` if the engine cannot list containers.
    #[instrument(skip(self))]
    pub async fn recover_orphans(&self) -> Result<usize, SandboxError> {
        let mut recovered = 0;

        if let Some(ledger) = self.reclaimer.ledger() {
            let owned = self.owned_ids().await;
            for (kernel_id, entry) in ledger.entries().await {
                if owned.contains(&kernel_id) {
                    continue;
                }
                match self.reclaimer.release(&kernel_id, entry.container()).await {
                    Ok(()) => recovered += 1,
                    Err(e) => {
                        warn!(kernel_id = %kernel_id, error = %e, "Failed to reclaim ledger container");
                    }
                }
            }
        }

        recovered += self.remove_unowned_containers().await?;
        if recovered > 0 {
            info!(recovered, "Recovered orphaned containers");
        }
        Ok(recovered)
    }

    /// Remove labelled containers that no registered kernel owns
    pub(crate) async fn remove_unowned_containers(&self) -> Result<usize, SandboxError> {
        let listed = self
            .reclaimer
            .runtime()
            .list_containers(LABEL_SANDBOX)
            .await?;
        // Kernels register before their container exists, so read the registry after listing
        let owned = self.owned_ids().await;

        let mut removed = 0;
        for summary in listed {
            if summary
                .kernel_id
                .as_ref()
                .is_some_and(|id| owned.contains(id))
            {
                continue;
            }
            let kernel_id = summary
                .kernel_id
                .unwrap_or_else(|| KernelId::from("unlabelled"));
            warn!(kernel_id = %kernel_id, container_id = %summary.container.id, "Removing orphaned container");
            match self.reclaimer.release(&kernel_id, summary.container).await {
                Ok(()) => removed += 1,
                Err(e) => error!(kernel_id = %kernel_id, error = %e, "Failed to remove orphaned container"),
            }
        }
        Ok(removed)
    }

    async fn owned_ids(&self) -> HashSet<KernelId> {
        let kernels = self.kernels.read().await;
        kernels.keys().cloned().collect()
    }

    /// Destroy every kernel, e.g. on process exit
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        let kernels = self.kernels().await;
        if kernels.is_empty() {
            return;
        }
        info!(count = kernels.len(), "Destroying all kernels");
        let results = join_all(kernels.iter().map(|k| self.terminate_if(k, |_| true))).await;
        for (kernel, result) in kernels.iter().zip(results) {
            if let Err(e) = result {
                error!(kernel_id = %kernel.id(), error = %e, "Failed to destroy kernel on shutdown");
            }
        }
    }
}

/// `uid:gid` owning the shared directory, so kernels can write to it
#[cfg(unix)]
async fn mount_owner(path: &Path) -> Result<Option<String>, SandboxError> {
    use std::os::unix::fs::MetadataExt;

    let metadata = tokio::fs::metadata(path).await?;
    Ok(Some(format!("{}:{}", metadata.uid(), metadata.gid())))
}

#[cfg(not(unix))]
async fn mount_owner(_path: &Path) -> Result<Option<String>, SandboxError> {
    Ok(None)
}

fn unusable(kernel: &Kernel) -> SandboxError {
    kernel
        .unusable_error()
        .unwrap_or_else(|| SandboxError::NotFound(kernel.id().clone()))
}
