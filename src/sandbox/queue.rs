//! Per-kernel execution queue and its worker.
//!
//! Every kernel has one unbounded FIFO and one worker task that owns the
//! interpreter session. The worker takes one job at a time, so calls on the
//! same kernel never interleave while different kernels run in parallel.

use super::artifacts::ArtifactScanner;
use super::cleanup::Reclaimer;
use super::error::SandboxError;
use super::kernel::{ExecutionRequest, ExecutionResult, Kernel, KernelState};
use super::protocol::{InterpreterSession, RawReply};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// One queued execution and the channel its caller waits on
#[derive(Debug)]
pub struct Job {
    /// The submission
    pub request: ExecutionRequest,
    /// Cancelled by the caller to drop or abort this job
    pub cancel: CancellationToken,
    /// Where the outcome goes
    pub reply: oneshot::Sender<Result<ExecutionResult, SandboxError>>,
    /// Settles whether the worker runs the job or its caller withdraws it
    pub claim: Claim,
}

const QUEUED: u8 = 0;
const TAKEN: u8 = 1;
const WITHDRAWN: u8 = 2;

/// Shared between a queued job and its caller; exactly one side wins it
#[derive(Debug, Clone, Default)]
pub struct Claim(Arc<AtomicU8>);

impl Claim {
    /// Worker side: succeeds unless the caller already withdrew the job
    pub fn take(&self) -> bool {
        self.0
            .compare_exchange(QUEUED, TAKEN, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Caller side: succeeds while the job has not reached the interpreter
    pub fn withdraw(&self) -> bool {
        self.0
            .compare_exchange(QUEUED, WITHDRAWN, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Sending half of a kernel's FIFO
#[derive(Debug, Clone)]
pub struct ExecutionQueue {
    tx: mpsc::UnboundedSender<Job>,
}

impl ExecutionQueue {
    /// New queue and the receiver its worker drains
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Job>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Append a job without blocking; hands the job back if the worker is gone
    ///
    /// # Errors
    ///
    /// Returns the job when the worker has stopped accepting work.
    pub fn enqueue(&self, job: Job) -> Result<(), Box<Job>> {
        self.tx.send(job).map_err(|e| Box::new(e.0))
    }
}

/// Why an in-flight call did not complete
enum Interrupted {
    Timeout(Duration),
    Cancelled,
    Shutdown,
    Crashed(SandboxError),
}

/// Owns one kernel's interpreter session and processes its queue
pub struct KernelWorker {
    kernel: Arc<Kernel>,
    session: InterpreterSession,
    jobs: mpsc::UnboundedReceiver<Job>,
    reclaimer: Reclaimer,
    scanner: ArtifactScanner,
}

impl KernelWorker {
    /// Worker for a kernel that has just become Ready
    #[must_use]
    pub fn new(
        kernel: Arc<Kernel>,
        session: InterpreterSession,
        jobs: mpsc::UnboundedReceiver<Job>,
        reclaimer: Reclaimer,
        scanner: ArtifactScanner,
    ) -> Self {
        Self {
            kernel,
            session,
            jobs,
            reclaimer,
            scanner,
        }
    }

    /// Run on its own task until the kernel fails or shuts down
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    #[instrument(skip(self), fields(kernel_id = %self.kernel.id()))]
    async fn run(mut self) {
        let shutdown = self.kernel.shutdown_token().clone();
        loop {
            let job = tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                job = self.jobs.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            if !job.claim.take() || job.cancel.is_cancelled() {
                debug!(request_id = %job.request.request_id, "Dropping request cancelled while queued");
                let _ = job
                    .reply
                    .send(Err(SandboxError::Cancelled(job.request.request_id)));
                continue;
            }

            if !self.dispatch(job).await {
                break;
            }
        }

        self.drain();
        debug!("Kernel worker stopped");
    }

    /// Run one job; returns `false` when the kernel can take no more work
    async fn dispatch(&mut self, job: Job) -> bool {
        let Job {
            request,
            cancel,
            reply,
            ..
        } = job;

        if !self.kernel.begin_execution() {
            let err = self
                .kernel
                .unusable_error()
                .unwrap_or_else(|| SandboxError::NotFound(self.kernel.id().clone()));
            let _ = reply.send(Err(err));
            return false;
        }

        let limit = request
            .timeout_override
            .unwrap_or(self.kernel.limits().exec_timeout);
        let before = self.scanner.snapshot().await;
        let started = Instant::now();
        debug!(request_id = %request.request_id, timeout_secs = limit.as_secs(), "Dispatching request");

        let shutdown = self.kernel.shutdown_token().clone();
        let outcome = tokio::select! {
            res = tokio::time::timeout(limit, self.session.run(&request.code)) => match res {
                Ok(Ok(raw)) => Ok(raw),
                Ok(Err(e)) => Err(Interrupted::Crashed(e)),
                Err(_) => Err(Interrupted::Timeout(limit)),
            },
            () = cancel.cancelled() => Err(Interrupted::Cancelled),
            () = shutdown.cancelled() => Err(Interrupted::Shutdown),
        };
        let elapsed = started.elapsed();

        let (reason, err) = match outcome {
            Ok(raw) => {
                let after = self.scanner.snapshot().await;
                let artifacts = self.scanner.changed(&before, &after);
                self.kernel.finish_execution();
                let result = build_result(&request, raw, artifacts, elapsed);
                debug!(
                    request_id = %request.request_id,
                    exit_code = result.exit_code,
                    duration_ms = result.duration_ms,
                    "Request completed"
                );
                let _ = reply.send(Ok(result));
                return true;
            }
            Err(Interrupted::Shutdown) => {
                // Destroy owns the container; just tell the caller
                let _ = reply.send(Err(SandboxError::Cancelled(request.request_id)));
                return false;
            }
            Err(Interrupted::Timeout(limit)) => (
                format!(
                    "execution {} timed out after {}s",
                    request.request_id,
                    limit.as_secs()
                ),
                SandboxError::Timeout {
                    request_id: request.request_id.clone(),
                    limit,
                },
            ),
            Err(Interrupted::Cancelled) => (
                format!("execution {} cancelled while running", request.request_id),
                SandboxError::Cancelled(request.request_id.clone()),
            ),
            Err(Interrupted::Crashed(e)) => (
                format!("interpreter crashed: {e}"),
                SandboxError::KernelFailed {
                    kernel_id: self.kernel.id().clone(),
                    reason: e.to_string(),
                },
            ),
        };

        // Interpreter state cannot be trusted after a forced kill
        warn!(request_id = %request.request_id, reason = %reason, "Kernel failed");
        if let Some(container) = self.kernel.fail(reason) {
            self.reclaimer
                .release_logged(self.kernel.id(), container)
                .await;
        }
        let _ = reply.send(Err(err));
        false
    }

    /// Answer every job still queued once the worker stops
    fn drain(&mut self) {
        self.jobs.close();
        let mut drained = 0_usize;
        while let Ok(job) = self.jobs.try_recv() {
            let err = if job.cancel.is_cancelled() {
                SandboxError::Cancelled(job.request.request_id)
            } else {
                self.kernel
                    .unusable_error()
                    .unwrap_or_else(|| SandboxError::NotFound(self.kernel.id().clone()))
            };
            let _ = job.reply.send(Err(err));
            drained += 1;
        }
        if drained > 0 {
            info!(drained, state = ?self.kernel.state(), "Rejected queued requests");
        }
        // A worker that stops on its own leaves a live kernel unusable
        if matches!(
            self.kernel.state(),
            KernelState::Ready | KernelState::Executing
        ) && !self.kernel.shutdown_token().is_cancelled()
        {
            if let Some(container) = self.kernel.fail("execution worker stopped") {
                let reclaimer = self.reclaimer.clone();
                let kernel_id = self.kernel.id().clone();
                tokio::spawn(async move { reclaimer.release_logged(&kernel_id, container).await });
            }
        }
    }
}

fn build_result(
    request: &ExecutionRequest,
    raw: RawReply,
    artifacts: Vec<String>,
    elapsed: Duration,
) -> ExecutionResult {
    ExecutionResult {
        request_id: request.request_id.clone(),
        stdout: raw.stdout,
        stderr: raw.stderr,
        exit_code: raw.exit_code,
        artifacts,
        duration_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        truncated: raw.truncated,
    }
}
