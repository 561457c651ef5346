//! In-memory container engine and helpers for unit tests.
//!
//! [`FakeRuntime`] runs a tiny interpreter per exec that speaks the real
//! request/terminator protocol. Statements, one per line:
//!
//! - `name = value` / `print(name)` / `print('text')`
//! - `echo text`, `warn text` (stderr), `fail N` (exit code)
//! - `sleep SECS`, `spam N` (N bytes of stdout)
//! - `write PATH CONTENT` into the shared mount
//! - `crash` (the container dies), `pass` / `true`

use crate::config::SandboxSettings;
use crate::sandbox::error::SandboxError;
use crate::sandbox::kernel::{KernelId, KernelState};
use crate::sandbox::manager::SandboxManager;
use crate::sandbox::runtime::{
    ContainerRef, ContainerRuntime, ContainerSpec, ContainerStatus, ContainerSummary,
    ExecSession, OutputChunk, LABEL_KERNEL_ID, LABEL_SANDBOX,
};
use async_trait::async_trait;
use base64::Engine;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct FakeContainer {
    container: ContainerRef,
    labels: HashMap<String, String>,
    mount: Option<(PathBuf, String)>,
    status: ContainerStatus,
    killed: CancellationToken,
}

#[derive(Default)]
struct FakeState {
    next_id: u64,
    containers: HashMap<String, FakeContainer>,
    fail_next_start: bool,
    fail_next_list: bool,
    fail_next_remove: bool,
    probe_delay: Duration,
    started: usize,
    removals: usize,
    last_user: Option<String>,
}

impl FakeState {
    fn find(&mut self, container: &ContainerRef) -> Option<&mut FakeContainer> {
        let key = self
            .containers
            .iter()
            .find(|(_, c)| c.container.id == container.id || c.container.name == container.name)
            .map(|(key, _)| key.clone())?;
        self.containers.get_mut(&key)
    }

    fn insert(
        &mut self,
        name: &str,
        labels: HashMap<String, String>,
        mount: Option<(PathBuf, String)>,
    ) -> ContainerRef {
        self.next_id += 1;
        let container = ContainerRef {
            id: format!("fake-{}", self.next_id),
            name: name.to_string(),
        };
        self.containers.insert(
            container.id.clone(),
            FakeContainer {
                container: container.clone(),
                labels,
                mount,
                status: ContainerStatus::Running,
                killed: CancellationToken::new(),
            },
        );
        container
    }
}

/// In-memory [`ContainerRuntime`]
#[derive(Clone, Default)]
pub struct FakeRuntime {
    state: Arc<Mutex<FakeState>>,
}

impl FakeRuntime {
    /// Empty engine
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next `start_container` fail
    pub fn fail_next_start(&self) {
        self.lock().fail_next_start = true;
    }

    /// Make the next `list_containers` fail
    pub fn fail_next_list(&self) {
        self.lock().fail_next_list = true;
    }

    /// Make the next `remove_container` fail
    pub fn fail_next_remove(&self) {
        self.lock().fail_next_remove = true;
    }

    /// Delay the first reply of every interpreter
    pub fn set_probe_delay(&self, delay: Duration) {
        self.lock().probe_delay = delay;
    }

    /// Stop a container from outside, as an OOM kill or engine restart would
    pub fn stop_externally(&self, container: &ContainerRef, oom_killed: bool) {
        let mut state = self.lock();
        if let Some(c) = state.find(container) {
            c.status = ContainerStatus::Exited {
                exit_code: Some(137),
                oom_killed,
            };
            c.killed.cancel();
        }
    }

    /// Leave a labelled container behind, as a crashed process would
    pub fn add_orphan(&self, kernel_id: Option<&str>) -> ContainerRef {
        let mut labels = HashMap::from([(LABEL_SANDBOX.to_string(), "true".to_string())]);
        if let Some(id) = kernel_id {
            labels.insert(LABEL_KERNEL_ID.to_string(), id.to_string());
        }
        let mut state = self.lock();
        let name = format!("orphan-{}", state.next_id + 1);
        state.insert(&name, labels, None)
    }

    /// Number of `start_container` calls
    #[must_use]
    pub fn started(&self) -> usize {
        self.lock().started
    }

    /// `user` of the most recent `start_container` spec
    #[must_use]
    pub fn last_user(&self) -> Option<String> {
        self.lock().last_user.clone()
    }

    /// Number of containers actually removed
    #[must_use]
    pub fn removals(&self) -> usize {
        self.lock().removals
    }

    /// Containers that exist, running or not
    #[must_use]
    pub fn container_count(&self) -> usize {
        self.lock().containers.len()
    }

    /// Containers still running
    #[must_use]
    pub fn running_containers(&self) -> usize {
        self.lock()
            .containers
            .values()
            .filter(|c| c.status == ContainerStatus::Running)
            .count()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn start_container(&self, spec: &ContainerSpec) -> Result<ContainerRef, SandboxError> {
        let mut state = self.lock();
        state.started += 1;
        state.last_user.clone_from(&spec.user);
        if std::mem::take(&mut state.fail_next_start) {
            return Err(SandboxError::Container(format!(
                "No such image: {}",
                spec.image
            )));
        }
        if state.containers.values().any(|c| c.container.name == spec.name) {
            return Err(SandboxError::Container(format!(
                "Conflict: name {} in use",
                spec.name
            )));
        }
        let mount = spec
            .mounts
            .first()
            .map(|m| (m.host_path.clone(), m.container_path.clone()));
        Ok(state.insert(&spec.name, spec.labels.clone(), mount))
    }

    async fn exec_attached(
        &self,
        container: &ContainerRef,
        argv: Vec<String>,
    ) -> Result<ExecSession, SandboxError> {
        let (killed, mount, probe_delay, container) = {
            let mut state = self.lock();
            let probe_delay = state.probe_delay;
            let c = state
                .find(container)
                .ok_or_else(|| SandboxError::Container("No such container".to_string()))?;
            if c.status != ContainerStatus::Running {
                return Err(SandboxError::Container(
                    "Container is not running".to_string(),
                ));
            }
            (
                c.killed.clone(),
                c.mount.clone(),
                probe_delay,
                c.container.clone(),
            )
        };

        let (client, server) = tokio::io::duplex(64 * 1024);
        let (tx, rx) = mpsc::unbounded_channel();
        let interpreter = FakeInterpreter {
            marker: argv.last().cloned().unwrap_or_default(),
            mount,
            vars: HashMap::new(),
            out: tx,
        };
        let runtime = self.clone();
        tokio::spawn(async move {
            let crashed = interpreter.serve(server, &killed, probe_delay).await;
            if crashed {
                runtime.stop_externally(&container, false);
            }
        });

        let output = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(ExecSession {
            input: Box::pin(client),
            output: Box::pin(output),
        })
    }

    async fn inspect_container(
        &self,
        container: &ContainerRef,
    ) -> Result<ContainerStatus, SandboxError> {
        let mut state = self.lock();
        Ok(state
            .find(container)
            .map_or(ContainerStatus::Missing, |c| c.status.clone()))
    }

    async fn kill_container(&self, container: &ContainerRef) -> Result<(), SandboxError> {
        let mut state = self.lock();
        if let Some(c) = state.find(container) {
            if c.status == ContainerStatus::Running {
                c.status = ContainerStatus::Exited {
                    exit_code: Some(137),
                    oom_killed: false,
                };
            }
            c.killed.cancel();
        }
        Ok(())
    }

    async fn remove_container(&self, container: &ContainerRef) -> Result<(), SandboxError> {
        let mut state = self.lock();
        if std::mem::take(&mut state.fail_next_remove) {
            return Err(SandboxError::Container("removal refused".to_string()));
        }
        let Some(id) = state.find(container).map(|c| c.container.id.clone()) else {
            return Ok(());
        };
        if let Some(c) = state.containers.remove(&id) {
            c.killed.cancel();
            state.removals += 1;
        }
        Ok(())
    }

    async fn list_containers(&self, label: &str) -> Result<Vec<ContainerSummary>, SandboxError> {
        let mut state = self.lock();
        if std::mem::take(&mut state.fail_next_list) {
            return Err(SandboxError::Container("engine unavailable".to_string()));
        }
        Ok(state
            .containers
            .values()
            .filter(|c| c.labels.contains_key(label))
            .map(|c| ContainerSummary {
                container: c.container.clone(),
                kernel_id: c
                    .labels
                    .get(LABEL_KERNEL_ID)
                    .map(|id| KernelId::from(id.as_str())),
            })
            .collect())
    }
}

enum Outcome {
    Done {
        stdout: String,
        stderr: String,
        exit_code: i64,
    },
    Crash,
}

struct FakeInterpreter {
    marker: String,
    mount: Option<(PathBuf, String)>,
    vars: HashMap<String, String>,
    out: mpsc::UnboundedSender<Result<OutputChunk, SandboxError>>,
}

impl FakeInterpreter {
    /// Serve requests until stdin closes or the container dies; returns whether it crashed
    async fn serve(
        mut self,
        io: DuplexStream,
        killed: &CancellationToken,
        mut probe_delay: Duration,
    ) -> bool {
        let mut lines = BufReader::new(io).lines();
        loop {
            let line = tokio::select! {
                () = killed.cancelled() => return false,
                line = lines.next_line() => match line {
                    Ok(Some(line)) => line,
                    _ => return false,
                },
            };
            let code = base64::engine::general_purpose::STANDARD
                .decode(line.trim())
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok())
                .unwrap_or_default();

            let delay = std::mem::take(&mut probe_delay);
            let outcome = tokio::select! {
                () = killed.cancelled() => return false,
                outcome = async {
                    tokio::time::sleep(delay).await;
                    self.run(&code).await
                } => outcome,
            };

            match outcome {
                Outcome::Done {
                    mut stdout,
                    mut stderr,
                    exit_code,
                } => {
                    stdout.push_str(&format!("\n{} {exit_code}\n", self.marker));
                    stderr.push_str(&format!("\n{}\n", self.marker));
                    let _ = self.out.send(Ok(OutputChunk::Stdout(stdout.into_bytes())));
                    let _ = self.out.send(Ok(OutputChunk::Stderr(stderr.into_bytes())));
                }
                Outcome::Crash => return true,
            }
        }
    }

    async fn run(&mut self, code: &str) -> Outcome {
        let mut stdout = String::new();
        let mut stderr = String::new();
        let done = |stdout, stderr, exit_code| Outcome::Done {
            stdout,
            stderr,
            exit_code,
        };

        for line in code.lines().map(str::trim) {
            if line.is_empty() || line == "pass" || line == "true" {
                continue;
            }
            if line == "crash" {
                return Outcome::Crash;
            }
            if let Some(arg) = line.strip_prefix("print(").and_then(|s| s.strip_suffix(')')) {
                match self.value_of(arg) {
                    Some(value) => {
                        stdout.push_str(&value);
                        stdout.push('\n');
                    }
                    None => {
                        stderr.push_str(&format!("NameError: name '{arg}' is not defined\n"));
                        return done(stdout, stderr, 1);
                    }
                }
                continue;
            }

            let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
            match command {
                "echo" => {
                    stdout.push_str(rest);
                    stdout.push('\n');
                }
                "warn" => {
                    stderr.push_str(rest);
                    stderr.push('\n');
                }
                "fail" => return done(stdout, stderr, rest.parse().unwrap_or(1)),
                "sleep" => {
                    let secs = rest.parse::<f64>().unwrap_or(0.0);
                    tokio::time::sleep(Duration::from_secs_f64(secs)).await;
                }
                "spam" => stdout.push_str(&"x".repeat(rest.parse().unwrap_or(0))),
                "write" => {
                    let (path, content) = rest.split_once(' ').unwrap_or((rest, ""));
                    if let Err(e) = self.write(path, content).await {
                        stderr.push_str(&format!("OSError: {e}\n"));
                        return done(stdout, stderr, 1);
                    }
                }
                _ => match line.split_once('=') {
                    Some((name, value)) => {
                        self.vars
                            .insert(name.trim().to_string(), unquote(value.trim()).to_string());
                    }
                    None => {
                        stderr.push_str(&format!("SyntaxError: {line}\n"));
                        return done(stdout, stderr, 1);
                    }
                },
            }
        }
        done(stdout, stderr, 0)
    }

    fn value_of(&self, expr: &str) -> Option<String> {
        let expr = expr.trim();
        let quoted = (expr.starts_with('\'') && expr.ends_with('\''))
            || (expr.starts_with('"') && expr.ends_with('"'));
        if quoted && expr.len() >= 2 {
            return Some(unquote(expr).to_string());
        }
        self.vars.get(expr).cloned()
    }

    async fn write(&self, path: &str, content: &str) -> std::io::Result<()> {
        let Some((host, container_path)) = &self.mount else {
            return Err(std::io::Error::other("no shared mount"));
        };
        let relative = path
            .strip_prefix(container_path.as_str())
            .unwrap_or(path)
            .trim_start_matches('/');
        let target = host.join(relative);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(target, content).await
    }
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('\'')
        .and_then(|v| v.strip_suffix('\''))
        .or_else(|| value.strip_prefix('"').and_then(|v| v.strip_suffix('"')))
        .unwrap_or(value)
}

/// Settings rooted in `dir` with fast timeouts
#[must_use]
pub fn test_settings(dir: &Path) -> SandboxSettings {
    SandboxSettings {
        shared_dir: dir.join("shared"),
        startup_timeout_secs: 5,
        ..SandboxSettings::default()
    }
}

/// Manager over a fresh [`FakeRuntime`]; keep the returned directory alive
///
/// # Errors
///
/// Returns an error if the temp directory or manager cannot be created.
pub async fn test_manager(
    configure: impl FnOnce(&mut SandboxSettings),
) -> Result<(tempfile::TempDir, Arc<FakeRuntime>, SandboxManager), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let mut settings = test_settings(dir.path());
    configure(&mut settings);
    let runtime = Arc::new(FakeRuntime::new());
    let manager = SandboxManager::new(runtime.clone(), settings).await?;
    Ok((dir, runtime, manager))
}

/// Poll until a kernel reaches `state`
///
/// # Panics
///
/// Panics if the state is not reached within two seconds.
pub async fn wait_for_state(manager: &SandboxManager, kernel_id: &KernelId, state: KernelState) {
    for _ in 0..400 {
        if manager
            .kernel_info(kernel_id)
            .await
            .is_ok_and(|info| info.state == state)
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("kernel {kernel_id} never reached {state:?}");
}
