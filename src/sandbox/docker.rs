//! Docker runtime adapter using Bollard
//!
//! Starts one long-lived container per kernel and attaches interpreter
//! processes to it through the exec API.

use super::error::SandboxError;
use super::runtime::{
    ContainerRef, ContainerRuntime, ContainerSpec, ContainerStatus, ContainerSummary,
    ExecSession, Mount, OutputChunk, LABEL_KERNEL_ID,
};
use crate::config::{SandboxSettings, SANDBOX_CPU_PERIOD};
use crate::utils::retry_with_backoff;
use anyhow::Context;
use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptions, CreateImageOptions, InspectContainerOptions, KillContainerOptions,
    ListContainersOptions, RemoveContainerOptions, StartContainerOptions,
};
use bollard::Docker;
use futures_util::StreamExt;
use std::collections::HashMap;
use tracing::{debug, info, instrument, warn};

/// Docker-backed [`ContainerRuntime`]
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
    pull_missing_images: bool,
}

impl DockerRuntime {
    /// Connect to the local Docker daemon and verify it answers
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or repeated pings fail.
    #[instrument(skip_all)]
    pub async fn connect(settings: &SandboxSettings) -> anyhow::Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().context("Failed to connect to Docker daemon")?;

        let client = &docker;
        retry_with_backoff("docker ping", || async move {
            client
                .ping()
                .await
                .map(|_| ())
                .context("Failed to ping Docker daemon")
        })
        .await?;

        debug!("Docker connection established");

        Ok(Self {
            docker,
            pull_missing_images: settings.pull_missing_images,
        })
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, bollard::errors::Error> {
        let cpu_quota = (spec.limits.cpus * SANDBOX_CPU_PERIOD as f64).round() as i64;

        let host_config = HostConfig {
            memory: Some(spec.limits.memory_bytes),
            // No swap beyond the memory limit
            memory_swap: Some(spec.limits.memory_bytes),
            cpu_period: Some(SANDBOX_CPU_PERIOD),
            cpu_quota: Some(cpu_quota),
            pids_limit: Some(spec.limits.pids_limit),
            network_mode: Some(spec.network_mode.clone()),
            binds: Some(spec.mounts.iter().map(bind_spec).collect()),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            // Removal is explicit so a dead kernel stays inspectable until reaped
            auto_remove: Some(false),
            ..Default::default()
        };

        let config = ContainerCreateBody {
            image: Some(spec.image.clone()),
            hostname: Some("sandbox".to_string()),
            working_dir: Some(spec.working_dir.clone()),
            // Without capabilities root cannot bypass the shared dir's permission bits
            user: spec.user.clone(),
            host_config: Some(host_config),
            labels: Some(spec.labels.clone()),
            // PID 1 outlives interpreter crashes
            cmd: Some(vec![
                "tail".to_string(),
                "-f".to_string(),
                "/dev/null".to_string(),
            ]),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: Some(spec.name.clone()),
            ..Default::default()
        };

        let response = self.docker.create_container(Some(options), config).await?;
        Ok(response.id)
    }

    #[instrument(skip(self))]
    async fn pull_image(&self, image: &str) -> Result<(), SandboxError> {
        info!(image, "Pulling missing sandbox image");
        let options = CreateImageOptions {
            from_image: Some(image.to_string()),
            ..Default::default()
        };

        let mut progress = self.docker.create_image(Some(options), None, None);
        while let Some(step) = progress.next().await {
            step.map_err(|e| SandboxError::Container(format!("Failed to pull {image}: {e}")))?;
        }
        Ok(())
    }
}

fn bind_spec(mount: &Mount) -> String {
    let mode = if mount.read_only { "ro" } else { "rw" };
    format!(
        "{}:{}:{mode}",
        mount.host_path.display(),
        mount.container_path
    )
}

const fn status_code(e: &bollard::errors::Error) -> Option<u16> {
    match e {
        bollard::errors::Error::DockerResponseServerError { status_code, .. } => {
            Some(*status_code)
        }
        _ => None,
    }
}

/// 404: no such container; 409: not running, or removal already in progress
fn is_gone(e: &bollard::errors::Error) -> bool {
    matches!(status_code(e), Some(404 | 409))
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    #[instrument(skip_all, fields(name = %spec.name, image = %spec.image))]
    async fn start_container(&self, spec: &ContainerSpec) -> Result<ContainerRef, SandboxError> {
        let id = match self.create(spec).await {
            Ok(id) => id,
            Err(e) if status_code(&e) == Some(404) && self.pull_missing_images => {
                self.pull_image(&spec.image).await?;
                self.create(spec).await.map_err(|e| {
                    SandboxError::Container(format!("Failed to create sandbox container: {e}"))
                })?
            }
            Err(e) => {
                return Err(SandboxError::Container(format!(
                    "Failed to create sandbox container: {e}"
                )))
            }
        };
        info!(container_id = %id, "Sandbox container created");

        self.docker
            .start_container(&id, None::<StartContainerOptions>)
            .await
            .map_err(|e| {
                SandboxError::Container(format!("Failed to start sandbox container: {e}"))
            })?;

        info!(container_id = %id, "Sandbox container started");
        Ok(ContainerRef {
            id,
            name: spec.name.clone(),
        })
    }

    #[instrument(skip(self, argv), fields(container_id = %container.id))]
    async fn exec_attached(
        &self,
        container: &ContainerRef,
        argv: Vec<String>,
    ) -> Result<ExecSession, SandboxError> {
        let exec_options = CreateExecOptions {
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            cmd: Some(argv),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(&container.id, exec_options)
            .await
            .map_err(|e| SandboxError::Container(format!("Failed to create exec: {e}")))?;

        match self.docker.start_exec(&exec.id, None).await? {
            StartExecResults::Attached { output, input } => {
                let output = output.filter_map(|msg| async move {
                    match msg {
                        Ok(LogOutput::StdOut { message }) => {
                            Some(Ok(OutputChunk::Stdout(message.to_vec())))
                        }
                        Ok(LogOutput::StdErr { message }) => {
                            Some(Ok(OutputChunk::Stderr(message.to_vec())))
                        }
                        Ok(_) => None,
                        Err(e) => Some(Err(SandboxError::from(e))),
                    }
                });
                debug!(exec_id = %exec.id, "Interpreter attached");
                Ok(ExecSession {
                    input,
                    output: Box::pin(output),
                })
            }
            StartExecResults::Detached => Err(SandboxError::Container(
                "Exec started detached; no streams to attach".to_string(),
            )),
        }
    }

    async fn inspect_container(
        &self,
        container: &ContainerRef,
    ) -> Result<ContainerStatus, SandboxError> {
        match self
            .docker
            .inspect_container(&container.id, None::<InspectContainerOptions>)
            .await
        {
            Ok(details) => {
                let state = details.state.unwrap_or_default();
                if state.running.unwrap_or(false) {
                    Ok(ContainerStatus::Running)
                } else {
                    Ok(ContainerStatus::Exited {
                        exit_code: state.exit_code,
                        oom_killed: state.oom_killed.unwrap_or(false),
                    })
                }
            }
            Err(e) if status_code(&e) == Some(404) => Ok(ContainerStatus::Missing),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self), fields(container_id = %container.id))]
    async fn kill_container(&self, container: &ContainerRef) -> Result<(), SandboxError> {
        match self
            .docker
            .kill_container(&container.id, None::<KillContainerOptions>)
            .await
        {
            Ok(()) => {
                debug!("Container killed");
                Ok(())
            }
            Err(e) if is_gone(&e) => {
                debug!(error = %e, "Container already stopped or gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self), fields(container_id = %container.id))]
    async fn remove_container(&self, container: &ContainerRef) -> Result<(), SandboxError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        match self
            .docker
            .remove_container(&container.id, Some(options))
            .await
        {
            Ok(()) => {
                info!("Sandbox container removed");
                Ok(())
            }
            Err(e) if is_gone(&e) => {
                warn!(error = %e, "Container already removed");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn list_containers(&self, label: &str) -> Result<Vec<ContainerSummary>, SandboxError> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![label.to_string()]);

        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters: Some(filters),
                ..Default::default()
            }))
            .await?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let id = c.id?;
                let name = c
                    .names
                    .and_then(|names| names.into_iter().next())
                    .map_or_else(|| id.clone(), |n| n.trim_start_matches('/').to_string());
                let kernel_id = c
                    .labels
                    .and_then(|mut labels| labels.remove(LABEL_KERNEL_ID))
                    .map(Into::into);
                Some(ContainerSummary {
                    container: ContainerRef { id, name },
                    kernel_id,
                })
            })
            .collect())
    }
}
