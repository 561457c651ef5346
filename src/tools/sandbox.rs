//! Sandbox tool provider
//!
//! Provides `create_kernel`, `execute`, `cancel`, `destroy_kernel` and
//! `list_kernels`. Failures are returned as
//! `{"error": {"kind": ..., "message": ...}}` so the caller can branch on the
//! error class.

use super::provider::{ToolDefinition, ToolProvider};
use crate::sandbox::{
    ExecutionRequest, KernelId, Language, ResourceLimits, SandboxError, SandboxManager,
};
use anyhow::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const TOOL_NAMES: [&str; 5] = [
    "create_kernel",
    "execute",
    "cancel",
    "destroy_kernel",
    "list_kernels",
];

/// Provider exposing kernel lifecycle and execution as tools
pub struct SandboxToolProvider {
    manager: Arc<SandboxManager>,
}

impl SandboxToolProvider {
    /// Provider over a shared manager
    #[must_use]
    pub const fn new(manager: Arc<SandboxManager>) -> Self {
        Self { manager }
    }

    async fn dispatch(&self, tool_name: &str, arguments: &str) -> Result<Value, SandboxError> {
        match tool_name {
            "create_kernel" => self.create_kernel(parse(arguments)?).await,
            "execute" => self.execute_code(parse(arguments)?).await,
            "cancel" => {
                let args: CancelArgs = parse(arguments)?;
                Ok(json!({ "cancelled": self.manager.cancel(&args.request_id) }))
            }
            "destroy_kernel" => {
                let args: KernelArgs = parse(arguments)?;
                match self
                    .manager
                    .destroy_kernel(&KernelId::from(args.kernel_id))
                    .await
                {
                    Ok(()) => Ok(json!({ "ok": true })),
                    Err(e) => {
                        warn!(kind = e.kind(), error = %e, "Kernel removal failed");
                        let mut value = error_json(&e);
                        value["ok"] = json!(false);
                        Ok(value)
                    }
                }
            }
            "list_kernels" => Ok(json!(self.manager.list_kernels().await)),
            _ => Err(SandboxError::Validation(format!(
                "Unknown sandbox tool: {tool_name}"
            ))),
        }
    }

    async fn create_kernel(&self, args: CreateKernelArgs) -> Result<Value, SandboxError> {
        let language: Language = args.language.parse()?;
        let limits = match args.limits {
            Some(overrides) => Some(overrides.apply(self.manager.settings().default_limits())?),
            None => None,
        };
        let kernel_id = self.manager.create_kernel(language, limits).await?;
        Ok(json!({ "kernel_id": kernel_id }))
    }

    async fn execute_code(&self, args: ExecuteArgs) -> Result<Value, SandboxError> {
        let timeout = args
            .timeout
            .map(|secs| seconds("timeout", secs))
            .transpose()?;
        let mut request =
            ExecutionRequest::new(KernelId::from(args.kernel_id), args.code).with_timeout(timeout);
        if let Some(request_id) = args.request_id {
            request = request.with_request_id(request_id);
        }
        let result = self.manager.execute_request(request).await?;
        Ok(json!(result))
    }
}

/// Error payload returned to the caller
#[must_use]
pub fn error_json(err: &SandboxError) -> Value {
    json!({
        "error": {
            "kind": err.kind(),
            "message": err.to_string(),
        }
    })
}

fn parse<T: DeserializeOwned>(arguments: &str) -> Result<T, SandboxError> {
    let raw = if arguments.trim().is_empty() {
        "{}"
    } else {
        arguments
    };
    serde_json::from_str(raw)
        .map_err(|e| SandboxError::Validation(format!("Invalid arguments: {e}")))
}

fn seconds(field: &str, value: f64) -> Result<Duration, SandboxError> {
    Duration::try_from_secs_f64(value)
        .ok()
        .filter(|d| !d.is_zero())
        .ok_or_else(|| {
            SandboxError::Validation(format!("{field} must be a positive number of seconds"))
        })
}

/// Arguments for `create_kernel` tool
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CreateKernelArgs {
    language: String,
    #[serde(default)]
    limits: Option<LimitArgs>,
}

/// Optional per-kernel limit overrides
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct LimitArgs {
    cpus: Option<f64>,
    memory_mb: Option<u64>,
    pids_limit: Option<i64>,
    timeout: Option<f64>,
    idle_timeout: Option<f64>,
}

impl LimitArgs {
    fn apply(self, mut limits: ResourceLimits) -> Result<ResourceLimits, SandboxError> {
        if let Some(cpus) = self.cpus {
            limits.cpus = cpus;
        }
        if let Some(mb) = self.memory_mb {
            limits.memory_bytes = i64::try_from(mb)
                .ok()
                .and_then(|mb| mb.checked_mul(1024 * 1024))
                .ok_or_else(|| SandboxError::Validation("memory_mb is too large".to_string()))?;
        }
        if let Some(pids) = self.pids_limit {
            limits.pids_limit = pids;
        }
        if let Some(secs) = self.timeout {
            limits.exec_timeout = seconds("timeout", secs)?;
        }
        if let Some(secs) = self.idle_timeout {
            limits.idle_timeout = seconds("idle_timeout", secs)?;
        }
        Ok(limits)
    }
}

/// Arguments for `execute` tool
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ExecuteArgs {
    kernel_id: String,
    code: String,
    timeout: Option<f64>,
    request_id: Option<String>,
}

/// Arguments for `cancel` tool
#[derive(Debug, Deserialize)]
struct CancelArgs {
    request_id: String,
}

/// Arguments for `destroy_kernel` tool
#[derive(Debug, Deserialize)]
struct KernelArgs {
    kernel_id: String,
}

#[async_trait]
impl ToolProvider for SandboxToolProvider {
    fn name(&self) -> &'static str {
        "sandbox"
    }

    fn tools(&self) -> Vec<ToolDefinition> {
        vec![
            ToolDefinition {
                name: "create_kernel".to_string(),
                description: "Start a new persistent Python or Bash kernel in an isolated container. Variables and files persist across execute calls on the same kernel. Files written under the shared workspace are visible to the host.".to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "language": {
                            "type": "string",
                            "enum": ["python", "bash"],
                            "description": "Interpreter to run"
                        },
                        "limits": {
                            "type": "object",
                            "description": "Optional overrides of the default resource limits",
                            "properties": {
                                "cpus": { "type": "number", "description": "CPUs available to the kernel" },
                                "memory_mb": { "type": "integer", "description": "Memory limit in MiB" },
                                "pids_limit": { "type": "integer", "description": "Maximum number of processes" },
                                "timeout": { "type": "number", "description": "Default per-call timeout in seconds" },
                                "idle_timeout": { "type": "number", "description": "Seconds of inactivity before the kernel is reclaimed" }
                            }
                        }
                    },
                    "required": ["language"]
                }),
            },
            ToolDefinition {
                name: "execute".to_string(),
                description: "Run code on a kernel and wait for the result. Calls on the same kernel run one at a time in submission order. A timeout or cancellation kills the kernel; create a new one afterwards.".to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "kernel_id": { "type": "string", "description": "Kernel returned by create_kernel" },
                        "code": { "type": "string", "description": "Source code to run" },
                        "timeout": { "type": "number", "description": "Wall-clock limit for this call in seconds" },
                        "request_id": { "type": "string", "description": "Caller-chosen id, usable with cancel" }
                    },
                    "required": ["kernel_id", "code"]
                }),
            },
            ToolDefinition {
                name: "cancel".to_string(),
                description: "Cancel a pending or running execute call by request_id. Cancelling a running call kills its kernel.".to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "request_id": { "type": "string", "description": "Request to cancel" }
                    },
                    "required": ["request_id"]
                }),
            },
            ToolDefinition {
                name: "destroy_kernel".to_string(),
                description: "Destroy a kernel and its container. Safe to call repeatedly or with an unknown id.".to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "kernel_id": { "type": "string", "description": "Kernel to destroy" }
                    },
                    "required": ["kernel_id"]
                }),
            },
            ToolDefinition {
                name: "list_kernels".to_string(),
                description: "List kernels with their state and activity timestamps. Failed kernels stay listed for a short grace period with their failure reason.".to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {}
                }),
            },
        ]
    }

    fn can_handle(&self, tool_name: &str) -> bool {
        TOOL_NAMES.contains(&tool_name)
    }

    async fn execute(&self, tool_name: &str, arguments: &str) -> Result<String> {
        if !self.can_handle(tool_name) {
            anyhow::bail!("Unknown sandbox tool: {tool_name}");
        }
        debug!(tool = tool_name, "Executing sandbox tool");

        let value = match self.dispatch(tool_name, arguments).await {
            Ok(value) => value,
            Err(e) => {
                warn!(tool = tool_name, kind = e.kind(), error = %e, "Sandbox tool failed");
                error_json(&e)
            }
        };
        Ok(value.to_string())
    }
}
