//! MCP server over stdio
//!
//! Serves a [`ToolProvider`] to any Model Context Protocol client. Tool
//! results are the provider's JSON as a single text content block; results
//! carrying an `error` object are flagged with `isError`. Requests are handled
//! concurrently, so a slow call on one kernel never holds up another kernel.

use crate::tools::{ToolDefinition, ToolProvider};
use rmcp::model::{
    CallToolRequestParam, CallToolResult, Content, Implementation, ListToolsResult,
    PaginatedRequestParam, ProtocolVersion, ServerCapabilities, ServerInfo, Tool,
};
use rmcp::service::{RequestContext, RoleServer, RunningService};
use rmcp::{Error as McpError, ServerHandler, ServiceExt};
use serde_json::Value;
use std::borrow::Cow;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Server name reported during the MCP handshake
pub const SERVER_NAME: &str = "CodeSandbox";

const INSTRUCTIONS: &str = "Run Python or Bash in isolated, stateful kernels. \
Create a kernel, execute code on it as often as needed (state persists between calls), \
and destroy it when done. Files written under the shared mount are reported as artifacts.";

/// MCP handler exposing the tools of a [`ToolProvider`]
#[derive(Clone)]
pub struct SandboxMcpServer {
    provider: Arc<dyn ToolProvider>,
}

impl SandboxMcpServer {
    /// Handler over `provider`
    #[must_use]
    pub fn new(provider: Arc<dyn ToolProvider>) -> Self {
        Self { provider }
    }
}

fn to_mcp_tool(definition: ToolDefinition) -> Tool {
    let input_schema = match definition.parameters {
        Value::Object(schema) => schema,
        _ => serde_json::Map::new(),
    };
    Tool {
        name: Cow::Owned(definition.name),
        description: Some(Cow::Owned(definition.description)),
        input_schema: Arc::new(input_schema),
        annotations: None,
    }
}

impl ServerHandler for SandboxMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: SERVER_NAME.to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            instructions: Some(INSTRUCTIONS.to_string()),
        }
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        Ok(ListToolsResult {
            tools: self.provider.tools().into_iter().map(to_mcp_tool).collect(),
            next_cursor: None,
        })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let name = request.name.as_ref();
        if !self.provider.can_handle(name) {
            warn!(tool = name, "Unknown tool requested");
            return Err(McpError::invalid_params(format!("Unknown tool: {name}"), None));
        }

        let arguments = Value::Object(request.arguments.unwrap_or_default()).to_string();
        debug!(tool = name, "Tool call");
        let raw = self
            .provider
            .execute(name, &arguments)
            .await
            .map_err(|e| McpError::internal_error(e.to_string(), None))?;

        let failed = serde_json::from_str::<Value>(&raw)
            .is_ok_and(|value| value.get("error").is_some());
        let content = vec![Content::text(raw)];
        Ok(if failed {
            CallToolResult::error(content)
        } else {
            CallToolResult::success(content)
        })
    }
}

/// Serve `provider` on stdin/stdout until the client disconnects or `shutdown` fires.
///
/// # Errors
///
/// Returns an error if the MCP handshake fails or the service task panics.
pub async fn serve_stdio(
    provider: Arc<dyn ToolProvider>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    info!(provider = provider.name(), "Waiting for MCP client on stdio");
    let running = SandboxMcpServer::new(provider)
        .serve(rmcp::transport::stdio())
        .await?;
    run_until(running, shutdown).await
}

/// Drive an initialized session until the peer leaves or `shutdown` fires
///
/// # Errors
///
/// Returns an error if the service task panics.
pub async fn run_until(
    running: RunningService<RoleServer, SandboxMcpServer>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let session = running.cancellation_token();
    let watcher = tokio::spawn(async move {
        shutdown.cancelled().await;
        session.cancel();
    });

    let reason = running.waiting().await;
    watcher.abort();
    info!(reason = ?reason, "MCP session closed");
    reason?;
    Ok(())
}
