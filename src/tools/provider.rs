//! Tool Provider trait
//!
//! Unified interface for anything that can answer tool calls.

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

/// Tool definition advertised to the caller
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    /// Name of the tool
    pub name: String,
    /// Description of what the tool does
    pub description: String,
    /// JSON schema for tool parameters
    pub parameters: serde_json::Value,
}

/// Unified interface for tool providers
#[async_trait]
pub trait ToolProvider: Send + Sync {
    /// Provider name for logging and debugging
    fn name(&self) -> &'static str;

    /// Returns the list of tools this provider offers
    fn tools(&self) -> Vec<ToolDefinition>;

    /// Check if this provider can handle the given tool
    fn can_handle(&self, tool_name: &str) -> bool;

    /// Execute a tool and return the JSON result
    async fn execute(&self, tool_name: &str, arguments: &str) -> Result<String>;
}
