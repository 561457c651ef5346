//! Tool surface
//!
//! Exposes the sandbox manager to a calling agent as JSON tools.

/// Tool provider trait and tool definitions
pub mod provider;
/// Sandbox kernel tools
pub mod sandbox;

pub use provider::{ToolDefinition, ToolProvider};
pub use sandbox::SandboxToolProvider;
