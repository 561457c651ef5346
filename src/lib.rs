#![deny(missing_docs)]
//! Oxide sandbox library.
//!
//! Disposable, per-session container kernels that run agent-submitted
//! Python and Bash snippets, plus the tool surface that exposes them.

/// Configuration management.
pub mod config;
/// MCP server exposing the sandbox tools over stdio.
pub mod mcp;
/// Kernel lifecycle, execution queues, reaping and the container adapter.
pub mod sandbox;
/// Tool definitions and the sandbox tool provider.
pub mod tools;
/// Utility functions.
pub mod utils;

#[cfg(test)]
pub mod testing;
