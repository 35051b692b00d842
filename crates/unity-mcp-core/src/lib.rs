//! # unity-mcp-core
//!
//! Core types for the Unity MCP relay.
//!
//! This crate provides the foundational types shared by both transports:
//! - Error taxonomy and JSON-RPC error codes
//! - Relay configuration
//! - Unity instance identity (`Name@hash`)
//! - Tool capability metadata advertised by plugins
//! - The response envelope returned to MCP clients

pub mod config;
pub mod error;
pub mod instance;
pub mod response;
pub mod tool;

pub use config::ServerConfig;
pub use error::{Result, UnityMcpError, error_codes};
pub use instance::{InstanceIdentity, InstanceList, InstanceStatus};
pub use response::McpResponse;
pub use tool::{ToolDefinition, ToolParameter};
