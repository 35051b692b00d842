//! # unity-mcp-server
//!
//! Session routing and the MCP front end for Unity editors.
//!
//! This crate provides:
//! - `PluginRegistry` of connected Unity plugin sessions
//! - `PluginHub`, the WebSocket connection hub with command correlation
//! - `SessionResolver`, which rides out editor domain reloads
//! - `InstanceRouter`, the per-caller active instance middleware
//! - `CommandTransport` trait shared with the direct-socket bridge
//! - MCP JSON-RPC handling over stdio

pub mod command;
pub mod hub;
pub mod mcp;
pub mod middleware;
pub mod registry;
pub mod resolve;
pub mod tools;
pub mod transport;

pub use command::CommandTransport;
pub use hub::{HubSettings, PluginHub};
pub use middleware::{CallContext, CallerIdentity, InstanceRouter};
pub use registry::{PluginRegistry, PluginSession};
pub use resolve::{RetryPolicy, SessionResolver};

use mcp::ServerInfo;
use std::sync::Arc;
use unity_mcp_core::Result;

/// Unity MCP server
pub struct UnityMcpServer<T: CommandTransport> {
    /// Transport reaching the editors
    transport: Arc<T>,
    /// Active instance per caller
    router: InstanceRouter,
    info: ServerInfo,
}

impl<T: CommandTransport> UnityMcpServer<T> {
    /// Create a server over the given transport
    pub fn new(transport: Arc<T>) -> Self {
        let router = InstanceRouter::new(transport.session_resolver());
        Self {
            transport,
            router,
            info: ServerInfo {
                name: "unity-mcp".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        }
    }

    /// Run the server on stdio transport
    pub async fn run_stdio(self) -> Result<()> {
        transport::stdio::run(self).await
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn router(&self) -> &InstanceRouter {
        &self.router
    }

    pub fn info(&self) -> &ServerInfo {
        &self.info
    }
}
