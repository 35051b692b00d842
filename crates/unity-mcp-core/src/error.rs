//! Error types for the Unity MCP relay

use std::time::Duration;
use thiserror::Error;

/// Result type for relay operations
pub type Result<T> = std::result::Result<T, UnityMcpError>;

/// Relay error types
///
/// Messages that reach a client carry the remediation the user should try next.
#[derive(Debug, Error)]
pub enum UnityMcpError {
    /// Session id has no bound channel
    #[error("Plugin session {0} not connected")]
    NotConnected(String),

    /// No plugin session appeared within the reload window
    #[error(
        "No Unity plugins are currently connected (waited {:.2}s). \
         Start the Unity Editor and start the MCP session.",
        .waited.as_secs_f64()
    )]
    NoPluginConnected { waited: Duration },

    /// Several instances match and none was selected
    #[error(
        "Multiple Unity instances are connected ({}). \
         Call set_active_instance with Name@hash from unity://instances.",
        .instances.join(", ")
    )]
    AmbiguousInstance { instances: Vec<String> },

    /// Command sent but no result arrived in time
    #[error("Command '{command}' timed out after {:.1}s", .timeout.as_secs_f64())]
    CommandTimeout { command: String, timeout: Duration },

    /// Instance id not known to any transport
    #[error("Instance '{0}' not found. Use unity://instances to choose a valid Name@hash.")]
    InstanceNotFound(String),

    /// Synchronous wait attempted from inside the runtime that owns the hub
    #[error("Cannot wait synchronously for a plugin hub call from within its event loop")]
    BlockingInLoop,

    /// Correlation id collision among outstanding commands
    #[error("Duplicate command id generated: {0}")]
    DuplicateCommandId(String),

    /// Invalid tool or command parameters
    #[error("Invalid params: {0}")]
    InvalidParams(String),

    /// IPC communication error
    #[error("IPC error: {0}")]
    IpcError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Error reported by the Unity editor
    #[error("Unity error: {0}")]
    UnityError(String),

    /// Protocol error
    #[error("Protocol error: {0}")]
    ProtocolError(String),
}

impl UnityMcpError {
    /// JSON-RPC error code for this error
    pub fn rpc_code(&self) -> i32 {
        match self {
            UnityMcpError::NoPluginConnected { .. } => error_codes::NO_PLUGIN_CONNECTED,
            UnityMcpError::AmbiguousInstance { .. } => error_codes::AMBIGUOUS_INSTANCE,
            UnityMcpError::CommandTimeout { .. } => error_codes::COMMAND_TIMEOUT,
            UnityMcpError::InstanceNotFound(_) => error_codes::INSTANCE_NOT_FOUND,
            UnityMcpError::NotConnected(_) => error_codes::NOT_CONNECTED,
            UnityMcpError::UnityError(_) => error_codes::UNITY_ERROR,
            UnityMcpError::InvalidParams(_) => error_codes::INVALID_PARAMS,
            _ => error_codes::INTERNAL_ERROR,
        }
    }
}

impl From<serde_json::Error> for UnityMcpError {
    fn from(err: serde_json::Error) -> Self {
        UnityMcpError::SerializationError(err.to_string())
    }
}

/// JSON-RPC error codes for the relay
pub mod error_codes {
    pub const NO_PLUGIN_CONNECTED: i32 = -32000;
    pub const AMBIGUOUS_INSTANCE: i32 = -32001;
    pub const COMMAND_TIMEOUT: i32 = -32002;
    pub const INSTANCE_NOT_FOUND: i32 = -32003;
    pub const NOT_CONNECTED: i32 = -32004;
    pub const UNITY_ERROR: i32 = -32005;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
}
