//! Wire protocol between the hub and Unity plugins
//!
//! Frames are JSON objects tagged by a snake_case `type` field.
//! Format: {"type": "frame_type", ...fields}

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use unity_mcp_core::{Result, ToolDefinition, UnityMcpError};

/// WebSocket close code for a handshake missing its project hash
pub const CLOSE_PROTOCOL_ERROR: u16 = 4400;
/// WebSocket close code for internal failures during the handshake
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Frames sent by the hub
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// First frame on every channel
    Welcome {
        #[serde(rename = "serverTimeout")]
        server_timeout: u64,
        #[serde(rename = "keepAliveInterval")]
        keep_alive_interval: u64,
    },

    /// Handshake accepted
    Registered { session_id: String },

    /// Run a command in the editor
    Execute {
        id: String,
        name: String,
        params: serde_json::Value,
        /// Seconds
        timeout: f64,
    },
}

/// Frames sent by plugins
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PluginFrame {
    /// Registration handshake
    Register {
        #[serde(default = "default_project_name")]
        project_name: String,
        #[serde(default)]
        project_hash: String,
        #[serde(default = "default_unity_version")]
        unity_version: String,
    },

    /// Tools exposed by the plugin's current build
    RegisterTools { tools: Vec<ToolDefinition> },

    /// Heartbeat
    Pong {
        #[serde(default)]
        session_id: Option<String>,
    },

    /// Result of an `execute` frame
    CommandResult {
        id: String,
        #[serde(default = "empty_object")]
        result: serde_json::Value,
    },

    /// Anything else; logged and ignored
    #[serde(other)]
    Unknown,
}

fn default_project_name() -> String {
    "Unknown Project".to_string()
}

fn default_unity_version() -> String {
    "Unknown".to_string()
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(Default::default())
}

/// Decode a plugin frame
///
/// Payloads that are not JSON objects are rejected as protocol errors.
pub fn decode(text: &str) -> Result<PluginFrame> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    if !value.is_object() {
        return Err(UnityMcpError::ProtocolError(format!(
            "non-object payload from plugin: {}",
            preview(text)
        )));
    }
    Ok(serde_json::from_value(value)?)
}

/// Encode a hub frame
pub fn encode(frame: &ServerFrame) -> Result<String> {
    Ok(serde_json::to_string(frame)?)
}

/// First 200 chars of a payload, for logs
pub fn preview(text: &str) -> String {
    text.chars().take(200).collect()
}

/// One entry of the session listing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionDetails {
    pub project: String,
    pub hash: String,
    pub unity_version: String,
    /// RFC 3339
    pub connected_at: String,
}

/// Session listing API response
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SessionList {
    pub sessions: BTreeMap<String, SessionDetails>,
}
