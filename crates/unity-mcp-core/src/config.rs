//! Relay configuration
//!
//! Defaults are the values both transports share. The binary overrides them
//! from its command line and `UNITY_MCP_*` environment variables.

use std::path::PathBuf;
use std::time::Duration;

/// Relay configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host the direct-socket transport connects to
    pub unity_host: String,
    /// Fallback Unity port when discovery finds nothing
    pub unity_port: u16,
    /// Port the plugin hub listens on
    pub hub_port: u16,

    /// Socket connect/read timeout for direct-socket mode
    pub connection_timeout: Duration,
    /// Reject editors that do not advertise `FRAMING=1`
    pub require_framing: bool,
    pub handshake_timeout: Duration,
    pub framed_receive_timeout: Duration,
    /// Heartbeat frames tolerated while waiting for a response
    pub max_heartbeat_frames: u32,

    /// Direct-socket send attempts (at least 5 are made)
    pub max_retries: u32,
    /// Poll interval while an editor is reloading
    pub reload_retry: Duration,
    /// Polls before giving up on a reloading editor (40 x 250ms ~ 10s)
    pub reload_max_retries: u32,

    /// Discovery cache lifetime
    pub port_registry_ttl: Duration,
    /// Directory holding editor status/port files
    pub status_dir: PathBuf,

    /// Hub: time to wait for a `command_result`
    pub command_timeout: Duration,
    /// Hub: keep-alive interval advertised to plugins
    pub keep_alive_interval: Duration,
    /// Hub: server timeout advertised to plugins
    pub server_timeout: Duration,

    /// Default tracing filter
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            unity_host: "127.0.0.1".to_string(),
            unity_port: 6400,
            hub_port: 6500,
            connection_timeout: Duration::from_secs(30),
            require_framing: true,
            handshake_timeout: Duration::from_secs(1),
            framed_receive_timeout: Duration::from_secs(2),
            max_heartbeat_frames: 16,
            max_retries: 5,
            reload_retry: Duration::from_millis(250),
            reload_max_retries: 40,
            port_registry_ttl: Duration::from_secs(5),
            status_dir: default_status_dir(),
            command_timeout: Duration::from_secs(30),
            keep_alive_interval: Duration::from_secs(15),
            server_timeout: Duration::from_secs(30),
            log_level: "info".to_string(),
        }
    }
}

/// `~/.unity-mcp`, where editors write their status and port files
pub fn default_status_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".unity-mcp")
}

impl ServerConfig {
    /// Total time a reloading editor is waited for
    pub fn reload_window(&self) -> Duration {
        self.reload_retry * self.reload_max_retries.max(1)
    }
}
