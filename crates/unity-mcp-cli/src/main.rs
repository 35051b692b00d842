//! Unity MCP Server
//!
//! Bridges MCP clients on stdio to Unity editors:
//! - hub mode: editors connect to a WebSocket hub (default port 6500)
//! - direct mode: the server connects to each editor's TCP port, found via
//!   `~/.unity-mcp` status files

use anyhow::{Context, Result};
use clap::builder::BoolishValueParser;
use clap::{ArgAction, Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use unity_bridge::ConnectionPool;
use unity_mcp_core::ServerConfig;
use unity_mcp_server::hub::websocket;
use unity_mcp_server::{HubSettings, PluginHub, PluginRegistry, UnityMcpServer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Unity plugins connect to this server over WebSocket
    Hub,
    /// Connect to each editor's framed TCP socket
    Direct,
}

#[derive(Debug, Parser)]
#[command(name = "unity-mcp-server", version, about = "MCP server for Unity editors")]
struct Args {
    /// Transport used to reach Unity
    #[arg(long, value_enum, env = "UNITY_MCP_TRANSPORT", default_value = "hub")]
    mode: Mode,

    /// Host the direct transport connects to
    #[arg(long, env = "UNITY_MCP_HOST")]
    host: Option<String>,

    /// Fallback editor port when discovery finds nothing
    #[arg(long, env = "UNITY_MCP_UNITY_PORT")]
    unity_port: Option<u16>,

    /// Port the plugin hub listens on
    #[arg(long, env = "UNITY_MCP_HUB_PORT")]
    hub_port: Option<u16>,

    /// Socket connect/read timeout in seconds
    #[arg(long, env = "UNITY_MCP_CONNECTION_TIMEOUT", value_parser = parse_secs)]
    connection_timeout: Option<Duration>,

    /// Reject editors that do not advertise framing
    #[arg(
        long,
        env = "UNITY_MCP_REQUIRE_FRAMING",
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new()
    )]
    require_framing: Option<bool>,

    /// Direct-socket send attempts
    #[arg(long, env = "UNITY_MCP_MAX_RETRIES")]
    max_retries: Option<u32>,

    /// Poll interval in milliseconds while an editor reloads
    #[arg(long = "reload-retry-ms", env = "UNITY_MCP_RELOAD_RETRY_MS", value_parser = parse_millis)]
    reload_retry: Option<Duration>,

    /// Polls before giving up on a reloading editor
    #[arg(long, env = "UNITY_MCP_RELOAD_MAX_RETRIES")]
    reload_max_retries: Option<u32>,

    /// Discovery cache lifetime in seconds
    #[arg(long, env = "UNITY_MCP_PORT_REGISTRY_TTL", value_parser = parse_secs)]
    port_registry_ttl: Option<Duration>,

    /// Directory holding editor status files
    #[arg(long, env = "UNITY_MCP_STATUS_DIR")]
    status_dir: Option<PathBuf>,

    /// Hub command timeout in seconds
    #[arg(long, env = "UNITY_MCP_COMMAND_TIMEOUT", value_parser = parse_secs)]
    command_timeout: Option<Duration>,

    /// Tracing filter (overridden by RUST_LOG)
    #[arg(long, env = "UNITY_MCP_LOG_LEVEL")]
    log_level: Option<String>,
}

impl Args {
    /// Defaults with every given flag applied
    fn config(&self) -> ServerConfig {
        let mut config = ServerConfig::default();
        if let Some(host) = &self.host {
            config.unity_host = host.clone();
        }
        if let Some(port) = self.unity_port {
            config.unity_port = port;
        }
        if let Some(port) = self.hub_port {
            config.hub_port = port;
        }
        if let Some(timeout) = self.connection_timeout {
            config.connection_timeout = timeout;
        }
        if let Some(require) = self.require_framing {
            config.require_framing = require;
        }
        if let Some(retries) = self.max_retries {
            config.max_retries = retries;
        }
        if let Some(interval) = self.reload_retry {
            config.reload_retry = interval;
        }
        if let Some(retries) = self.reload_max_retries {
            config.reload_max_retries = retries;
        }
        if let Some(ttl) = self.port_registry_ttl {
            config.port_registry_ttl = ttl;
        }
        if let Some(dir) = &self.status_dir {
            config.status_dir = dir.clone();
        }
        if let Some(timeout) = self.command_timeout {
            config.command_timeout = timeout;
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
        config
    }
}

fn parse_secs(raw: &str) -> std::result::Result<Duration, String> {
    let secs: f64 = raw
        .trim()
        .parse()
        .map_err(|e| format!("invalid seconds '{}': {}", raw, e))?;
    Duration::try_from_secs_f64(secs).map_err(|e| format!("invalid seconds '{}': {}", raw, e))
}

fn parse_millis(raw: &str) -> std::result::Result<Duration, String> {
    raw.trim()
        .parse()
        .map(Duration::from_millis)
        .map_err(|e| format!("invalid milliseconds '{}': {}", raw, e))
}

fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    // stdout carries the MCP protocol
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

async fn run_hub(config: &ServerConfig) -> Result<()> {
    let registry = Arc::new(PluginRegistry::new());
    let hub = Arc::new(PluginHub::new(registry, HubSettings::from_config(config)));

    let addr = ("127.0.0.1", config.hub_port);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding plugin hub on port {}", config.hub_port))?;

    let serving = Arc::clone(&hub);
    tokio::spawn(async move {
        if let Err(e) = websocket::serve(serving, listener).await {
            error!("Plugin hub stopped: {}", e);
        }
    });

    UnityMcpServer::new(hub).run_stdio().await?;
    Ok(())
}

async fn run_direct(config: &ServerConfig) -> Result<()> {
    info!(
        "Direct mode: discovering editors in {}",
        config.status_dir.display()
    );
    let pool = Arc::new(ConnectionPool::from_config(config));
    UnityMcpServer::new(pool).run_stdio().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = args.config();

    init_logging(&config.log_level)?;
    info!(
        "Unity MCP server v{} starting ({:?} mode)",
        env!("CARGO_PKG_VERSION"),
        args.mode
    );

    match args.mode {
        Mode::Hub => run_hub(&config).await,
        Mode::Direct => run_direct(&config).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_args_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_defaults_without_flags() {
        let args = Args::try_parse_from(["unity-mcp-server"]).unwrap();
        let config = args.config();
        let defaults = ServerConfig::default();
        assert_eq!(config.hub_port, defaults.hub_port);
        assert_eq!(config.command_timeout, defaults.command_timeout);
        assert_eq!(config.require_framing, defaults.require_framing);
        assert_eq!(config.reload_window(), defaults.reload_window());
    }

    #[test]
    fn test_flags_override_defaults() {
        let args = Args::try_parse_from([
            "unity-mcp-server",
            "--mode",
            "direct",
            "--host",
            "10.0.0.2",
            "--unity-port",
            "6401",
            "--command-timeout",
            "2.5",
            "--require-framing",
            "false",
            "--reload-retry-ms",
            "100",
            "--reload-max-retries",
            "3",
            "--status-dir",
            "/tmp/unity-status",
        ])
        .unwrap();
        assert_eq!(args.mode, Mode::Direct);

        let config = args.config();
        assert_eq!(config.unity_host, "10.0.0.2");
        assert_eq!(config.unity_port, 6401);
        assert_eq!(config.command_timeout, Duration::from_millis(2500));
        assert!(!config.require_framing);
        assert_eq!(config.reload_window(), Duration::from_millis(300));
        assert_eq!(config.status_dir, PathBuf::from("/tmp/unity-status"));
    }

    #[test]
    fn test_out_of_range_durations_rejected() {
        for raw in ["1e30", "-1", "NaN", "inf", "soon"] {
            let parsed = Args::try_parse_from(["unity-mcp-server", "--command-timeout", raw]);
            assert!(parsed.is_err(), "accepted {}", raw);
        }
        assert!(parse_secs("0.25").is_ok());
        assert!(parse_millis("-5").is_err());
    }
}
