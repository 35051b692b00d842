//! Persistent framed connection to one Unity editor

use crate::framing::{self, AsyncWriter, FramedReader, FramedWriter, HeartbeatPolicy};
use crate::port_registry::PortRegistry;
use rand::Rng;
use serde_json::{Value, json};
use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use unity_mcp_core::response::{is_reloading_response, retry_after_ms};
use unity_mcp_core::{McpResponse, Result, ServerConfig, UnityMcpError};

/// Fewest send attempts made regardless of configuration
pub const MIN_ATTEMPTS: u32 = 5;

/// Direct-socket connection settings
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub host: String,
    pub connection_timeout: Duration,
    pub handshake_timeout: Duration,
    pub require_framing: bool,
    pub heartbeat: HeartbeatPolicy,
    pub max_retries: u32,
    pub reload_retry: Duration,
    pub reload_max_retries: u32,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self::from_config(&ServerConfig::default())
    }
}

impl ConnectionSettings {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            host: config.unity_host.clone(),
            connection_timeout: config.connection_timeout,
            handshake_timeout: config.handshake_timeout,
            require_framing: config.require_framing,
            heartbeat: HeartbeatPolicy {
                max_frames: config.max_heartbeat_frames,
                window: config.framed_receive_timeout,
            },
            max_retries: config.max_retries,
            reload_retry: config.reload_retry,
            reload_max_retries: config.reload_max_retries,
        }
    }
}

/// Why a single send attempt failed
enum AttemptError {
    Io(io::Error),
    TimedOut,
    Failed(UnityMcpError),
}

impl From<UnityMcpError> for AttemptError {
    fn from(e: UnityMcpError) -> Self {
        AttemptError::Failed(e)
    }
}

impl AttemptError {
    /// Socket-level failures that warrant a short backoff
    fn is_fast(&self) -> bool {
        match self {
            AttemptError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::TimedOut
            ),
            AttemptError::TimedOut => true,
            AttemptError::Failed(UnityMcpError::IpcError(_)) => true,
            AttemptError::Failed(_) => false,
        }
    }

    fn into_error(self, command: &str, timeout: Duration) -> UnityMcpError {
        match self {
            AttemptError::Io(e) => UnityMcpError::IpcError(format!("Could not connect to Unity: {}", e)),
            AttemptError::TimedOut => UnityMcpError::CommandTimeout {
                command: command.to_string(),
                timeout,
            },
            AttemptError::Failed(e) => e,
        }
    }
}

/// Delay before retry number `attempt`
///
/// `jitter` is drawn from [0.1, 0.3); the cap is 0.8s while the editor
/// reports a reload, 0.25s after socket errors and 3s otherwise.
pub fn backoff_delay(attempt: u32, jitter: f64, reloading: bool, fast_error: bool) -> Duration {
    let cap = if reloading {
        0.8
    } else if fast_error {
        0.25
    } else {
        3.0
    };
    let exp = 2f64.powi(attempt.min(16) as i32);
    Duration::from_secs_f64((jitter * exp).min(cap))
}

fn encode_request(command: &str, params: &Value) -> Result<Vec<u8>> {
    if command == "ping" {
        return Ok(b"ping".to_vec());
    }
    let request = json!({"type": command, "params": params});
    serde_json::to_vec(&request).map_err(|e| UnityMcpError::SerializationError(e.to_string()))
}

fn decode_response(frame: &[u8]) -> Result<Value> {
    let resp: Value = serde_json::from_slice(frame)
        .map_err(|e| UnityMcpError::SerializationError(format!("Invalid Unity response: {}", e)))?;
    if resp.get("status").and_then(|s| s.as_str()) == Some("error") {
        let message = resp
            .get("error")
            .or_else(|| resp.get("message"))
            .or_else(|| resp.get("result").and_then(|r| r.get("error")))
            .and_then(|m| m.as_str())
            .unwrap_or("Unknown Unity error");
        return Err(UnityMcpError::UnityError(message.to_string()));
    }
    match resp.get("result") {
        Some(result) => Ok(result.clone()),
        None => Ok(resp),
    }
}

/// Framed TCP connection to one editor
///
/// The socket is opened on first use. One request/response exchange runs at
/// a time.
pub struct UnityConnection {
    settings: ConnectionSettings,
    instance: Option<String>,
    registry: Arc<PortRegistry>,
    port: AtomicU16,
    stream: Mutex<Option<TcpStream>>,
}

impl fmt::Debug for UnityConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnityConnection")
            .field("instance", &self.instance)
            .field("port", &self.port())
            .finish_non_exhaustive()
    }
}

impl UnityConnection {
    pub fn new(
        settings: ConnectionSettings,
        instance: Option<String>,
        registry: Arc<PortRegistry>,
        port: u16,
    ) -> Self {
        Self {
            settings,
            instance,
            registry,
            port: AtomicU16::new(port),
            stream: Mutex::new(None),
        }
    }

    pub fn instance(&self) -> Option<&str> {
        self.instance.as_deref()
    }

    pub fn port(&self) -> u16 {
        self.port.load(Ordering::SeqCst)
    }

    pub async fn is_connected(&self) -> bool {
        self.stream.lock().await.is_some()
    }

    /// Drop the socket; the next command reconnects
    pub async fn disconnect(&self) {
        if self.stream.lock().await.take().is_some() {
            debug!("Disconnected from Unity on port {}", self.port());
        }
    }

    async fn connect(&self) -> std::result::Result<TcpStream, AttemptError> {
        let port = self.port();
        let host = self.settings.host.as_str();
        let mut stream = match timeout(
            self.settings.connection_timeout,
            TcpStream::connect((host, port)),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(AttemptError::Io(e)),
            Err(_) => return Err(AttemptError::TimedOut),
        };
        let _ = stream.set_nodelay(true);
        framing::negotiate(
            &mut stream,
            self.settings.require_framing,
            self.settings.handshake_timeout,
        )
        .await?;
        debug!("Connected to Unity at {}:{}", host, port);
        Ok(stream)
    }

    /// One request/response exchange under the I/O lock
    async fn exchange(&self, payload: &[u8]) -> std::result::Result<Vec<u8>, AttemptError> {
        let mut guard = self.stream.lock().await;
        if guard.is_none() {
            *guard = Some(self.connect().await?);
        }
        let Some(stream) = guard.as_mut() else {
            return Err(UnityMcpError::IpcError("Not connected to Unity".into()).into());
        };

        FramedWriter(&mut *stream).write_frame(payload).await?;
        let mut reader = FramedReader(&mut *stream);
        let frame = timeout(
            self.settings.connection_timeout,
            framing::receive_response(&mut reader, self.settings.heartbeat),
        )
        .await
        .map_err(|_| AttemptError::TimedOut)??;

        if frame.is_empty() {
            return Err(UnityMcpError::IpcError("Unity sent only heartbeats".into()).into());
        }
        Ok(frame)
    }

    async fn editor_reloading(&self) -> bool {
        self.registry
            .latest_status()
            .await
            .is_some_and(|s| s.is_reloading())
    }

    /// Send a command, reconnecting with backoff on transport failures
    ///
    /// Errors reported by the editor itself are returned without retrying.
    pub async fn send_command(&self, command: &str, params: Value) -> Result<Value> {
        if command.trim().is_empty() {
            return Err(UnityMcpError::InvalidParams(
                "Command type cannot be empty".into(),
            ));
        }

        if command != "ping" && self.editor_reloading().await {
            info!("Unity is reloading; deferring '{}'", command);
            let retry_ms = self.settings.reload_retry.as_millis() as u64;
            return Ok(McpResponse::reloading(retry_ms).to_value());
        }

        let payload = encode_request(command, &params)?;
        let attempts = self.settings.max_retries.max(MIN_ATTEMPTS);
        let mut attempt = 0;
        loop {
            let failure = match self.exchange(&payload).await {
                Ok(frame) => return decode_response(&frame),
                Err(e) => e,
            };
            let fast = failure.is_fast();
            let err = failure.into_error(command, self.settings.connection_timeout);
            warn!(
                "Unity command '{}' failed (attempt {}/{}): {}",
                command,
                attempt + 1,
                attempts + 1,
                err
            );
            self.disconnect().await;
            if attempt >= attempts {
                return Err(err);
            }

            match self.registry.refresh_port(self.instance()).await {
                Ok(port) => {
                    if port != self.port.swap(port, Ordering::SeqCst) {
                        info!("Unity port changed to {}", port);
                    }
                }
                Err(e) => debug!("Port rediscovery failed: {}", e),
            }

            let reloading = self.editor_reloading().await;
            let jitter: f64 = rand::thread_rng().gen_range(0.1..0.3);
            tokio::time::sleep(backoff_delay(attempt, jitter, reloading, fast)).await;
            attempt += 1;
        }
    }

    /// Send a command, waiting out editor reloads
    pub async fn send_command_with_retry(&self, command: &str, params: Value) -> Result<Value> {
        let mut resp = self.send_command(command, params.clone()).await?;
        let mut retries = 0;
        while is_reloading_response(&resp) && retries < self.settings.reload_max_retries {
            let delay = retry_after_ms(&resp)
                .map(Duration::from_millis)
                .unwrap_or(self.settings.reload_retry);
            debug!(
                "Unity reloading; retrying '{}' in {:?} ({}/{})",
                command,
                delay,
                retries + 1,
                self.settings.reload_max_retries
            );
            tokio::time::sleep(delay).await;
            retries += 1;
            resp = self.send_command(command, params.clone()).await?;
        }
        Ok(resp)
    }
}
