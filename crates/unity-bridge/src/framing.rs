//! Framed socket I/O for the direct Unity transport
//!
//! Frames are an 8-byte big-endian length followed by the payload. A
//! zero-length frame is a heartbeat the editor sends while it is busy.

use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{Instant, timeout_at};
use tracing::{debug, warn};
use unity_mcp_core::{Result, UnityMcpError};

/// Largest accepted payload (64 MiB)
pub const FRAMED_MAX: usize = 64 * 1024 * 1024;

/// Token the editor must advertise in its greeting
pub const FRAMING_TOKEN: &str = "FRAMING=1";

/// Sent to editors that do not speak the framed protocol
pub const FRAMING_ADVISORY: &[u8] = b"MCP for Unity requires FRAMING=1\n";

const HANDSHAKE_MAX: usize = 512;

/// Trait for async reading of frames
#[async_trait]
pub trait AsyncReader: Send {
    /// Read one frame; heartbeats come back empty
    async fn read_frame(&mut self) -> Result<Vec<u8>>;
}

/// Trait for async writing of frames
#[async_trait]
pub trait AsyncWriter: Send {
    async fn write_frame(&mut self, data: &[u8]) -> Result<()>;
}

/// Framed read wrapper
pub struct FramedReader<R>(pub R);

#[async_trait]
impl<R: AsyncRead + Unpin + Send> AsyncReader for FramedReader<R> {
    async fn read_frame(&mut self) -> Result<Vec<u8>> {
        // Read 8-byte length prefix (big-endian)
        let mut len_bytes = [0u8; 8];
        self.0
            .read_exact(&mut len_bytes)
            .await
            .map_err(|e| UnityMcpError::IpcError(format!("Frame header read failed: {}", e)))?;
        let len = u64::from_be_bytes(len_bytes);

        if len > FRAMED_MAX as u64 {
            return Err(UnityMcpError::ProtocolError(format!(
                "Invalid framed length: {}",
                len
            )));
        }

        let mut data = vec![0u8; len as usize];
        self.0
            .read_exact(&mut data)
            .await
            .map_err(|e| UnityMcpError::IpcError(format!("Frame body read failed: {}", e)))?;

        Ok(data)
    }
}

/// Framed write wrapper
pub struct FramedWriter<W>(pub W);

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> AsyncWriter for FramedWriter<W> {
    async fn write_frame(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > FRAMED_MAX {
            return Err(UnityMcpError::ProtocolError(format!(
                "Frame too large: {} bytes",
                data.len()
            )));
        }
        let mut frame = Vec::with_capacity(8 + data.len());
        frame.extend_from_slice(&(data.len() as u64).to_be_bytes());
        frame.extend_from_slice(data);

        self.0
            .write_all(&frame)
            .await
            .map_err(|e| UnityMcpError::IpcError(format!("Frame write failed: {}", e)))?;
        self.0
            .flush()
            .await
            .map_err(|e| UnityMcpError::IpcError(format!("Flush failed: {}", e)))?;
        Ok(())
    }
}

/// Heartbeat tolerance while waiting for a response
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatPolicy {
    pub max_frames: u32,
    pub window: Duration,
}

impl Default for HeartbeatPolicy {
    fn default() -> Self {
        Self {
            max_frames: 16,
            window: Duration::from_secs(2),
        }
    }
}

/// Read the next data frame, skipping heartbeats
///
/// After `max_frames` heartbeats, or once the window has passed, an empty
/// response is returned instead of waiting forever.
pub async fn receive_response<R: AsyncReader>(
    reader: &mut R,
    policy: HeartbeatPolicy,
) -> Result<Vec<u8>> {
    let deadline = Instant::now() + policy.window;
    let mut heartbeats = 0u32;
    loop {
        let frame = reader.read_frame().await?;
        if !frame.is_empty() {
            debug!("Received framed response ({} bytes)", frame.len());
            return Ok(frame);
        }
        heartbeats += 1;
        debug!("Received heartbeat frame ({})", heartbeats);
        if heartbeats >= policy.max_frames || Instant::now() > deadline {
            debug!("Heartbeat threshold reached; returning empty response");
            return Ok(Vec::new());
        }
    }
}

/// Read the editor's greeting line
///
/// Stops at a newline, 512 bytes, EOF or the timeout, whichever comes first.
pub async fn read_greeting<R: AsyncRead + Unpin>(reader: &mut R, timeout: Duration) -> String {
    let deadline = Instant::now() + timeout;
    let mut buf = Vec::with_capacity(HANDSHAKE_MAX);
    let mut chunk = [0u8; 256];
    while buf.len() < HANDSHAKE_MAX {
        let want = chunk.len().min(HANDSHAKE_MAX - buf.len());
        match timeout_at(deadline, reader.read(&mut chunk[..want])).await {
            Ok(Ok(0)) | Ok(Err(_)) | Err(_) => break,
            Ok(Ok(n)) => {
                buf.extend_from_slice(&chunk[..n]);
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
        }
    }
    String::from_utf8_lossy(&buf).trim().to_string()
}

/// Perform the framing handshake on a fresh connection
pub async fn negotiate<S>(stream: &mut S, require_framing: bool, timeout: Duration) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let greeting = read_greeting(stream, timeout).await;
    if greeting.contains(FRAMING_TOKEN) {
        debug!("Unity handshake received: {}", FRAMING_TOKEN);
        return Ok(());
    }
    if require_framing {
        // Best effort; the peer may already be gone
        let _ = stream.write_all(FRAMING_ADVISORY).await;
        let _ = stream.flush().await;
        return Err(UnityMcpError::ProtocolError(format!(
            "MCP for Unity requires FRAMING=1, got: {:?}",
            greeting
        )));
    }
    warn!(
        "Unity handshake missing {}; continuing with framed I/O by configuration",
        FRAMING_TOKEN
    );
    Ok(())
}
