//! WebSocket endpoint for Unity plugins
//!
//! One task per accepted socket. Plain `GET /plugin/sessions` requests on the
//! same port get the session listing as JSON instead of an upgrade.

use super::protocol::{self, CLOSE_INTERNAL_ERROR};
use super::{Outbound, PluginHub};
use futures_util::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async_with_config;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tracing::{debug, info, warn};
use unity_mcp_core::{Result, UnityMcpError};

/// Path of the session listing endpoint
pub const SESSIONS_PATH: &str = "/plugin/sessions";

const SESSIONS_REQUEST: &[u8] = b"GET /plugin/sessions ";
const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Accept plugin connections until the listener fails
pub async fn serve(hub: Arc<PluginHub>, listener: TcpListener) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Plugin hub listening on ws://{}", addr);
    }
    loop {
        let (stream, peer) = listener
            .accept()
            .await
            .map_err(|e| UnityMcpError::IpcError(format!("Failed to accept plugin: {}", e)))?;
        let hub = Arc::clone(&hub);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(hub, stream).await {
                debug!("Connection from {} ended: {}", peer, e);
            }
        });
    }
}

async fn handle_connection(hub: Arc<PluginHub>, stream: TcpStream) -> Result<()> {
    let mut peek_buf = [0u8; SESSIONS_REQUEST.len()];
    let n = stream.peek(&mut peek_buf).await.unwrap_or(0);
    if n == SESSIONS_REQUEST.len() && peek_buf == SESSIONS_REQUEST {
        return serve_session_list(&hub, stream).await;
    }

    let config = WebSocketConfig {
        max_message_size: Some(MAX_MESSAGE_SIZE),
        ..Default::default()
    };
    let ws = accept_async_with_config(stream, Some(config))
        .await
        .map_err(|e| UnityMcpError::IpcError(format!("WebSocket handshake failed: {}", e)))?;
    let (mut sink, mut source) = ws.split();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let channel = match hub.open_channel(tx) {
        Ok(channel) => channel,
        Err(e) => {
            let _ = sink
                .send(Message::Close(Some(CloseFrame {
                    code: CloseCode::from(CLOSE_INTERNAL_ERROR),
                    reason: Cow::Borrowed("hub unavailable"),
                })))
                .await;
            return Err(e);
        }
    };

    let keep_alive = hub.settings().keep_alive_interval;
    let channel_id = channel.id();
    let writer = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(keep_alive);
        // First tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                item = rx.recv() => match item {
                    Some(Outbound::Frame(frame)) => {
                        let text = match protocol::encode(&frame) {
                            Ok(text) => text,
                            Err(e) => {
                                warn!("Failed to encode frame for channel {}: {}", channel_id, e);
                                continue;
                            }
                        };
                        debug!(
                            "[Hub→Unity] channel={} len={} json={}",
                            channel_id,
                            text.len(),
                            protocol::preview(&text)
                        );
                        if let Err(e) = sink.send(Message::Text(text)).await {
                            warn!("Send to channel {} failed: {}", channel_id, e);
                            break;
                        }
                    }
                    Some(Outbound::Close { code, reason }) => {
                        let _ = sink
                            .send(Message::Close(Some(CloseFrame {
                                code: CloseCode::from(code),
                                reason: Cow::Owned(reason),
                            })))
                            .await;
                        break;
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    if sink.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let mut close_code = None;
    while let Some(msg) = source.next().await {
        match msg {
            Ok(Message::Text(text)) => hub.receive(&channel, &text).await,
            Ok(Message::Binary(data)) => match String::from_utf8(data) {
                Ok(text) => hub.receive(&channel, &text).await,
                Err(_) => warn!("Dropping non-UTF-8 frame on channel {}", channel_id),
            },
            Ok(Message::Close(frame)) => {
                close_code = frame.map(|f| u16::from(f.code));
                break;
            }
            Ok(_) => {}
            Err(e) => {
                debug!("WebSocket error on channel {}: {}", channel_id, e);
                break;
            }
        }
    }

    hub.close_channel(&channel, close_code).await;
    writer.abort();
    Ok(())
}

async fn serve_session_list(hub: &PluginHub, mut stream: TcpStream) -> Result<()> {
    let io_err = |e: std::io::Error| UnityMcpError::IpcError(e.to_string());

    // Consume the request head; the body is ignored
    let mut request = [0u8; 1024];
    let _ = stream.read(&mut request).await.map_err(io_err)?;

    let body = serde_json::to_string(&hub.get_sessions().await)?;
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    stream
        .write_all(response.as_bytes())
        .await
        .map_err(io_err)?;
    stream.shutdown().await.map_err(io_err)?;
    Ok(())
}
