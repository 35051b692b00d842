//! Plugin hub driven over a real WebSocket connection

use futures_util::{SinkExt, Stream, StreamExt};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message};
use unity_mcp_server::hub::websocket;
use unity_mcp_server::{HubSettings, PluginHub, PluginRegistry, RetryPolicy};

async fn start_hub() -> (Arc<PluginHub>, std::net::SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let settings = HubSettings {
        command_timeout: Duration::from_secs(5),
        retry: RetryPolicy::new(20, Duration::from_millis(50)),
        ..Default::default()
    };
    let hub = Arc::new(PluginHub::new(Arc::new(PluginRegistry::new()), settings));
    tokio::spawn(websocket::serve(Arc::clone(&hub), listener));
    (hub, addr)
}

async fn next_json<S>(ws: &mut S) -> Value
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    loop {
        match ws.next().await.unwrap().unwrap() {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            _ => continue,
        }
    }
}

async fn wait_for_count(hub: &PluginHub, expected: usize) {
    for _ in 0..100 {
        if hub.registry().count().await == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("registry never reached {} sessions", expected);
}

#[tokio::test]
async fn test_plugin_lifecycle_over_websocket() {
    let (hub, addr) = start_hub().await;
    let (mut ws, _) = connect_async(format!("ws://{}/hub/plugin", addr))
        .await
        .unwrap();

    let welcome = next_json(&mut ws).await;
    assert_eq!(welcome["type"], "welcome");
    assert_eq!(welcome["serverTimeout"], 30);
    assert_eq!(welcome["keepAliveInterval"], 15);

    let register = json!({
        "type": "register",
        "project_name": "MyGame",
        "project_hash": "abcd1234",
        "unity_version": "6000.0.23f1",
    });
    ws.send(Message::Text(register.to_string())).await.unwrap();
    let registered = next_json(&mut ws).await;
    assert_eq!(registered["type"], "registered");
    let session_id = registered["session_id"].as_str().unwrap().to_string();
    wait_for_count(&hub, 1).await;

    // Command issued by a tool while the plugin answers over the socket
    let caller = Arc::clone(&hub);
    let pending = tokio::spawn(async move {
        caller
            .send_command_for_instance(
                Some("MyGame@abcd1234"),
                "manage_scene",
                json!({"action": "get_active"}),
            )
            .await
    });

    let execute = next_json(&mut ws).await;
    assert_eq!(execute["type"], "execute");
    assert_eq!(execute["name"], "manage_scene");
    assert_eq!(execute["params"]["action"], "get_active");
    let reply = json!({
        "type": "command_result",
        "id": execute["id"],
        "result": {"success": true, "data": {"name": "Main"}},
    });
    ws.send(Message::Text(reply.to_string())).await.unwrap();

    let result = pending.await.unwrap().unwrap();
    assert_eq!(result["data"]["name"], "Main");
    assert_eq!(hub.pending_count(), 0);

    // Session listing on the same port
    let mut http = TcpStream::connect(addr).await.unwrap();
    http.write_all(b"GET /plugin/sessions HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    http.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    let body = response.split("\r\n\r\n").nth(1).unwrap();
    let sessions: Value = serde_json::from_str(body).unwrap();
    assert_eq!(sessions["sessions"][&session_id]["project"], "MyGame");

    ws.close(None).await.unwrap();
    wait_for_count(&hub, 0).await;
    assert!(!hub.is_connected(&session_id));
}

#[tokio::test]
async fn test_registration_without_hash_is_closed_4400() {
    let (hub, addr) = start_hub().await;
    let (mut ws, _) = connect_async(format!("ws://{}/hub/plugin", addr))
        .await
        .unwrap();
    let _welcome = next_json(&mut ws).await;

    ws.send(Message::Text(r#"{"type":"register","project_name":"X"}"#.into()))
        .await
        .unwrap();

    let code = loop {
        match ws.next().await {
            Some(Ok(Message::Close(Some(frame)))) => break u16::from(frame.code),
            Some(Ok(_)) => continue,
            other => panic!("Expected close frame, got {:?}", other),
        }
    };
    assert_eq!(code, 4400);
    assert_eq!(hub.registry().count().await, 0);
}

#[tokio::test]
async fn test_reload_reconnect_resolves_new_session() {
    let (hub, addr) = start_hub().await;
    let register = json!({
        "type": "register",
        "project_name": "MyGame",
        "project_hash": "abcd1234",
    })
    .to_string();

    let (mut first, _) = connect_async(format!("ws://{}/hub/plugin", addr))
        .await
        .unwrap();
    let _ = next_json(&mut first).await;
    first.send(Message::Text(register.clone())).await.unwrap();
    let _ = next_json(&mut first).await;
    wait_for_count(&hub, 1).await;

    // Domain reload: the old channel drops, the resolver waits for the new one
    first.close(None).await.unwrap();
    wait_for_count(&hub, 0).await;

    let waiter = Arc::clone(&hub);
    let resolving =
        tokio::spawn(async move { waiter.resolve_session_id(Some("MyGame@abcd1234")).await });

    tokio::time::sleep(Duration::from_millis(200)).await;
    let (mut second, _) = connect_async(format!("ws://{}/hub/plugin", addr))
        .await
        .unwrap();
    let _ = next_json(&mut second).await;
    second.send(Message::Text(register)).await.unwrap();
    let registered = next_json(&mut second).await;

    let resolved = resolving.await.unwrap().unwrap();
    assert_eq!(resolved, registered["session_id"].as_str().unwrap());
}
