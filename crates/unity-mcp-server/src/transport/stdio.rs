//! stdio transport for MCP JSON-RPC

use crate::UnityMcpServer;
use crate::command::CommandTransport;
use crate::mcp::{
    InitializeParams, InitializeResult, Request, RequestId, ResourcesCapability, Response,
    ServerCapabilities, ToolsCapability,
};
use crate::middleware::CallerIdentity;
use crate::tools::{handle_tool_call, merge_tools};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, error, info};
use unity_mcp_core::{InstanceList, Result, UnityMcpError, error_codes};
use uuid::Uuid;

const INSTANCES_URI: &str = "unity://instances";
const SESSIONS_URI: &str = "unity://sessions";

/// Run the MCP server on stdio
pub async fn run<T: CommandTransport>(server: UnityMcpServer<T>) -> Result<()> {
    let reader = BufReader::new(tokio::io::stdin());
    let writer = tokio::io::stdout();

    info!("Unity MCP server starting on stdio");
    let result = serve(&server, reader, writer).await;

    if let Err(e) = server.transport().shutdown().await {
        error!("Transport shutdown failed: {}", e);
    }
    result
}

/// Serve line-delimited JSON-RPC until EOF
pub async fn serve<T, R, W>(server: &UnityMcpServer<T>, mut reader: R, mut writer: W) -> Result<()>
where
    T: CommandTransport,
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut caller = CallerIdentity::with_session(Uuid::new_v4().to_string());
    let mut line = String::new();

    loop {
        line.clear();
        let bytes_read = reader
            .read_line(&mut line)
            .await
            .map_err(|e| UnityMcpError::IpcError(format!("Failed to read stdin: {}", e)))?;

        if bytes_read == 0 {
            // EOF - client disconnected
            info!("Client disconnected (EOF)");
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        debug!("Received: {}", trimmed);

        let request: Request = match serde_json::from_str(trimmed) {
            Ok(r) => r,
            Err(e) => {
                error!("Failed to parse request: {}", e);
                continue;
            }
        };

        if request.method == "initialize" {
            if let Ok(params) = serde_json::from_value::<InitializeParams>(request.params.clone()) {
                caller.client_id = Some(params.client_info.name);
            }
        }

        let Some(response) = handle_request(&request, server, &caller).await else {
            continue;
        };
        let response_json = serde_json::to_string(&response)?;

        debug!("Sending: {}", response_json);

        writer
            .write_all(response_json.as_bytes())
            .await
            .map_err(|e| UnityMcpError::IpcError(format!("Failed to write stdout: {}", e)))?;
        writer
            .write_all(b"\n")
            .await
            .map_err(|e| UnityMcpError::IpcError(format!("Failed to write newline: {}", e)))?;
        writer
            .flush()
            .await
            .map_err(|e| UnityMcpError::IpcError(format!("Failed to flush stdout: {}", e)))?;
    }

    Ok(())
}

/// Dispatch one request; notifications yield no response
pub async fn handle_request<T: CommandTransport>(
    request: &Request,
    server: &UnityMcpServer<T>,
    caller: &CallerIdentity,
) -> Option<Response> {
    if request.is_notification() {
        debug!("Notification: {}", request.method);
        return None;
    }
    let id = request.id.clone()?;

    let response = match request.method.as_str() {
        "initialize" => handle_initialize(id, request, server),
        "ping" => Response::success(id, serde_json::json!({})),
        "tools/list" => handle_tools_list(id, server, caller).await,
        "tools/call" => handle_tools_call(id, request, server, caller).await,
        "resources/list" => handle_resources_list(id, server),
        "resources/read" => handle_resources_read(id, request, server).await,
        _ => Response::error(
            id,
            error_codes::METHOD_NOT_FOUND,
            format!("Method not found: {}", request.method),
        ),
    };
    Some(response)
}

fn handle_initialize<T: CommandTransport>(
    id: RequestId,
    request: &Request,
    server: &UnityMcpServer<T>,
) -> Response {
    if let Err(e) = serde_json::from_value::<InitializeParams>(request.params.clone()) {
        return Response::error(
            id,
            error_codes::INVALID_PARAMS,
            format!("Invalid initialize params: {}", e),
        );
    }

    let result = InitializeResult {
        protocol_version: "2025-11-25".to_string(),
        capabilities: ServerCapabilities {
            tools: ToolsCapability { list_changed: false },
            resources: ResourcesCapability {
                subscribe: false,
                list_changed: false,
            },
            logging: serde_json::json!({}),
        },
        server_info: server.info().clone(),
    };

    match serde_json::to_value(result) {
        Ok(value) => Response::success(id, value),
        Err(e) => Response::error(id, error_codes::INTERNAL_ERROR, e.to_string()),
    }
}

async fn handle_tools_list<T: CommandTransport>(
    id: RequestId,
    server: &UnityMcpServer<T>,
    caller: &CallerIdentity,
) -> Response {
    let active = server.router().get_active_instance(caller);
    let plugin_tools = server
        .transport()
        .tools_for_instance(active.as_deref())
        .await;
    let tools = merge_tools(&plugin_tools);
    Response::success(id, serde_json::json!({ "tools": tools }))
}

async fn handle_tools_call<T: CommandTransport>(
    id: RequestId,
    request: &Request,
    server: &UnityMcpServer<T>,
    caller: &CallerIdentity,
) -> Response {
    #[derive(serde::Deserialize)]
    struct ToolCallParams {
        name: String,
        #[serde(default)]
        arguments: serde_json::Value,
    }

    let params: ToolCallParams = match serde_json::from_value(request.params.clone()) {
        Ok(p) => p,
        Err(e) => {
            return Response::error(
                id,
                error_codes::INVALID_PARAMS,
                format!("Invalid tool call params: {}", e),
            );
        }
    };

    let transport = server.transport();
    let router = server.router();
    router
        .call(caller, |ctx| {
            handle_tool_call(
                &params.name,
                params.arguments,
                id,
                transport.as_ref(),
                router,
                ctx,
            )
        })
        .await
}

fn handle_resources_list<T: CommandTransport>(
    id: RequestId,
    server: &UnityMcpServer<T>,
) -> Response {
    let mut resources = vec![serde_json::json!({
        "uri": INSTANCES_URI,
        "name": "Unity Instances",
        "description": "Running Unity Editor instances and their Name@hash ids",
        "mimeType": "application/json"
    })];
    if server.transport().session_resolver().is_some() {
        resources.push(serde_json::json!({
            "uri": SESSIONS_URI,
            "name": "Plugin Sessions",
            "description": "Plugin sessions connected to the hub",
            "mimeType": "application/json"
        }));
    }

    Response::success(id, serde_json::json!({ "resources": resources }))
}

async fn handle_resources_read<T: CommandTransport>(
    id: RequestId,
    request: &Request,
    server: &UnityMcpServer<T>,
) -> Response {
    #[derive(serde::Deserialize)]
    struct ReadParams {
        uri: String,
    }

    let params: ReadParams = match serde_json::from_value(request.params.clone()) {
        Ok(p) => p,
        Err(e) => {
            return Response::error(
                id,
                error_codes::INVALID_PARAMS,
                format!("Invalid read params: {}", e),
            );
        }
    };

    let content = match params.uri.as_str() {
        INSTANCES_URI => match server.transport().list_instances(false).await {
            Ok(instances) => serde_json::to_value(InstanceList::new(instances)),
            Err(e) => Ok(serde_json::json!({
                "success": false,
                "error": format!("Failed to list Unity instances: {}", e),
                "instance_count": 0,
                "instances": []
            })),
        },
        SESSIONS_URI => match server.transport().session_list().await {
            Some(sessions) => serde_json::to_value(sessions),
            None => {
                return Response::error(
                    id,
                    error_codes::INVALID_PARAMS,
                    "Session listing requires the plugin hub transport",
                );
            }
        },
        _ => {
            return Response::error(
                id,
                error_codes::INVALID_PARAMS,
                format!("Unknown resource: {}", params.uri),
            );
        }
    };

    let content = match content {
        Ok(content) => content,
        Err(e) => return Response::error(id, error_codes::INTERNAL_ERROR, e.to_string()),
    };

    Response::success(
        id,
        serde_json::json!({
            "contents": [{
                "uri": params.uri,
                "mimeType": "application/json",
                "text": content.to_string()
            }]
        }),
    )
}
