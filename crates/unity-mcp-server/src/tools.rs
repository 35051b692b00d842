//! MCP tool handlers

use serde::{Deserialize, Serialize};
use tracing::debug;
use unity_mcp_core::{InstanceList, McpResponse, Result, ToolDefinition, UnityMcpError};

use crate::command::CommandTransport;
use crate::mcp::{RequestId, Response};
use crate::middleware::{CallContext, InstanceRouter};

/// Tool definition for MCP tools/list
#[derive(Debug, Clone, Serialize)]
pub struct ToolDef {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: serde_json::Value,
}

impl From<&ToolDefinition> for ToolDef {
    fn from(tool: &ToolDefinition) -> Self {
        Self {
            name: tool.name.clone(),
            description: tool
                .description
                .clone()
                .unwrap_or_else(|| format!("Unity editor tool '{}'", tool.name)),
            input_schema: tool.input_schema(),
        }
    }
}

/// Built-in routing tools
pub fn list_tools() -> Vec<ToolDef> {
    vec![
        ToolDef {
            name: "set_active_instance".into(),
            description: "Set the active Unity instance for this session. Requires the exact Name@hash id from unity://instances. Example: {\"instance\": \"MyGame@abcd1234\"}".into(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "instance": {
                        "type": "string",
                        "description": "Target instance as Name@hash"
                    }
                },
                "required": ["instance"]
            }),
        },
        ToolDef {
            name: "list_instances".into(),
            description: "List running Unity Editor instances with their Name@hash ids.".into(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "force_refresh": {
                        "type": "boolean",
                        "description": "Bypass the discovery cache",
                        "default": false
                    }
                }
            }),
        },
        ToolDef {
            name: "execute_command".into(),
            description: "Send a raw command to the Unity editor. Routed to the active instance unless 'instance' is given.".into(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "command": {
                        "type": "string",
                        "description": "Command type, e.g. \"manage_scene\""
                    },
                    "params": {
                        "type": "object",
                        "description": "Command parameters"
                    },
                    "instance": {
                        "type": "string",
                        "description": "Optional Name@hash override"
                    }
                },
                "required": ["command"]
            }),
        },
    ]
}

fn is_builtin(name: &str) -> bool {
    matches!(
        name,
        "set_active_instance" | "list_instances" | "execute_command"
    )
}

/// Built-in tools followed by the plugin's own tools
pub fn merge_tools(plugin_tools: &[ToolDefinition]) -> Vec<ToolDef> {
    let mut tools = list_tools();
    tools.extend(
        plugin_tools
            .iter()
            .filter(|t| !is_builtin(&t.name))
            .map(ToolDef::from),
    );
    tools
}

/// Parameters for set_active_instance
#[derive(Debug, Deserialize)]
pub struct SetActiveInstanceParams {
    pub instance: String,
}

/// Parameters for list_instances
#[derive(Debug, Default, Deserialize)]
pub struct ListInstancesParams {
    #[serde(default)]
    pub force_refresh: bool,
}

/// Parameters for execute_command
#[derive(Debug, Deserialize)]
pub struct ExecuteCommandParams {
    pub command: String,
    #[serde(default = "empty_object")]
    pub params: serde_json::Value,
    #[serde(default)]
    pub instance: Option<String>,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(Default::default())
}

/// Handle a tools/call request
pub async fn handle_tool_call<T: CommandTransport>(
    name: &str,
    params: serde_json::Value,
    id: RequestId,
    transport: &T,
    router: &InstanceRouter,
    ctx: CallContext,
) -> Response {
    let result = match name {
        "set_active_instance" => handle_set_active_instance(params, transport, router, &ctx).await,
        "list_instances" => handle_list_instances(params, transport).await,
        "execute_command" => handle_execute_command(params, transport, &ctx).await,
        _ => handle_plugin_tool(name, params, transport, &ctx).await,
    };

    match result {
        Ok(value) => Response::success(
            id,
            serde_json::json!({ "content": [{ "type": "text", "text": value.to_string() }] }),
        ),
        Err(e) => Response::error(id, e.rpc_code(), e.to_string()),
    }
}

async fn handle_set_active_instance<T: CommandTransport>(
    params: serde_json::Value,
    transport: &T,
    router: &InstanceRouter,
    ctx: &CallContext,
) -> Result<serde_json::Value> {
    let p: SetActiveInstanceParams = serde_json::from_value(params)
        .map_err(|e| UnityMcpError::InvalidParams(e.to_string()))?;

    let instances = transport.list_instances(true).await?;
    if instances.is_empty() {
        return Ok(McpResponse::failure(
            "No Unity instances are currently connected. Start Unity and press 'Start Session'.",
        )
        .to_value());
    }

    let value = p.instance.trim();
    if value.is_empty() || !value.contains('@') {
        return Ok(McpResponse::failure(
            "Instance identifier must be Name@hash. \
             Use unity://instances to copy the exact id (e.g., MyProject@abcd1234).",
        )
        .to_value());
    }

    let Some(found) = instances.iter().find(|inst| inst.id == value) else {
        return Ok(
            McpResponse::failure(UnityMcpError::InstanceNotFound(value.to_string()).to_string())
                .to_value(),
        );
    };

    router.set_active_instance(&ctx.caller, &found.id);
    Ok(McpResponse::ok(
        format!("Active instance set to {}", found.id),
        Some(serde_json::json!({ "instance": found.id })),
    )
    .to_value())
}

async fn handle_list_instances<T: CommandTransport>(
    params: serde_json::Value,
    transport: &T,
) -> Result<serde_json::Value> {
    let p: ListInstancesParams = if params.is_null() {
        ListInstancesParams::default()
    } else {
        serde_json::from_value(params).map_err(|e| UnityMcpError::InvalidParams(e.to_string()))?
    };
    let instances = transport.list_instances(p.force_refresh).await?;
    Ok(serde_json::to_value(InstanceList::new(instances))?)
}

async fn handle_execute_command<T: CommandTransport>(
    params: serde_json::Value,
    transport: &T,
    ctx: &CallContext,
) -> Result<serde_json::Value> {
    let p: ExecuteCommandParams = serde_json::from_value(params)
        .map_err(|e| UnityMcpError::InvalidParams(e.to_string()))?;
    let instance = p.instance.as_deref().or(ctx.unity_instance.as_deref());
    dispatch(transport, ctx, instance, &p.command, p.params).await
}

async fn handle_plugin_tool<T: CommandTransport>(
    name: &str,
    params: serde_json::Value,
    transport: &T,
    ctx: &CallContext,
) -> Result<serde_json::Value> {
    let instance = ctx.unity_instance.as_deref();
    let registered = transport
        .tools_for_instance(instance)
        .await
        .iter()
        .any(|t| t.name == name);
    if !registered {
        return Err(UnityMcpError::ProtocolError(format!("Unknown tool: {}", name)));
    }
    let params = if params.is_null() { empty_object() } else { params };
    dispatch(transport, ctx, instance, name, params).await
}

/// Send to the session the router already resolved, else by instance
///
/// The routed session is only used when the call targets the active
/// instance. A session that dropped since routing falls back to normal
/// resolution so a reconnecting editor is still found.
async fn dispatch<T: CommandTransport>(
    transport: &T,
    ctx: &CallContext,
    instance: Option<&str>,
    command: &str,
    params: serde_json::Value,
) -> Result<serde_json::Value> {
    if let Some(session_id) = ctx.unity_session_id.as_deref() {
        if instance == ctx.unity_instance.as_deref() {
            match transport
                .send_command_to_session(session_id, command, params.clone())
                .await
            {
                Err(UnityMcpError::NotConnected(_)) => {
                    debug!("Session {} went away; resolving {:?}", session_id, instance);
                }
                other => return other,
            }
        }
    }
    transport.send_command(instance, command, params).await
}
