//! Response envelope returned to MCP clients

use serde::{Deserialize, Serialize};

/// Hint telling the client the editor is reloading and the call can be retried
pub const HINT_RETRY: &str = "retry";

/// Uniform tool response
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct McpResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl McpResponse {
    pub fn ok(message: impl Into<String>, data: Option<serde_json::Value>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            data,
            ..Default::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    /// Structured "editor is reloading" response
    pub fn reloading(retry_after_ms: u64) -> Self {
        Self {
            success: false,
            error: Some("Unity domain reload in progress, please try again shortly".into()),
            data: Some(serde_json::json!({
                "state": "reloading",
                "retry_after_ms": retry_after_ms,
            })),
            hint: Some(HINT_RETRY.into()),
            ..Default::default()
        }
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Whether a raw editor response says the editor is mid-reload
pub fn is_reloading_response(resp: &serde_json::Value) -> bool {
    let Some(obj) = resp.as_object() else {
        return false;
    };
    if obj.get("state").and_then(|s| s.as_str()) == Some("reloading") {
        return true;
    }
    if obj
        .get("data")
        .and_then(|d| d.get("state"))
        .and_then(|s| s.as_str())
        == Some("reloading")
    {
        return true;
    }
    let text = obj
        .get("message")
        .or_else(|| obj.get("error"))
        .and_then(|m| m.as_str())
        .unwrap_or_default();
    text.to_lowercase().contains("reload")
}

/// `retry_after_ms` carried by a reloading response, if any
pub fn retry_after_ms(resp: &serde_json::Value) -> Option<u64> {
    resp.get("retry_after_ms")
        .or_else(|| resp.get("data").and_then(|d| d.get("retry_after_ms")))
        .and_then(|v| v.as_u64())
}
