//! Tool capability metadata advertised by Unity plugins

use serde::{Deserialize, Serialize};

/// A single tool parameter
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolParameter {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "type", default = "default_param_type")]
    pub param_type: String,
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
}

/// A command the plugin's current build exposes as a tool
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "default_true")]
    pub structured_output: bool,
    #[serde(default)]
    pub requires_polling: bool,
    #[serde(default = "default_poll_action")]
    pub poll_action: String,
    #[serde(default)]
    pub parameters: Vec<ToolParameter>,
}

fn default_param_type() -> String {
    "string".to_string()
}

fn default_true() -> bool {
    true
}

fn default_poll_action() -> String {
    "status".to_string()
}

impl ToolDefinition {
    /// JSON schema for MCP `tools/list`
    pub fn input_schema(&self) -> serde_json::Value {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for param in &self.parameters {
            let mut prop = serde_json::json!({ "type": param.param_type });
            if let Some(description) = &param.description {
                prop["description"] = serde_json::Value::String(description.clone());
            }
            if let Some(default) = &param.default_value {
                prop["default"] = serde_json::Value::String(default.clone());
            }
            properties.insert(param.name.clone(), prop);
            if param.required {
                required.push(param.name.clone());
            }
        }
        serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }
}
