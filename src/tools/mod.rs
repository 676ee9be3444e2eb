//! Tool-client seams: the registry that resolves a client by name and the
//! synchronous client that executes one tool call.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;

use crate::models::{ToolCallResult, qualified_tool_name};

pub mod registry;

pub use registry::StaticRegistry;

// === Descriptors ===

/// A tool as advertised by its client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "empty_object_schema", rename = "inputSchema")]
    pub input_schema: Value,
}

fn empty_object_schema() -> Value {
    json!({"type": "object", "properties": {}})
}

impl ToolDescriptor {
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            description: Some(description.into()),
            input_schema,
        }
    }
}

/// The tools one enabled client exposes.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ClientDescriptor {
    pub tools: Vec<ToolDescriptor>,
}

/// A tool definition as sent to the model.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl FunctionDefinition {
    fn from_tool(client: &str, tool: &ToolDescriptor) -> Self {
        let schema = &tool.input_schema;
        let mut parameters = Map::new();
        parameters.insert(
            "type".to_string(),
            schema.get("type").cloned().unwrap_or_else(|| json!("object")),
        );
        parameters.insert(
            "properties".to_string(),
            schema.get("properties").cloned().unwrap_or_else(|| json!({})),
        );
        if let Some(required) = schema.get("required").filter(|r| r.is_array()) {
            parameters.insert("required".to_string(), required.clone());
        }
        Self {
            name: qualified_tool_name(client, &tool.name),
            description: tool.description.clone().unwrap_or_default(),
            parameters: Value::Object(parameters),
        }
    }

    /// Legacy `functions` entry.
    #[must_use]
    pub fn to_function_json(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "parameters": self.parameters,
        })
    }

    /// `tools` entry.
    #[must_use]
    pub fn to_tool_json(&self) -> Value {
        json!({"type": "function", "function": self.to_function_json()})
    }
}

// === Traits ===

/// Executes tool calls for one client (for example one MCP server).
///
/// Calls run on a blocking worker. Implementations should check `cancel`
/// where they can; a call whose deadline passed is cancelled but not killed.
/// Several calls to one client may be in flight at once. A client that
/// serializes them must keep checking `cancel` while a call waits its turn.
/// `Ok(None)` means the client produced no result.
pub trait ToolClient: Send + Sync {
    fn call_tool(
        &self,
        tool_name: &str,
        arguments: &Map<String, Value>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Option<ToolCallResult>>;
}

/// Maps client names to clients.
pub trait ToolClientRegistry: Send + Sync {
    fn find_client(&self, name: &str) -> Option<Arc<dyn ToolClient>>;
    fn list_enabled_clients(&self) -> BTreeMap<String, ClientDescriptor>;
}

/// Every enabled tool, named `<client>__<tool>`.
#[must_use]
pub fn function_definitions(registry: &dyn ToolClientRegistry) -> Vec<FunctionDefinition> {
    registry
        .list_enabled_clients()
        .iter()
        .flat_map(|(client, descriptor)| {
            descriptor
                .tools
                .iter()
                .map(move |tool| FunctionDefinition::from_tool(client, tool))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn definitions_use_qualified_names_and_trimmed_schema() {
        let registry = StaticRegistry::new().with_client(
            "files",
            vec![ToolDescriptor::new(
                "read",
                "Read a file",
                json!({
                    "type": "object",
                    "$schema": "http://json-schema.org/draft-07/schema#",
                    "properties": {"path": {"type": "string"}},
                    "required": ["path"]
                }),
            )],
            Arc::new(|_: &str, _: &Map<String, Value>| Ok(Some(ToolCallResult::success("ok")))),
        );

        let definitions = function_definitions(&registry);
        assert_eq!(definitions.len(), 1);
        assert_eq!(definitions[0].name, "files__read");
        assert_eq!(
            definitions[0].to_tool_json(),
            json!({
                "type": "function",
                "function": {
                    "name": "files__read",
                    "description": "Read a file",
                    "parameters": {
                        "type": "object",
                        "properties": {"path": {"type": "string"}},
                        "required": ["path"]
                    }
                }
            })
        );
    }

    #[test]
    fn schema_defaults_to_an_empty_object() {
        let tool: ToolDescriptor = serde_json::from_value(json!({"name": "now"})).unwrap();
        let definition = FunctionDefinition::from_tool("clock", &tool);
        assert_eq!(
            definition.parameters,
            json!({"type": "object", "properties": {}})
        );
    }
}
