//! Conversation and tool-call models shared by the decoder, engine and feedback loop.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Separator between the client name and the tool name in a qualified tool name.
pub const CLIENT_TOOL_SEPARATOR: &str = "__";

// === Messages ===

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Function,
    System,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Function => "function",
            Role::System => "system",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Text attached to a message, rendered ahead of the message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub content: String,
}

/// Image attached to a message, base64-encoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageAttachment {
    pub name: String,
    pub mime_type: String,
    pub data: String,
}

impl ImageAttachment {
    #[must_use]
    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.data)
    }
}

/// One entry in the conversation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub role: Role,
    /// Present on function messages: the qualified tool name the result belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub content: String,
    /// Present on assistant messages that record a tool invocation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_call: Option<ToolCallRequest>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageAttachment>,
}

impl ChatMessage {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            name: None,
            content: content.into(),
            function_call: None,
            attachments: Vec::new(),
            images: Vec::new(),
        }
    }

    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Assistant message recording that the model asked for `request`.
    #[must_use]
    pub fn function_call(request: &ToolCallRequest) -> Self {
        let mut message = Self::new(Role::Assistant, String::new());
        message.function_call = Some(request.clone());
        message
    }

    /// Function message carrying the outcome of `request`.
    #[must_use]
    pub fn function_result(request: &ToolCallRequest, result: &ToolCallResult) -> Self {
        let mut message = Self::new(Role::Function, result.response_text());
        message.name = Some(request.name.clone());
        message.function_call = Some(request.clone());
        message
    }

    #[must_use]
    pub fn with_attachment(mut self, name: impl Into<String>, content: impl Into<String>) -> Self {
        self.attachments.push(Attachment {
            name: name.into(),
            content: content.into(),
        });
        self
    }

    #[must_use]
    pub fn with_image(
        mut self,
        name: impl Into<String>,
        mime_type: impl Into<String>,
        data: impl Into<String>,
    ) -> Self {
        self.images.push(ImageAttachment {
            name: name.into(),
            mime_type: mime_type.into(),
            data: data.into(),
        });
        self
    }
}

// === Tool Calls ===

/// A tool invocation requested by the model.
///
/// `name` is qualified as `<client>__<tool>`. The id may be empty for calls
/// assembled from legacy `function_call` deltas.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: Map<String, Value>,
}

impl ToolCallRequest {
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }

    /// Split the qualified name on the first separator into `(client, tool)`.
    #[must_use]
    pub fn split_name(&self) -> Option<(&str, &str)> {
        self.name.split_once(CLIENT_TOOL_SEPARATOR)
    }
}

/// Build the name a tool is advertised under.
#[must_use]
pub fn qualified_tool_name(client: &str, tool: &str) -> String {
    format!("{client}{CLIENT_TOOL_SEPARATOR}{tool}")
}

#[derive(Deserialize)]
struct RawFunction {
    name: Option<String>,
    #[serde(default)]
    arguments: Value,
}

/// Accepts both `{"id","name","arguments"}` and `{"id","function":{"name","arguments"}}`.
#[derive(Deserialize)]
struct RawToolCall {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Value,
    #[serde(default)]
    function: Option<RawFunction>,
}

impl<'de> Deserialize<'de> for ToolCallRequest {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = RawToolCall::deserialize(deserializer)?;
        let (name, arguments) = match raw.function {
            Some(function) => (function.name, function.arguments),
            None => (raw.name, raw.arguments),
        };
        let name = name
            .filter(|name| !name.is_empty())
            .ok_or_else(|| de::Error::custom("function call is missing a name"))?;
        let arguments = arguments_to_map(arguments).map_err(|reason| {
            de::Error::custom(format!("invalid arguments for {name}: {reason}"))
        })?;
        Ok(Self {
            id: raw.id.unwrap_or_default(),
            name,
            arguments,
        })
    }
}

fn arguments_to_map(arguments: Value) -> Result<Map<String, Value>, String> {
    match arguments {
        Value::Null => Ok(Map::new()),
        Value::Object(map) => Ok(map),
        Value::String(raw) if raw.trim().is_empty() => Ok(Map::new()),
        Value::String(raw) => match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(other) => Err(format!("expected a JSON object, got {other}")),
            Err(err) => Err(err.to_string()),
        },
        other => Err(format!("expected a JSON object, got {other}")),
    }
}

// === Tool Results ===

/// One part of a tool result. Only text parts are interpreted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentPart {
    Text {
        text: String,
    },
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    Resource {
        resource: Value,
    },
    #[serde(other)]
    Other,
}

/// The outcome of one tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallResult {
    #[serde(default)]
    pub content: Vec<ContentPart>,
    #[serde(default, rename = "isError")]
    pub is_error: bool,
}

impl ToolCallResult {
    #[must_use]
    pub fn success(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentPart::Text { text: text.into() }],
            is_error: false,
        }
    }

    #[must_use]
    pub fn error(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentPart::Text { text: text.into() }],
            is_error: true,
        }
    }

    /// Text parts joined with newlines. Non-text parts are skipped.
    #[must_use]
    pub fn text(&self) -> String {
        let mut parts = Vec::with_capacity(self.content.len());
        for part in &self.content {
            match part {
                ContentPart::Text { text } => parts.push(text.as_str()),
                other => tracing::warn!(part = ?other, "Unsupported result content type"),
            }
        }
        parts.join("\n")
    }

    /// Text fed back to the model: `text()`, prefixed with `Error: ` on failure.
    #[must_use]
    pub fn response_text(&self) -> String {
        if self.is_error {
            format!("Error: {}", self.text())
        } else {
            self.text()
        }
    }
}

// === Conversation ===

/// Shared, append-only conversation log. Clones share the same log.
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    messages: Arc<Mutex<Vec<ChatMessage>>>,
}

impl Conversation {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> MutexGuard<'_, Vec<ChatMessage>> {
        self.messages.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, message: ChatMessage) {
        self.guard().push(message);
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<ChatMessage> {
        self.guard().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.guard().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.guard().is_empty()
    }

    /// True when both handles refer to the same log.
    #[must_use]
    pub fn same_log(&self, other: &Conversation) -> bool {
        Arc::ptr_eq(&self.messages, &other.messages)
    }
}
