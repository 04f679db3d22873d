//! Core data types used throughout mcp-proxy.
//!
//! This module defines the chat wire types exchanged with the backend
//! (requests, responses, messages, tool call payloads) and the internal
//! tool call / tool result structures that flow through the tool loop.
//!
//! Wire types keep unknown fields in a flattened map so that whatever the
//! client or backend sent (`options`, `images`, `done_reason`, ...) is
//! forwarded unchanged.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::warn;

use crate::error::ToolError;

// --- Message Roles ---

/// The role of a message in the conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

// --- Tool Call Payload (wire) ---

/// A tool call as it appears inside a backend message.
///
/// `arguments` is kept as raw JSON: some backends send an object, others a
/// JSON-encoded string. An entry without `function` cannot be serviced and
/// is skipped on its own, without discarding its siblings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<FunctionCall>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

// --- Tool Call (internal) ---

/// A tool invocation requested by the backend, normalized for dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    /// Identifier used to correlate the result with the request
    pub id: String,
    /// Name of the tool to invoke (e.g. "get_greeting")
    pub name: String,
    /// Raw arguments as sent by the backend
    pub arguments: Value,
}

impl ToolCall {
    /// Normalize a wire payload. Backends that do not number their calls
    /// get a positional id so parsing stays deterministic.
    pub fn from_payload(index: usize, payload: &ToolCallPayload) -> Option<Self> {
        let function = payload.function.as_ref()?;
        Some(Self {
            id: payload
                .id
                .clone()
                .unwrap_or_else(|| format!("call_{}", index)),
            name: function.name.clone(),
            arguments: function.arguments.clone(),
        })
    }
}

/// Normalize every serviceable payload, keeping positional ids stable.
pub fn normalize_calls(payloads: &[ToolCallPayload]) -> Vec<ToolCall> {
    payloads
        .iter()
        .enumerate()
        .filter_map(|(i, payload)| {
            let call = ToolCall::from_payload(i, payload);
            if call.is_none() {
                warn!(index = i, "Skipping tool call without a function");
            }
            call
        })
        .collect()
}

// --- Tool Definition ---

/// Describes a tool's interface to the backend via JSON Schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub argument_schema: Value,
}

impl ToolDefinition {
    /// Render in the `{"type": "function", "function": {...}}` form chat
    /// backends expect in the request's `tools` array.
    pub fn to_wire(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.argument_schema,
            }
        })
    }
}

// --- Tool Result ---

/// The outcome of one dispatched tool call.
#[derive(Debug)]
pub struct ToolResult {
    pub call_id: String,
    pub name: String,
    pub outcome: Result<String, ToolError>,
}

impl ToolResult {
    /// Text fed back to the backend. Failures are rendered, never dropped.
    pub fn content(&self) -> String {
        match &self.outcome {
            Ok(output) => output.clone(),
            Err(e) => e.to_string(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.outcome.is_err()
    }

    /// Convert into the tool-role message appended to history.
    pub fn to_message(&self) -> Message {
        Message::tool_result(&self.call_id, &self.name, self.content())
    }
}

// --- Messages ---

/// A single message in the conversation history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    /// If the assistant wants to call tools, this will be non-empty
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallPayload>,
    /// For tool result messages, this links back to the tool call ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Message {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: vec![],
            tool_call_id: None,
            tool_name: None,
            extra: Map::new(),
        }
    }

    #[cfg(test)]
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    #[cfg(test)]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Create an assistant message that includes tool calls.
    pub fn assistant_with_tool_calls(
        content: impl Into<String>,
        tool_calls: Vec<ToolCallPayload>,
    ) -> Self {
        Self {
            tool_calls,
            ..Self::new(Role::Assistant, content)
        }
    }

    /// Create a tool result message.
    pub fn tool_result(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            tool_name: Some(tool_name.into()),
            ..Self::new(Role::Tool, content)
        }
    }

    /// Tool calls carried by this message, normalized for dispatch.
    pub fn calls(&self) -> Vec<ToolCall> {
        normalize_calls(&self.tool_calls)
    }
}

// --- Chat Request / Response ---

/// A chat request as sent by the client and forwarded to the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    /// Always serialized so the backend answers in the mode the loop expects
    #[serde(default)]
    pub stream: bool,
    /// Tool definitions in wire form; kept raw so client entries pass verbatim
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A buffered (non-streaming) chat response from the backend.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatResponse {
    pub message: Message,
}

// --- Stream Chunk ---

/// One line of a streaming chat response.
///
/// Lines may carry only a content delta, only tool calls, or only the final
/// `done` marker; the marker itself is not needed to rebuild the turn.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamChunk {
    #[serde(default)]
    pub message: Option<StreamDelta>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamDelta {
    #[serde(default)]
    pub role: Option<Role>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallPayload>,
    /// Other per-line fragments, e.g. `thinking`
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}
