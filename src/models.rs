//! Core data models for the conversation loop

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

use crate::error::OrchestrationError;
use crate::Result;

//
// ================= Session =================
//

/// Stable identifier of one conversation, derived from the user's messaging address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into().trim().to_string();
        if id.is_empty() {
            return Err(OrchestrationError::InvalidInput(
                "session id must not be empty".to_string(),
            ));
        }
        Ok(Self(id))
    }

    /// Build a session id from a gateway address such as `whatsapp:+15551234567`.
    pub fn from_address(address: &str) -> Result<Self> {
        let trimmed = address.trim();
        let stripped = trimmed.strip_prefix("whatsapp:").unwrap_or(trimmed);
        Self::new(stripped)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short hash used in logs instead of the raw phone number.
    pub fn log_key(&self) -> String {
        let hash = Sha256::digest(self.0.as_bytes());
        hex::encode(&hash[..6])
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

//
// ================= Messages =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "tool" => Some(Role::Tool),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub tool_name: String,
    pub arguments: Map<String, Value>,
}

impl ToolCallRequest {
    pub fn new(tool_name: impl Into<String>, arguments: Map<String, Value>) -> Self {
        Self {
            id: format!("call_{}", Uuid::new_v4().simple()),
            tool_name: tool_name.into(),
            arguments,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub tool_call_id: String,
    pub output: Value,
}

impl ToolCallResult {
    pub fn failure(tool_call_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            output: json!({
                "success": false,
                "error": error.into(),
            }),
        }
    }

    pub fn success(&self) -> bool {
        self.output
            .get("success")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// A single transcript entry. Never mutated once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: Uuid,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    fn build(
        role: Role,
        content: String,
        tool_calls: Vec<ToolCallRequest>,
        tool_call_id: Option<String>,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            role,
            content,
            tool_calls,
            tool_call_id,
            created_at: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::build(Role::User, content.into(), Vec::new(), None)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::build(Role::Assistant, content.into(), Vec::new(), None)
    }

    pub fn assistant_with_tools(content: impl Into<String>, tool_calls: Vec<ToolCallRequest>) -> Self {
        Self::build(Role::Assistant, content.into(), tool_calls, None)
    }

    /// Tool messages carry the serialized output and the id of the request they answer.
    pub fn tool_result(result: &ToolCallResult) -> Self {
        Self::build(
            Role::Tool,
            result.output.to_string(),
            Vec::new(),
            Some(result.tool_call_id.clone()),
        )
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    /// Parsed tool output for tool-role messages.
    pub fn tool_output(&self) -> Option<Value> {
        if self.role != Role::Tool {
            return None;
        }
        serde_json::from_str(&self.content).ok()
    }
}

//
// ================= Tool descriptors =================
//

/// What the model adapter sees of a registered tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameter_schema: Value,
}
