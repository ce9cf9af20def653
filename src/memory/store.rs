//! Session transcript
//!
//! Ordered, append-only message history owned by one session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::models::{Message, Role, SessionId};

/// Full history of a session from its first contact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transcript {
    pub session_id: SessionId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    messages: Vec<Message>,
}

impl Transcript {
    /// Create an empty transcript
    pub fn new(session_id: SessionId) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            created_at: now,
            updated_at: now,
            messages: Vec::new(),
        }
    }

    /// Rebuild a transcript loaded from persistent storage.
    pub fn from_messages(session_id: SessionId, messages: Vec<Message>) -> Self {
        let created_at = messages.first().map(|m| m.created_at).unwrap_or_else(Utc::now);
        let updated_at = messages.last().map(|m| m.created_at).unwrap_or(created_at);
        Self {
            session_id,
            created_at,
            updated_at,
            messages,
        }
    }

    /// Append messages at the end; existing entries are never touched.
    pub fn append<I>(&mut self, messages: I)
    where
        I: IntoIterator<Item = Message>,
    {
        let before = self.messages.len();
        self.messages.extend(messages);
        if self.messages.len() > before {
            self.updated_at = Utc::now();
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Ids of tool call requests that have no matching tool message yet.
    pub fn unanswered_calls(&self) -> Vec<String> {
        let answered: HashSet<&str> = self
            .messages
            .iter()
            .filter(|m| m.role == Role::Tool)
            .filter_map(|m| m.tool_call_id.as_deref())
            .collect();

        self.messages
            .iter()
            .flat_map(|m| m.tool_calls.iter())
            .filter(|call| !answered.contains(call.id.as_str()))
            .map(|call| call.id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ToolCallRequest, ToolCallResult};
    use serde_json::Map;

    fn session() -> SessionId {
        SessionId::new("+15550001111").unwrap()
    }

    #[test]
    fn test_append_preserves_order() {
        let mut transcript = Transcript::new(session());
        transcript.append(vec![Message::user("hi"), Message::assistant("hello")]);
        transcript.append(vec![Message::user("price of AAPL?")]);

        let contents: Vec<&str> = transcript.messages().iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["hi", "hello", "price of AAPL?"]);
        assert_eq!(transcript.last().unwrap().role, Role::User);
    }

    #[test]
    fn test_unanswered_calls() {
        let call = ToolCallRequest::new("get_portfolio", Map::new());
        let mut transcript = Transcript::new(session());
        transcript.append(vec![
            Message::user("show my portfolio"),
            Message::assistant_with_tools("", vec![call.clone()]),
        ]);
        assert_eq!(transcript.unanswered_calls(), vec![call.id.clone()]);

        transcript.append(vec![Message::tool_result(&ToolCallResult::failure(&call.id, "x"))]);
        assert!(transcript.unanswered_calls().is_empty());
    }
}
