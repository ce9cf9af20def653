//! Model invocation adapter
//!
//! One call: transcript + tool descriptors in, one assistant message out.
//! The behavioural preamble is injected on every call and never stored.

use crate::error::OrchestrationError;
use crate::models::{Message, Role, SessionId, ToolCallRequest, ToolDescriptor};
use crate::Result;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

pub mod gemini;
pub mod retry;

pub use gemini::GeminiModel;
pub use retry::{with_retry, RetryPolicy};

pub const PREAMBLE: &str = r#"You are StockPulse, a friendly stock assistant that users reach over WhatsApp.

You can:
- Look up current prices and daily moves for any ticker
- Record purchases in the user's portfolio and remove positions
- Keep a watchlist of tickers the user wants to follow
- Value the portfolio at current prices and report gains and losses

When the user reports a purchase, pull out the ticker symbol, the number of shares and the price paid per share, then record it with the portfolio tool.

Portfolio and watchlist tools always act on the current user; you never need to pass a phone number.

Keep replies short, this is a chat app. Format prices as $123.45 and percentages as 1.23%. Use 📈 for gains and 📉 for losses, and keep other emojis rare.

Only quote prices and portfolio figures that came back from a tool. If a tool reports a failure, say so plainly instead of guessing."#;

/// Full system text for one session.
pub fn system_prompt(session_id: &SessionId) -> String {
    format!("{}\n\nCurrent user's phone number: {}", PREAMBLE, session_id)
}

#[async_trait::async_trait]
pub trait ModelAdapter: Send + Sync {
    /// Produce the next assistant message. Must return a `Role::Assistant` message.
    async fn invoke(
        &self,
        session_id: &SessionId,
        transcript: &[Message],
        tools: &[ToolDescriptor],
    ) -> Result<Message>;
}

// =============================
// Scripted model (tests, offline runs)
// =============================

/// Replays queued replies in order. When the queue is empty it falls back to
/// the `repeat` message if one is set, otherwise fails with `ModelResponse`.
#[derive(Default)]
pub struct ScriptedModel {
    replies: Mutex<VecDeque<Result<Message>>>,
    repeat: Option<Message>,
    delay: Option<Duration>,
    invocations: Mutex<Vec<usize>>,
}

impl ScriptedModel {
    pub fn new(replies: Vec<Message>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().map(Ok).collect()),
            ..Self::default()
        }
    }

    pub fn from_results(replies: Vec<Result<Message>>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Answer every call with a copy of `message` (tool call ids are refreshed).
    pub fn repeating(message: Message) -> Self {
        Self {
            repeat: Some(message),
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn invocations(&self) -> usize {
        self.invocations.lock().map(|v| v.len()).unwrap_or(0)
    }

    /// Transcript length seen by each invocation, in call order.
    pub fn transcript_lengths(&self) -> Vec<usize> {
        self.invocations.lock().map(|v| v.clone()).unwrap_or_default()
    }

    fn next_reply(&self) -> Result<Message> {
        let queued = self
            .replies
            .lock()
            .map_err(|_| OrchestrationError::ModelResponse("scripted model poisoned".to_string()))?
            .pop_front();

        match (queued, &self.repeat) {
            (Some(reply), _) => reply,
            (None, Some(template)) => {
                let calls = template
                    .tool_calls
                    .iter()
                    .map(|c| ToolCallRequest::new(c.tool_name.clone(), c.arguments.clone()))
                    .collect();
                Ok(Message::assistant_with_tools(template.content.clone(), calls))
            }
            (None, None) => Err(OrchestrationError::ModelResponse("script exhausted".to_string())),
        }
    }
}

#[async_trait::async_trait]
impl ModelAdapter for ScriptedModel {
    async fn invoke(
        &self,
        _session_id: &SessionId,
        transcript: &[Message],
        _tools: &[ToolDescriptor],
    ) -> Result<Message> {
        if let Ok(mut seen) = self.invocations.lock() {
            seen.push(transcript.len());
        }

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let reply = self.next_reply()?;
        if reply.role != Role::Assistant {
            return Err(OrchestrationError::ModelResponse(format!(
                "scripted reply has role {}",
                reply.role.as_str()
            )));
        }
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    #[test]
    fn test_system_prompt_carries_session() {
        let prompt = system_prompt(&SessionId::new("+15551234567").unwrap());
        assert!(prompt.starts_with(PREAMBLE));
        assert!(prompt.ends_with("Current user's phone number: +15551234567"));
    }

    #[tokio::test]
    async fn test_scripted_model_replays_then_fails() {
        let model = ScriptedModel::new(vec![Message::assistant("one")]);
        let id = SessionId::new("+1").unwrap();

        let first = model.invoke(&id, &[], &[]).await.unwrap();
        assert_eq!(first.content, "one");
        assert!(model.invoke(&id, &[], &[]).await.is_err());
        assert_eq!(model.invocations(), 2);
    }

    #[tokio::test]
    async fn test_repeating_model_refreshes_call_ids() {
        let template = Message::assistant_with_tools("", vec![ToolCallRequest::new("get_portfolio", Map::new())]);
        let model = ScriptedModel::repeating(template);
        let id = SessionId::new("+1").unwrap();

        let a = model.invoke(&id, &[], &[]).await.unwrap();
        let b = model.invoke(&id, &[], &[]).await.unwrap();
        assert_ne!(a.tool_calls[0].id, b.tool_calls[0].id);
    }
}
