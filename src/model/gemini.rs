//! Gemini-backed model adapter
//!
//! Maps the transcript onto Gemini contents:
//! - user → `user` text
//! - assistant → `model` text plus one `functionCall` part per requested tool
//! - consecutive tool messages → one `user` content of `functionResponse` parts

use crate::error::OrchestrationError;
use crate::gemini::{
    Content, FunctionDeclaration, GenerateContentRequest, GenerateContentResponse, GeminiClient,
    GenerationConfig, Part, Tool,
};
use crate::model::retry::{with_retry, RetryPolicy};
use crate::model::{system_prompt, ModelAdapter};
use crate::models::{Message, Role, SessionId, ToolCallRequest, ToolDescriptor};
use crate::Result;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use tracing::{debug, info};

const MAX_OUTPUT_TOKENS: i32 = 1024;

pub struct GeminiModel {
    client: GeminiClient,
    retry: RetryPolicy,
}

impl GeminiModel {
    pub fn new(client: GeminiClient, retry: RetryPolicy) -> Self {
        Self { client, retry }
    }

    fn build_request(
        &self,
        session_id: &SessionId,
        transcript: &[Message],
        tools: &[ToolDescriptor],
    ) -> GenerateContentRequest {
        let declarations: Vec<FunctionDeclaration> = tools
            .iter()
            .map(|t| FunctionDeclaration::new(&t.name, &t.description, &t.parameter_schema))
            .collect();

        GenerateContentRequest {
            contents: to_contents(transcript),
            tools: if declarations.is_empty() {
                Vec::new()
            } else {
                vec![Tool {
                    function_declarations: declarations,
                }]
            },
            system_instruction: Some(Content {
                role: None,
                parts: vec![Part::text(system_prompt(session_id))],
            }),
            generation_config: GenerationConfig {
                temperature: self.client.temperature(),
                max_output_tokens: MAX_OUTPUT_TOKENS,
            },
        }
    }
}

#[async_trait::async_trait]
impl ModelAdapter for GeminiModel {
    async fn invoke(
        &self,
        session_id: &SessionId,
        transcript: &[Message],
        tools: &[ToolDescriptor],
    ) -> Result<Message> {
        let request = self.build_request(session_id, transcript, tools);

        let response = with_retry(&self.retry, || self.client.generate(&request)).await?;
        let message = from_response(response)?;

        info!(
            session = %session_id.log_key(),
            tool_calls = message.tool_calls.len(),
            "Model replied"
        );
        Ok(message)
    }
}

/// Transcript → Gemini contents.
pub(crate) fn to_contents(transcript: &[Message]) -> Vec<Content> {
    let mut contents: Vec<Content> = Vec::with_capacity(transcript.len());
    let mut call_names: HashMap<&str, &str> = HashMap::new();

    for msg in transcript {
        match msg.role {
            // Gemini rejects empty text parts and contents without parts.
            Role::User if msg.content.trim().is_empty() => {}
            Role::User => contents.push(Content::new("user", vec![Part::text(msg.content.clone())])),
            Role::Assistant => {
                let mut parts = Vec::with_capacity(msg.tool_calls.len() + 1);
                if !msg.content.trim().is_empty() {
                    parts.push(Part::text(msg.content.clone()));
                }
                for call in &msg.tool_calls {
                    call_names.insert(call.id.as_str(), call.tool_name.as_str());
                    parts.push(Part::function_call(
                        call.tool_name.clone(),
                        Value::Object(call.arguments.clone()),
                    ));
                }
                if !parts.is_empty() {
                    contents.push(Content::new("model", parts));
                }
            }
            Role::Tool => {
                let name = msg
                    .tool_call_id
                    .as_deref()
                    .and_then(|id| call_names.get(id).copied())
                    .unwrap_or("unknown_tool");

                let response = match msg.tool_output() {
                    Some(Value::Object(map)) => Value::Object(map),
                    Some(other) => json!({ "result": other }),
                    None => json!({ "result": msg.content }),
                };
                let part = Part::function_response(name, response);

                // Results of one batch travel together in a single content.
                match contents.last_mut() {
                    Some(last)
                        if last.role.as_deref() == Some("user")
                            && last.parts.iter().all(|p| p.function_response.is_some()) =>
                    {
                        last.parts.push(part)
                    }
                    _ => contents.push(Content::new("user", vec![part])),
                }
            }
        }
    }

    contents
}

/// First candidate → assistant message.
pub(crate) fn from_response(response: GenerateContentResponse) -> Result<Message> {
    let candidate = response
        .candidates
        .into_iter()
        .next()
        .ok_or_else(|| OrchestrationError::ModelResponse("No candidates in Gemini response".to_string()))?;

    let parts = candidate.content.map(|c| c.parts).unwrap_or_default();
    if parts.is_empty() {
        return Err(OrchestrationError::ModelResponse(format!(
            "Empty Gemini response (finish reason: {})",
            candidate.finish_reason.as_deref().unwrap_or("unknown")
        )));
    }

    let mut text = String::new();
    let mut calls = Vec::new();

    for part in parts {
        if let Some(t) = part.text {
            text.push_str(&t);
        }
        if let Some(call) = part.function_call {
            let arguments = match call.args {
                Value::Object(map) => map,
                Value::Null => Map::new(),
                other => {
                    return Err(OrchestrationError::ModelResponse(format!(
                        "Arguments for {} are not an object: {}",
                        call.name, other
                    )))
                }
            };
            calls.push(ToolCallRequest::new(call.name, arguments));
        }
    }

    debug!(text_len = text.len(), calls = calls.len(), "Parsed Gemini candidate");

    Ok(if calls.is_empty() {
        Message::assistant(text.trim().to_string())
    } else {
        Message::assistant_with_tools(text.trim().to_string(), calls)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ToolCallResult;

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_tool_round_maps_to_function_parts() {
        let a = ToolCallRequest::new("fetch_price", args(json!({"ticker": "AAPL"})));
        let b = ToolCallRequest::new("fetch_price", args(json!({"ticker": "MSFT"})));

        let transcript = vec![
            Message::user("AAPL and MSFT?"),
            Message::assistant_with_tools("", vec![a.clone(), b.clone()]),
            Message::tool_result(&ToolCallResult {
                tool_call_id: a.id.clone(),
                output: json!({"success": true, "current_price": 190.0}),
            }),
            Message::tool_result(&ToolCallResult::failure(b.id.clone(), "unknown tool")),
            Message::assistant("AAPL is $190.00"),
        ];

        let contents = to_contents(&transcript);
        assert_eq!(contents.len(), 4);

        assert_eq!(contents[1].role.as_deref(), Some("model"));
        assert_eq!(contents[1].parts.len(), 2);
        assert_eq!(contents[1].parts[0].function_call.as_ref().unwrap().args["ticker"], "AAPL");

        let responses = &contents[2].parts;
        assert_eq!(responses.len(), 2);
        let first = responses[0].function_response.as_ref().unwrap();
        assert_eq!(first.name, "fetch_price");
        assert_eq!(first.response["current_price"], 190.0);
        assert_eq!(responses[1].function_response.as_ref().unwrap().response["success"], false);

        assert_eq!(contents[3].parts[0].text.as_deref(), Some("AAPL is $190.00"));
    }

    #[test]
    fn test_blank_messages_produce_no_empty_parts() {
        let transcript = vec![
            Message::user("hi"),
            Message::assistant(""),
            Message::user("  "),
            Message::assistant("Hello!"),
        ];

        let contents = to_contents(&transcript);
        assert_eq!(contents.len(), 2);
        for content in &contents {
            assert!(!content.parts.is_empty());
            for part in &content.parts {
                assert!(part.text.as_deref().map(|t| !t.trim().is_empty()).unwrap_or(true));
            }
        }
        assert_eq!(contents[1].parts[0].text.as_deref(), Some("Hello!"));
    }

    #[test]
    fn test_function_call_response_becomes_tool_request() {
        let response: GenerateContentResponse = serde_json::from_value(json!({
            "candidates": [{
                "content": {"role": "model", "parts": [
                    {"text": "Let me record that."},
                    {"functionCall": {"name": "update_portfolio",
                      "args": {"ticker": "AAPL", "shares": 10, "purchase_price": 150}}}
                ]}
            }]
        }))
        .unwrap();

        let msg = from_response(response).unwrap();
        assert_eq!(msg.role, Role::Assistant);
        assert_eq!(msg.content, "Let me record that.");
        assert_eq!(msg.tool_calls.len(), 1);
        assert_eq!(msg.tool_calls[0].tool_name, "update_portfolio");
        assert!(msg.tool_calls[0].id.starts_with("call_"));
    }

    #[test]
    fn test_empty_candidates_are_malformed() {
        let response: GenerateContentResponse = serde_json::from_value(json!({"candidates": []})).unwrap();
        let err = from_response(response).unwrap_err();
        assert!(matches!(err, OrchestrationError::ModelResponse(_)));
        assert!(!err.is_transient());
    }
}
