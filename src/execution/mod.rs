//! Tool executor
//!
//! Runs every tool call an assistant message requested and returns exactly
//! one result per call, in request order. Failures never escape as errors:
//! they become `success: false` outputs the model can read.

use crate::models::{ToolCallRequest, ToolCallResult};
use crate::tools::{ToolContext, ToolRegistry};
use futures_util::future::join_all;
use futures_util::FutureExt;
use serde_json::{json, Value};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{error, info, warn};

const ARGS_PREVIEW_LIMIT: usize = 200;

pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Execute all calls concurrently. The output has the same length and order as `calls`.
    pub async fn execute(&self, ctx: &ToolContext, calls: &[ToolCallRequest]) -> Vec<ToolCallResult> {
        join_all(calls.iter().map(|call| self.execute_one(ctx, call))).await
    }

    async fn execute_one(&self, ctx: &ToolContext, call: &ToolCallRequest) -> ToolCallResult {
        let start = Instant::now();

        let Some(spec) = self.registry.get(&call.tool_name) else {
            warn!(
                session = %ctx.session_id.log_key(),
                tool = %call.tool_name,
                "Model requested an unregistered tool"
            );
            return ToolCallResult::failure(&call.id, "unknown tool");
        };

        // A panicking handler fails its own call, never the batch.
        let handler = AssertUnwindSafe(spec.handler.call(ctx, &call.arguments)).catch_unwind();
        let result = timeout(self.timeout, handler).await;

        let (outcome, output) = match result {
            Ok(Ok(Ok(value))) => ("ok", normalize_output(value)),
            Ok(Ok(Err(e))) => {
                warn!(tool = %call.tool_name, error = %e, "Tool execution failed");
                ("error", json!({ "success": false, "error": e.to_string() }))
            }
            Ok(Err(_)) => {
                error!(tool = %call.tool_name, "Tool handler panicked");
                ("panic", json!({ "success": false, "error": "tool panicked" }))
            }
            Err(_) => ("timeout", json!({ "success": false, "error": "tool timed out" })),
        };

        let audit = json!({
            "event": "tool_audit",
            "session": ctx.session_id.log_key(),
            "tool": call.tool_name,
            "call_id": call.id,
            "outcome": outcome,
            "success": output.get("success").and_then(Value::as_bool).unwrap_or(false),
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview(&Value::Object(call.arguments.clone())),
        });
        info!(audit = %audit, "tool");

        ToolCallResult {
            tool_call_id: call.id.clone(),
            output,
        }
    }
}

/// Objects keep their own `success` flag (defaulting to true); anything else is wrapped.
fn normalize_output(value: Value) -> Value {
    match value {
        Value::Object(mut map) => {
            map.entry("success").or_insert(Value::Bool(true));
            Value::Object(map)
        }
        other => json!({ "success": true, "data": other }),
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > ARGS_PREVIEW_LIMIT {
        format!("{}...", s.chars().take(ARGS_PREVIEW_LIMIT).collect::<String>())
    } else {
        s
    }
}
