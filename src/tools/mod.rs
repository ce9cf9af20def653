//! Tool specs and registry
//!
//! The registry is built once at startup from a fixed list of specs and is
//! read-only afterwards. Handlers may have external side effects (records,
//! market data) but never see the transcript.

use crate::error::OrchestrationError;
use crate::models::{SessionId, ToolDescriptor};
use crate::records::{validate_ticker, RecordStore};
use crate::Result;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

pub mod market;
pub mod portfolio;

pub use market::{MarketData, Quote, StaticMarketData, YahooFinanceClient};

/// Per-call context handed to handlers.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub session_id: SessionId,
}

impl ToolContext {
    pub fn new(session_id: SessionId) -> Self {
        Self { session_id }
    }
}

/// Capability behind a tool name: arguments → structured output
#[async_trait::async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, ctx: &ToolContext, arguments: &Map<String, Value>) -> Result<Value>;
}

#[derive(Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameter_schema: Value,
    pub handler: Arc<dyn ToolHandler>,
}

impl ToolSpec {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameter_schema: Value,
        handler: Arc<dyn ToolHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameter_schema,
            handler,
        }
    }

    pub fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: self.name.clone(),
            description: self.description.clone(),
            parameter_schema: self.parameter_schema.clone(),
        }
    }
}

impl fmt::Debug for ToolSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolSpec")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// Immutable name → tool lookup
pub struct ToolRegistry {
    tools: HashMap<String, ToolSpec>,
    order: Vec<String>,
}

impl ToolRegistry {
    /// Build the registry; a repeated name is a startup error.
    pub fn new(specs: Vec<ToolSpec>) -> Result<Self> {
        let mut tools = HashMap::with_capacity(specs.len());
        let mut order = Vec::with_capacity(specs.len());

        for spec in specs {
            if tools.contains_key(&spec.name) {
                return Err(OrchestrationError::DuplicateTool(spec.name));
            }
            order.push(spec.name.clone());
            tools.insert(spec.name.clone(), spec);
        }

        Ok(Self { tools, order })
    }

    /// Default registry: market-data lookups plus portfolio and watchlist records.
    pub fn stockpulse(records: Arc<dyn RecordStore>, market: Arc<dyn MarketData>) -> Result<Self> {
        let mut specs = market::specs(market.clone());
        specs.extend(portfolio::specs(records, market));
        Self::new(specs)
    }

    pub fn get(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.get(name)
    }

    /// Descriptors in registration order, so prompts are stable across runs.
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(ToolSpec::descriptor)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Call a handler directly, outside of a turn (used by the digest job).
    pub async fn call(&self, ctx: &ToolContext, name: &str, arguments: &Map<String, Value>) -> Result<Value> {
        let spec = self
            .get(name)
            .ok_or_else(|| OrchestrationError::ToolNotFound(name.to_string()))?;
        spec.handler.call(ctx, arguments).await
    }
}

// =============================
// Argument helpers
// =============================

pub(crate) fn require_str<'a>(arguments: &'a Map<String, Value>, key: &str) -> Result<&'a str> {
    arguments
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| OrchestrationError::InvalidToolInput(format!("Expected non-empty string '{}'", key)))
}

pub(crate) fn require_ticker(arguments: &Map<String, Value>, key: &str) -> Result<String> {
    validate_ticker(require_str(arguments, key)?)
}

/// Accepts numbers and numeric strings ("10", "150.5").
pub(crate) fn require_f64(arguments: &Map<String, Value>, key: &str) -> Result<f64> {
    let value = arguments
        .get(key)
        .ok_or_else(|| OrchestrationError::InvalidToolInput(format!("Missing number '{}'", key)))?;

    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().trim_start_matches('$').parse::<f64>().ok(),
        _ => None,
    };

    parsed
        .filter(|v| v.is_finite())
        .ok_or_else(|| OrchestrationError::InvalidToolInput(format!("'{}' must be a number", key)))
}

pub(crate) fn require_str_list(arguments: &Map<String, Value>, key: &str) -> Result<Vec<String>> {
    let items = arguments
        .get(key)
        .and_then(Value::as_array)
        .ok_or_else(|| OrchestrationError::InvalidToolInput(format!("Expected array '{}'", key)))?;

    let list: Vec<String> = items
        .iter()
        .filter_map(Value::as_str)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    if list.is_empty() {
        return Err(OrchestrationError::InvalidToolInput(format!("'{}' must not be empty", key)));
    }
    Ok(list)
}

pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
