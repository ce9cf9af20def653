//! Agent: the inbound turn interface
//!
//! Owns everything a turn needs (graph executor, registry, records) and is
//! built once at startup. `handle_incoming` serializes turns per session in
//! arrival order and turns any fatal failure into one fallback reply.

use crate::config::Settings;
use crate::error::OrchestrationError;
use crate::execution::ToolExecutor;
use crate::gemini::GeminiClient;
use crate::graph::GraphExecutor;
use crate::model::{GeminiModel, ModelAdapter};
use crate::models::SessionId;
use crate::records::{InMemoryRecordStore, PostgresRecordStore, RecordStore};
use crate::state::{CheckpointStore, PostgresCheckpointBackend};
use crate::tools::{MarketData, ToolRegistry, YahooFinanceClient};
use crate::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// The only reply a user ever sees for a failed turn.
pub const FALLBACK_REPLY: &str = "Sorry, I encountered an error. Please try again later.";

pub const EMPTY_MESSAGE_REPLY: &str =
    "Send me a message about your stocks, for example \"What's AAPL at?\" or \"Buy 10 AAPL at 150\".";

pub struct Agent {
    graph: Arc<GraphExecutor>,
    registry: Arc<ToolRegistry>,
    records: Arc<dyn RecordStore>,
    turn_timeout: Duration,
}

impl Agent {
    /// Wire an agent from already-built parts.
    pub fn assemble(
        settings: &Settings,
        model: Arc<dyn ModelAdapter>,
        records: Arc<dyn RecordStore>,
        market: Arc<dyn MarketData>,
        store: Arc<CheckpointStore>,
    ) -> Result<Self> {
        let registry = Arc::new(ToolRegistry::stockpulse(records.clone(), market)?);
        let tools = Arc::new(ToolExecutor::new(registry.clone(), settings.tool_timeout));
        let graph = Arc::new(GraphExecutor::new(store, model, tools, settings.max_tool_rounds));

        info!(
            tools = registry.len(),
            max_tool_rounds = settings.max_tool_rounds,
            "Agent initialized"
        );

        Ok(Self {
            graph,
            registry,
            records,
            turn_timeout: settings.turn_timeout,
        })
    }

    /// Production wiring: Gemini, Yahoo Finance, Postgres when a database URL is set.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let (store, records): (Arc<CheckpointStore>, Arc<dyn RecordStore>) = match &settings.database_url {
            Some(url) => (
                Arc::new(CheckpointStore::new(Arc::new(PostgresCheckpointBackend::connect_lazy(url)?))),
                Arc::new(PostgresRecordStore::connect_lazy(url)?),
            ),
            None => {
                warn!("No database configured; conversations and records are kept in memory");
                (
                    Arc::new(CheckpointStore::in_memory()),
                    Arc::new(InMemoryRecordStore::new()),
                )
            }
        };

        let api_key = settings
            .gemini_api_key
            .clone()
            .ok_or_else(|| OrchestrationError::ConfigError("GEMINI_API_KEY not configured".to_string()))?;
        let client = GeminiClient::new(
            api_key,
            &settings.gemini_model,
            settings.model_timeout,
            settings.model_temperature,
        )?;
        let model: Arc<dyn ModelAdapter> = Arc::new(GeminiModel::new(client, settings.retry.clone()));
        let market: Arc<dyn MarketData> = Arc::new(YahooFinanceClient::new()?);

        Self::assemble(settings, model, records, market, store)
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn records(&self) -> &Arc<dyn RecordStore> {
        &self.records
    }

    pub fn store(&self) -> &Arc<CheckpointStore> {
        self.graph.store()
    }

    /// Sessions with a turn running or queued.
    pub fn active_sessions(&self) -> usize {
        self.graph.active_sessions()
    }

    /// Inbound turn interface: raw address + text in, reply text out. Never fails.
    pub async fn handle_incoming(&self, address: &str, text: &str) -> String {
        if text.trim().is_empty() {
            return EMPTY_MESSAGE_REPLY.to_string();
        }

        let session_id = match SessionId::from_address(address) {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "Rejected message without a usable sender address");
                return FALLBACK_REPLY.to_string();
            }
        };

        match self.run_turn(&session_id, text).await {
            Ok(reply) => reply,
            Err(e) => {
                error!(session = %session_id.log_key(), error = %e, "Turn failed");
                FALLBACK_REPLY.to_string()
            }
        }
    }

    /// Run one turn behind the session's turn lock.
    ///
    /// The turn itself runs on its own task, so a caller that goes away while
    /// waiting does not abort the state machine midway; the task still
    /// finishes, persists, and releases the lock.
    pub async fn run_turn(&self, session_id: &SessionId, text: &str) -> Result<String> {
        let guard = self.graph.lock_turn(session_id).await;

        let graph = self.graph.clone();
        let id = session_id.clone();
        let text = text.to_string();
        let turn_timeout = self.turn_timeout;

        let handle = tokio::spawn(async move {
            let started = Instant::now();

            let cancel = CancellationToken::new();
            let deadline = {
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(turn_timeout).await;
                    cancel.cancel();
                })
            };

            let result = graph.run_locked(guard, &id, &text, cancel).await;
            deadline.abort();

            info!(
                session = %id.log_key(),
                ok = result.is_ok(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Turn finished"
            );
            result
        });

        handle
            .await
            .map_err(|e| OrchestrationError::Internal(format!("turn task failed: {}", e)))?
    }
}
