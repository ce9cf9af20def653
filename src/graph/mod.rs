//! Graph executor: the per-turn model ↔ tool state machine
//!
//! AwaitingModel → AwaitingTools → AwaitingModel → ... → Done
//!
//! Turns for one session are serialized in arrival order by a per-session
//! turn lock held from transcript load to final append.
//!
//! Messages produced during a turn are buffered and appended to the
//! checkpoint store once, when the turn ends. A failed turn therefore
//! persists nothing, except on cancellation where tool effects may already
//! be committed and the turn is stored with every open call answered.

use crate::error::OrchestrationError;
use crate::execution::ToolExecutor;
use crate::model::ModelAdapter;
use crate::models::{Message, Role, SessionId, ToolCallRequest, ToolCallResult};
use crate::router::{Route, TurnRouter};
use crate::state::{CheckpointStore, SessionGuard, SessionLocks};
use crate::tools::ToolContext;
use crate::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default cap on model ↔ tool round trips per turn
pub const DEFAULT_MAX_TOOL_ROUNDS: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    AwaitingModel,
    AwaitingTools,
    Done,
}

pub struct GraphExecutor {
    store: Arc<CheckpointStore>,
    model: Arc<dyn ModelAdapter>,
    tools: Arc<ToolExecutor>,
    max_rounds: u32,
    turn_locks: SessionLocks,
}

impl GraphExecutor {
    pub fn new(
        store: Arc<CheckpointStore>,
        model: Arc<dyn ModelAdapter>,
        tools: Arc<ToolExecutor>,
        max_rounds: u32,
    ) -> Self {
        Self {
            store,
            model,
            tools,
            max_rounds: max_rounds.max(1),
            turn_locks: SessionLocks::new(),
        }
    }

    pub fn store(&self) -> &Arc<CheckpointStore> {
        &self.store
    }

    pub fn tools(&self) -> &Arc<ToolExecutor> {
        &self.tools
    }

    pub fn max_rounds(&self) -> u32 {
        self.max_rounds
    }

    /// Run one turn to completion and return the final assistant text.
    pub async fn run(&self, session_id: &SessionId, user_text: &str) -> Result<String> {
        self.run_with_cancel(session_id, user_text, CancellationToken::new())
            .await
    }

    /// Same as `run`, but stops at the next suspension point once `cancel` fires.
    pub async fn run_with_cancel(
        &self,
        session_id: &SessionId,
        user_text: &str,
        cancel: CancellationToken,
    ) -> Result<String> {
        let guard = self.lock_turn(session_id).await;
        self.run_locked(guard, session_id, user_text, cancel).await
    }

    /// Wait for the session's turn slot. Callers queue in arrival order.
    pub(crate) async fn lock_turn(&self, session_id: &SessionId) -> SessionGuard {
        self.turn_locks.acquire(session_id).await
    }

    /// Sessions with a turn running or queued.
    pub fn active_sessions(&self) -> usize {
        self.turn_locks.len()
    }

    /// Run a turn while holding the session's turn slot from `lock_turn`.
    pub(crate) async fn run_locked(
        &self,
        _turn: SessionGuard,
        session_id: &SessionId,
        user_text: &str,
        cancel: CancellationToken,
    ) -> Result<String> {
        let text = user_text.trim();
        if text.is_empty() {
            return Err(OrchestrationError::InvalidInput("user text must not be empty".to_string()));
        }

        // A store failure here aborts the turn; never continue on an empty history.
        let transcript = self.store.load_or_create(session_id).await?;

        let mut history: Vec<Message> = transcript.messages().to_vec();
        let turn_start = history.len();
        history.push(Message::user(text));

        let ctx = ToolContext::new(session_id.clone());
        let descriptors = self.tools.registry().descriptors();

        let mut state = TurnState::AwaitingModel;
        let mut rounds: u32 = 0;
        let mut pending: Vec<ToolCallRequest> = Vec::new();
        let mut reply = String::new();

        debug!(
            session = %session_id.log_key(),
            history = turn_start,
            "Turn started"
        );

        while state != TurnState::Done {
            match state {
                TurnState::AwaitingModel => {
                    let message = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            return self.abandon(session_id, history, turn_start, &pending).await;
                        }
                        result = self.model.invoke(session_id, &history, &descriptors) => result?,
                    };

                    if message.role != Role::Assistant {
                        return Err(OrchestrationError::ModelResponse(format!(
                            "model returned a {} message",
                            message.role.as_str()
                        )));
                    }

                    match TurnRouter::decide(&message) {
                        Route::ContinueWithTools => {
                            if rounds >= self.max_rounds {
                                warn!(
                                    session = %session_id.log_key(),
                                    rounds,
                                    "Model still requesting tools at the round cap"
                                );
                                return Err(OrchestrationError::LoopLimitExceeded { rounds });
                            }
                            rounds += 1;
                            pending = message.tool_calls.clone();
                            history.push(message);
                            state = TurnState::AwaitingTools;
                        }
                        Route::Finish => {
                            if message.content.trim().is_empty() {
                                return Err(OrchestrationError::ModelResponse(
                                    "model finished with an empty reply".to_string(),
                                ));
                            }
                            reply = message.content.clone();
                            history.push(message);
                            state = TurnState::Done;
                        }
                    }
                }
                TurnState::AwaitingTools => {
                    debug!(
                        session = %session_id.log_key(),
                        round = rounds,
                        calls = pending.len(),
                        "Executing tool batch"
                    );

                    let results = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            return self.abandon(session_id, history, turn_start, &pending).await;
                        }
                        results = self.tools.execute(&ctx, &pending) => results,
                    };

                    history.extend(results.iter().map(Message::tool_result));
                    pending.clear();
                    state = TurnState::AwaitingModel;
                }
                TurnState::Done => {}
            }
        }

        let produced = history.split_off(turn_start);
        let count = produced.len();
        self.store.append(session_id, produced).await?;

        info!(
            session = %session_id.log_key(),
            rounds,
            messages = count,
            "Turn complete"
        );

        Ok(reply)
    }

    /// Close out a cancelled turn. Outstanding calls get a synthetic failure so
    /// the stored transcript never holds an unanswered request. A turn that
    /// never reached a tool is dropped, since nothing external happened.
    async fn abandon(
        &self,
        session_id: &SessionId,
        mut history: Vec<Message>,
        turn_start: usize,
        pending: &[ToolCallRequest],
    ) -> Result<String> {
        history.extend(
            pending
                .iter()
                .map(|call| Message::tool_result(&ToolCallResult::failure(&call.id, "cancelled"))),
        );

        let produced = history.split_off(turn_start);
        let reached_tools = produced.iter().any(|m| m.has_tool_calls());

        warn!(
            session = %session_id.log_key(),
            outstanding = pending.len(),
            persisted = reached_tools,
            "Turn cancelled"
        );

        if reached_tools {
            self.store.append(session_id, produced).await?;
        }

        Err(OrchestrationError::Cancelled(
            "turn cancelled before completion".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Transcript;
    use crate::model::ScriptedModel;
    use crate::records::{InMemoryRecordStore, RecordStore};
    use crate::state::CheckpointBackend;
    use crate::tools::{StaticMarketData, ToolHandler, ToolRegistry, ToolSpec};
    use serde_json::{json, Map, Value};
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    fn sid(s: &str) -> SessionId {
        SessionId::new(s).unwrap()
    }

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn buy_call() -> ToolCallRequest {
        ToolCallRequest::new(
            "update_portfolio",
            args(json!({"ticker": "AAPL", "shares": 10, "purchase_price": 150})),
        )
    }

    struct Harness {
        graph: GraphExecutor,
        model: Arc<ScriptedModel>,
        store: Arc<CheckpointStore>,
        records: Arc<InMemoryRecordStore>,
    }

    fn harness(model: ScriptedModel, max_rounds: u32) -> Harness {
        harness_with(model, max_rounds, Arc::new(CheckpointStore::in_memory()))
    }

    fn harness_with(model: ScriptedModel, max_rounds: u32, store: Arc<CheckpointStore>) -> Harness {
        let records = Arc::new(InMemoryRecordStore::new());
        let registry = ToolRegistry::stockpulse(records.clone(), Arc::new(StaticMarketData::new())).unwrap();
        let tools = Arc::new(ToolExecutor::new(Arc::new(registry), Duration::from_secs(5)));
        let model = Arc::new(model);
        let graph = GraphExecutor::new(store.clone(), model.clone(), tools, max_rounds);
        Harness {
            graph,
            model,
            store,
            records,
        }
    }

    #[tokio::test]
    async fn test_purchase_turn_appends_four_messages() {
        let h = harness(
            ScriptedModel::new(vec![
                Message::assistant_with_tools("", vec![buy_call()]),
                Message::assistant("Added 10 shares of AAPL at $150.00 to your portfolio 📈"),
            ]),
            DEFAULT_MAX_TOOL_ROUNDS,
        );
        let id = sid("+15551234567");

        let reply = h.graph.run(&id, "Buy 10 AAPL at 150").await.unwrap();
        assert_eq!(reply, "Added 10 shares of AAPL at $150.00 to your portfolio 📈");

        let transcript = h.store.load_or_create(&id).await.unwrap();
        let roles: Vec<Role> = transcript.messages().iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]);
        assert_eq!(transcript.messages()[2].tool_output().unwrap()["success"], true);
        assert!(transcript.unanswered_calls().is_empty());

        // The model saw the user message, then user + call + result.
        assert_eq!(h.model.transcript_lengths(), vec![1, 3]);

        let holdings = h.records.holdings(&id).await.unwrap();
        assert_eq!(holdings[0].ticker, "AAPL");
        assert_eq!(holdings[0].shares, 10.0);
    }

    #[tokio::test]
    async fn test_plain_reply_takes_one_model_call() {
        let h = harness(ScriptedModel::new(vec![Message::assistant("Hello!")]), 6);
        let reply = h.graph.run(&sid("+1"), "hi").await;

        assert_eq!(assert_ok!(reply), "Hello!");
        assert_eq!(h.model.invocations(), 1);
        assert_eq!(h.store.load_or_create(&sid("+1")).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_endless_tool_requests_hit_round_cap() {
        let template = Message::assistant_with_tools("", vec![ToolCallRequest::new("get_portfolio", Map::new())]);
        let h = harness(ScriptedModel::repeating(template), 3);
        let id = sid("+1");

        let err = h.graph.run(&id, "show my portfolio").await.unwrap_err();
        assert!(matches!(err, OrchestrationError::LoopLimitExceeded { rounds: 3 }));
        assert_eq!(h.model.invocations(), 4);

        // Fatal: nothing from the turn is stored.
        assert!(h.store.load_or_create(&id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_model_failure_persists_nothing() {
        let h = harness(
            ScriptedModel::from_results(vec![
                Ok(Message::assistant_with_tools("", vec![buy_call()])),
                Err(OrchestrationError::ModelTransport("connection reset".to_string())),
            ]),
            6,
        );
        let id = sid("+1");

        let err = assert_err!(h.graph.run(&id, "Buy 10 AAPL at 150").await);
        assert!(matches!(err, OrchestrationError::ModelTransport(_)));
        assert!(h.store.load_or_create(&id).await.unwrap().is_empty());
    }

    struct BrokenBackend;

    #[async_trait::async_trait]
    impl CheckpointBackend for BrokenBackend {
        async fn load(&self, _session_id: &SessionId) -> Result<Option<Transcript>> {
            Err(OrchestrationError::CheckpointError("disk unavailable".to_string()))
        }
        async fn save(&self, _session_id: &SessionId, _transcript: &Transcript) -> Result<()> {
            Err(OrchestrationError::CheckpointError("disk unavailable".to_string()))
        }
        async fn sessions(&self) -> Result<Vec<SessionId>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_checkpoint_failure_is_fatal() {
        let store = Arc::new(CheckpointStore::new(Arc::new(BrokenBackend)));
        let h = harness_with(ScriptedModel::new(vec![Message::assistant("unused")]), 6, store);

        let err = h.graph.run(&sid("+1"), "hi").await.unwrap_err();
        assert!(matches!(err, OrchestrationError::CheckpointError(_)));
        assert_eq!(h.model.invocations(), 0);
    }

    #[tokio::test]
    async fn test_sessions_do_not_share_history() {
        let h = harness(
            ScriptedModel::new(vec![
                Message::assistant("first"),
                Message::assistant("second"),
                Message::assistant("third"),
            ]),
            6,
        );

        h.graph.run(&sid("+1"), "one").await.unwrap();
        h.graph.run(&sid("+2"), "two").await.unwrap();
        h.graph.run(&sid("+1"), "three").await.unwrap();

        let one = h.store.load_or_create(&sid("+1")).await.unwrap();
        let two = h.store.load_or_create(&sid("+2")).await.unwrap();
        let one_text: Vec<&str> = one.messages().iter().map(|m| m.content.as_str()).collect();
        let two_text: Vec<&str> = two.messages().iter().map(|m| m.content.as_str()).collect();

        assert_eq!(one_text, vec!["one", "first", "three", "third"]);
        assert_eq!(two_text, vec!["two", "second"]);
        // Third call saw only session one's history plus the new message.
        assert_eq!(h.model.transcript_lengths(), vec![1, 1, 3]);
    }

    #[tokio::test]
    async fn test_empty_final_reply_persists_nothing() {
        let h = harness(ScriptedModel::new(vec![Message::assistant("  ")]), 6);
        let id = sid("+1");

        let err = h.graph.run(&id, "hi").await.unwrap_err();
        assert!(matches!(err, OrchestrationError::ModelResponse(_)));
        assert!(h.store.load_or_create(&id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_runs_are_serialized_in_arrival_order() {
        let h = harness(
            ScriptedModel::new(vec![Message::assistant("re:one"), Message::assistant("re:two")])
                .with_delay(Duration::from_millis(100)),
            6,
        );
        let graph = Arc::new(h.graph);
        let id = sid("+1");

        let first = {
            let graph = graph.clone();
            let id = id.clone();
            tokio::spawn(async move { graph.run(&id, "one").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = graph.run(&id, "two").await.unwrap();

        assert_eq!(first.await.unwrap().unwrap(), "re:one");
        assert_eq!(second, "re:two");
        // The second turn saw the whole first turn.
        assert_eq!(h.model.transcript_lengths(), vec![1, 3]);

        let stored = h.store.load_or_create(&id).await.unwrap();
        let text: Vec<&str> = stored.messages().iter().map(|m| m.content.as_str()).collect();
        assert_eq!(text, vec!["one", "re:one", "two", "re:two"]);
        assert_eq!(graph.active_sessions(), 0);
    }

    #[tokio::test]
    async fn test_empty_text_is_rejected() {
        let h = harness(ScriptedModel::new(vec![]), 6);
        let err = h.graph.run(&sid("+1"), "   ").await.unwrap_err();
        assert!(matches!(err, OrchestrationError::InvalidInput(_)));
    }

    struct Hang;

    #[async_trait::async_trait]
    impl ToolHandler for Hang {
        async fn call(&self, _ctx: &ToolContext, _arguments: &Map<String, Value>) -> Result<Value> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(json!({}))
        }
    }

    #[tokio::test]
    async fn test_cancel_during_tools_answers_every_call() {
        let registry = ToolRegistry::new(vec![ToolSpec::new(
            "hang",
            "never finishes",
            json!({"type": "object"}),
            Arc::new(Hang),
        )])
        .unwrap();
        let tools = Arc::new(ToolExecutor::new(Arc::new(registry), Duration::from_secs(120)));
        let store = Arc::new(CheckpointStore::in_memory());
        let model = Arc::new(ScriptedModel::new(vec![Message::assistant_with_tools(
            "",
            vec![ToolCallRequest::new("hang", Map::new()), ToolCallRequest::new("hang", Map::new())],
        )]));
        let graph = GraphExecutor::new(store.clone(), model, tools, 6);

        let id = sid("+1");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = graph.run_with_cancel(&id, "wait", cancel).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::Cancelled(_)));

        let transcript = store.load_or_create(&id).await.unwrap();
        assert_eq!(transcript.len(), 4);
        assert!(transcript.unanswered_calls().is_empty());
        assert_eq!(transcript.messages()[3].tool_output().unwrap()["error"], "cancelled");
    }

    #[tokio::test]
    async fn test_cancel_before_any_tool_drops_turn() {
        let h = harness(
            ScriptedModel::new(vec![Message::assistant("late")]).with_delay(Duration::from_secs(30)),
            6,
        );
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = h.graph.run_with_cancel(&sid("+1"), "hi", cancel).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::Cancelled(_)));
        assert!(h.store.load_or_create(&sid("+1")).await.unwrap().is_empty());
    }
}
