//! Checkpoint persistence layer
//!
//! Maps a session id to its transcript. The backend decides where the
//! transcript lives (memory or Postgres); the store adds per-session
//! serialization on top so concurrent appends never lose updates.

use crate::memory::Transcript;
use crate::models::{Message, SessionId};
use crate::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

pub mod locks;
pub mod postgres;

pub use locks::{SessionGuard, SessionLocks};
pub use postgres::PostgresCheckpointBackend;

/// Persistence interface for checkpoints
#[async_trait::async_trait]
pub trait CheckpointBackend: Send + Sync {
    async fn load(&self, session_id: &SessionId) -> Result<Option<Transcript>>;
    async fn save(&self, session_id: &SessionId, transcript: &Transcript) -> Result<()>;
    async fn sessions(&self) -> Result<Vec<SessionId>>;
}

/// In-memory checkpoint backend (volatile, lost on restart)
pub struct InMemoryCheckpointBackend {
    transcripts: Arc<RwLock<HashMap<SessionId, Transcript>>>,
}

impl InMemoryCheckpointBackend {
    pub fn new() -> Self {
        Self {
            transcripts: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryCheckpointBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl CheckpointBackend for InMemoryCheckpointBackend {
    async fn load(&self, session_id: &SessionId) -> Result<Option<Transcript>> {
        let transcripts = self.transcripts.read().await;
        Ok(transcripts.get(session_id).cloned())
    }

    async fn save(&self, session_id: &SessionId, transcript: &Transcript) -> Result<()> {
        let mut transcripts = self.transcripts.write().await;
        transcripts.insert(session_id.clone(), transcript.clone());
        Ok(())
    }

    async fn sessions(&self) -> Result<Vec<SessionId>> {
        let transcripts = self.transcripts.read().await;
        let mut ids: Vec<SessionId> = transcripts.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

/// Session-id → transcript store with atomic, per-session ordered appends
pub struct CheckpointStore {
    backend: Arc<dyn CheckpointBackend>,
    locks: SessionLocks,
}

impl CheckpointStore {
    pub fn new(backend: Arc<dyn CheckpointBackend>) -> Self {
        Self {
            backend,
            locks: SessionLocks::new(),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryCheckpointBackend::new()))
    }

    /// Return the session's transcript, creating an empty one on first contact.
    pub async fn load_or_create(&self, session_id: &SessionId) -> Result<Transcript> {
        if let Some(transcript) = self.backend.load(session_id).await? {
            return Ok(transcript);
        }

        let _guard = self.locks.acquire(session_id).await;

        // Another caller may have created it while we waited.
        if let Some(transcript) = self.backend.load(session_id).await? {
            return Ok(transcript);
        }

        let transcript = Transcript::new(session_id.clone());
        self.backend.save(session_id, &transcript).await?;
        debug!(session = %session_id.log_key(), "Created transcript");
        Ok(transcript)
    }

    /// Extend the stored transcript with `messages`, serialized per session.
    pub async fn append(&self, session_id: &SessionId, messages: Vec<Message>) -> Result<Transcript> {
        let _guard = self.locks.acquire(session_id).await;

        let mut transcript = self
            .backend
            .load(session_id)
            .await?
            .unwrap_or_else(|| Transcript::new(session_id.clone()));

        let appended = messages.len();
        transcript.append(messages);
        self.backend.save(session_id, &transcript).await?;

        debug!(
            session = %session_id.log_key(),
            appended,
            total = transcript.len(),
            "Transcript appended"
        );

        Ok(transcript)
    }

    pub async fn sessions(&self) -> Result<Vec<SessionId>> {
        self.backend.sessions().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;

    fn sid(s: &str) -> SessionId {
        SessionId::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_load_or_create_is_empty_then_stable() {
        let store = CheckpointStore::in_memory();
        let first = store.load_or_create(&sid("+1")).await.unwrap();
        assert!(first.is_empty());

        let again = store.load_or_create(&sid("+1")).await.unwrap();
        assert_eq!(again.created_at, first.created_at);
        assert_eq!(store.sessions().await.unwrap(), vec![sid("+1")]);
    }

    #[tokio::test]
    async fn test_append_round_trip_suffix() {
        let store = CheckpointStore::in_memory();
        let id = sid("+1");
        store.append(&id, vec![Message::user("earlier")]).await.unwrap();

        let batch = vec![Message::user("Buy 10 AAPL at 150"), Message::assistant("Done")];
        store.append(&id, batch.clone()).await.unwrap();

        let loaded = store.load_or_create(&id).await.unwrap();
        let suffix = &loaded.messages()[loaded.len() - batch.len()..];
        assert_eq!(suffix, batch.as_slice());
    }

    #[tokio::test]
    async fn test_concurrent_appends_lose_nothing() {
        let store = Arc::new(CheckpointStore::in_memory());
        let id = sid("+1");

        let mut handles = Vec::new();
        for i in 0..25 {
            let store = store.clone();
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                store
                    .append(&id, vec![Message::user(format!("q{}", i)), Message::assistant(format!("a{}", i))])
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let transcript = store.load_or_create(&id).await.unwrap();
        assert_eq!(transcript.len(), 50);

        // Each batch stays contiguous: every user message is followed by its answer.
        for pair in transcript.messages().chunks(2) {
            assert_eq!(pair[0].role, Role::User);
            assert_eq!(pair[1].role, Role::Assistant);
            assert_eq!(pair[0].content[1..], pair[1].content[1..]);
        }
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let store = CheckpointStore::in_memory();
        store.append(&sid("+1"), vec![Message::user("mine")]).await.unwrap();
        store.append(&sid("+2"), vec![Message::user("theirs")]).await.unwrap();

        let one = store.load_or_create(&sid("+1")).await.unwrap();
        assert_eq!(one.len(), 1);
        assert_eq!(one.messages()[0].content, "mine");
    }
}
