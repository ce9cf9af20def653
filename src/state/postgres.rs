//! Postgres-backed checkpoints
//!
//! One row per message, ordered by `seq` within a session. Saves only insert
//! rows past the stored length, so a transcript can grow but never shrink.

use crate::error::OrchestrationError;
use crate::memory::Transcript;
use crate::models::{Message, Role, SessionId, ToolCallRequest};
use crate::state::CheckpointBackend;
use crate::Result;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::info;

pub struct PostgresCheckpointBackend {
    pool: PgPool,
    schema_ready: Arc<OnceCell<()>>,
}

fn checkpoint_error(context: &str, e: sqlx::Error) -> OrchestrationError {
    OrchestrationError::CheckpointError(format!("{}: {}", context, e))
}

impl PostgresCheckpointBackend {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            schema_ready: Arc::new(OnceCell::new()),
        }
    }

    /// Build a lazily connecting pool; nothing touches the network until first use.
    pub fn connect_lazy(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(database_url)
            .map_err(|e| checkpoint_error("Invalid checkpoint database url", e))?;
        info!("Checkpoint backend: postgres");
        Ok(Self::new(pool))
    }

    async fn ensure_schema(&self) -> Result<()> {
        self.schema_ready
            .get_or_try_init(|| async {
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS conversation_messages (
                      message_id UUID PRIMARY KEY,
                      session_id TEXT NOT NULL,
                      seq INTEGER NOT NULL,
                      role TEXT NOT NULL,
                      content TEXT NOT NULL,
                      tool_calls TEXT,
                      tool_call_id TEXT,
                      created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                      UNIQUE (session_id, seq)
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;

                Ok::<(), sqlx::Error>(())
            })
            .await
            .map_err(|e| checkpoint_error("Failed to initialize checkpoint schema", e))?;

        Ok(())
    }

    fn row_to_message(row: &sqlx::postgres::PgRow) -> Result<Message> {
        let role: String = row
            .try_get("role")
            .map_err(|e| checkpoint_error("Missing role column", e))?;
        let role = Role::parse(&role).ok_or_else(|| {
            OrchestrationError::CheckpointError(format!("Unknown message role '{}'", role))
        })?;

        let tool_calls: Option<String> = row
            .try_get("tool_calls")
            .map_err(|e| checkpoint_error("Missing tool_calls column", e))?;
        let tool_calls: Vec<ToolCallRequest> = match tool_calls {
            Some(raw) if !raw.is_empty() => serde_json::from_str(&raw)?,
            _ => Vec::new(),
        };

        Ok(Message {
            message_id: row
                .try_get("message_id")
                .map_err(|e| checkpoint_error("Missing message_id column", e))?,
            role,
            content: row
                .try_get("content")
                .map_err(|e| checkpoint_error("Missing content column", e))?,
            tool_calls,
            tool_call_id: row
                .try_get("tool_call_id")
                .map_err(|e| checkpoint_error("Missing tool_call_id column", e))?,
            created_at: row
                .try_get("created_at")
                .map_err(|e| checkpoint_error("Missing created_at column", e))?,
        })
    }
}

#[async_trait::async_trait]
impl CheckpointBackend for PostgresCheckpointBackend {
    async fn load(&self, session_id: &SessionId) -> Result<Option<Transcript>> {
        self.ensure_schema().await?;

        let rows = sqlx::query(
            r#"
            SELECT message_id, role, content, tool_calls, tool_call_id, created_at
            FROM conversation_messages
            WHERE session_id = $1
            ORDER BY seq ASC
            "#,
        )
        .bind(session_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| checkpoint_error("Failed to load transcript", e))?;

        if rows.is_empty() {
            return Ok(None);
        }

        let messages = rows
            .iter()
            .map(Self::row_to_message)
            .collect::<Result<Vec<_>>>()?;

        Ok(Some(Transcript::from_messages(session_id.clone(), messages)))
    }

    async fn save(&self, session_id: &SessionId, transcript: &Transcript) -> Result<()> {
        self.ensure_schema().await?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| checkpoint_error("Failed to begin checkpoint transaction", e))?;

        let stored: i64 = sqlx::query(
            "SELECT COUNT(*) AS stored FROM conversation_messages WHERE session_id = $1",
        )
        .bind(session_id.as_str())
        .fetch_one(&mut *tx)
        .await
        .and_then(|row| row.try_get("stored"))
        .map_err(|e| checkpoint_error("Failed to count stored messages", e))?;

        let stored = stored.max(0) as usize;
        if stored > transcript.len() {
            return Err(OrchestrationError::CheckpointError(format!(
                "Refusing to truncate transcript from {} to {} messages",
                stored,
                transcript.len()
            )));
        }

        for (seq, msg) in transcript.messages().iter().enumerate().skip(stored) {
            let tool_calls = if msg.tool_calls.is_empty() {
                None
            } else {
                Some(serde_json::to_string(&msg.tool_calls)?)
            };

            sqlx::query(
                r#"
                INSERT INTO conversation_messages
                  (message_id, session_id, seq, role, content, tool_calls, tool_call_id, created_at)
                VALUES
                  ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(msg.message_id)
            .bind(session_id.as_str())
            .bind(seq as i32)
            .bind(msg.role.as_str())
            .bind(&msg.content)
            .bind(tool_calls)
            .bind(&msg.tool_call_id)
            .bind(msg.created_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| checkpoint_error("Failed to insert transcript message", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| checkpoint_error("Failed to commit checkpoint transaction", e))?;

        Ok(())
    }

    async fn sessions(&self) -> Result<Vec<SessionId>> {
        self.ensure_schema().await?;

        let rows = sqlx::query(
            "SELECT DISTINCT session_id FROM conversation_messages ORDER BY session_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| checkpoint_error("Failed to list sessions", e))?;

        rows.iter()
            .map(|row| {
                let id: String = row
                    .try_get("session_id")
                    .map_err(|e| checkpoint_error("Missing session_id column", e))?;
                SessionId::new(id)
            })
            .collect()
    }
}
