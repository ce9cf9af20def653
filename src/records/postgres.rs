//! Postgres-backed holdings and watchlist

use crate::error::OrchestrationError;
use crate::models::SessionId;
use crate::records::{normalize_ticker, Holding, RecordStore};
use crate::Result;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::info;

pub struct PostgresRecordStore {
    pool: PgPool,
    schema_ready: Arc<OnceCell<()>>,
}

fn db_error(context: &str, e: sqlx::Error) -> OrchestrationError {
    OrchestrationError::DatabaseError(format!("{}: {}", context, e))
}

impl PostgresRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            schema_ready: Arc::new(OnceCell::new()),
        }
    }

    pub fn connect_lazy(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(database_url)
            .map_err(|e| db_error("Invalid records database url", e))?;
        info!("Record store backend: postgres");
        Ok(Self::new(pool))
    }

    async fn ensure_schema(&self) -> Result<()> {
        self.schema_ready
            .get_or_try_init(|| async {
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS user_portfolio (
                      session_id TEXT NOT NULL,
                      ticker TEXT NOT NULL,
                      shares DOUBLE PRECISION NOT NULL,
                      purchase_price DOUBLE PRECISION NOT NULL,
                      updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                      PRIMARY KEY (session_id, ticker)
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS watchlist (
                      session_id TEXT NOT NULL,
                      ticker TEXT NOT NULL,
                      added_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                      PRIMARY KEY (session_id, ticker)
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS digest_subscribers (
                      session_id TEXT PRIMARY KEY,
                      daily_updates_enabled BOOLEAN NOT NULL DEFAULT TRUE,
                      created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;

                Ok::<(), sqlx::Error>(())
            })
            .await
            .map_err(|e| db_error("Failed to initialize records schema", e))?;

        Ok(())
    }

    async fn register_subscriber(&self, session_id: &SessionId) -> Result<()> {
        sqlx::query(
            "INSERT INTO digest_subscribers (session_id) VALUES ($1) ON CONFLICT (session_id) DO NOTHING",
        )
        .bind(session_id.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to register digest subscriber", e))?;
        Ok(())
    }

    fn row_to_holding(row: &PgRow) -> Result<Holding> {
        Ok(Holding {
            ticker: row.try_get("ticker").map_err(|e| db_error("ticker", e))?,
            shares: row.try_get("shares").map_err(|e| db_error("shares", e))?,
            purchase_price: row
                .try_get("purchase_price")
                .map_err(|e| db_error("purchase_price", e))?,
            updated_at: row.try_get("updated_at").map_err(|e| db_error("updated_at", e))?,
        })
    }
}

#[async_trait::async_trait]
impl RecordStore for PostgresRecordStore {
    async fn add_holding(&self, session_id: &SessionId, ticker: &str, shares: f64, price: f64) -> Result<Holding> {
        self.ensure_schema().await?;

        let row = sqlx::query(
            r#"
            INSERT INTO user_portfolio (session_id, ticker, shares, purchase_price)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (session_id, ticker) DO UPDATE SET
              purchase_price = CASE
                WHEN user_portfolio.shares + EXCLUDED.shares > 0 THEN
                  (user_portfolio.shares * user_portfolio.purchase_price
                    + EXCLUDED.shares * EXCLUDED.purchase_price)
                  / (user_portfolio.shares + EXCLUDED.shares)
                ELSE user_portfolio.purchase_price
              END,
              shares = user_portfolio.shares + EXCLUDED.shares,
              updated_at = NOW()
            RETURNING ticker, shares, purchase_price, updated_at
            "#,
        )
        .bind(session_id.as_str())
        .bind(normalize_ticker(ticker))
        .bind(shares)
        .bind(price)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("Failed to upsert holding", e))?;

        self.register_subscriber(session_id).await?;
        Self::row_to_holding(&row)
    }

    async fn remove_holding(&self, session_id: &SessionId, ticker: &str) -> Result<bool> {
        self.ensure_schema().await?;

        let result = sqlx::query("DELETE FROM user_portfolio WHERE session_id = $1 AND ticker = $2")
            .bind(session_id.as_str())
            .bind(normalize_ticker(ticker))
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("Failed to delete holding", e))?;

        Ok(result.rows_affected() > 0)
    }

    async fn holdings(&self, session_id: &SessionId) -> Result<Vec<Holding>> {
        self.ensure_schema().await?;

        let rows = sqlx::query(
            r#"
            SELECT ticker, shares, purchase_price, updated_at
            FROM user_portfolio
            WHERE session_id = $1
            ORDER BY ticker
            "#,
        )
        .bind(session_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to load holdings", e))?;

        rows.iter().map(Self::row_to_holding).collect()
    }

    async fn add_watch(&self, session_id: &SessionId, ticker: &str) -> Result<bool> {
        self.ensure_schema().await?;

        let result = sqlx::query(
            "INSERT INTO watchlist (session_id, ticker) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(session_id.as_str())
        .bind(normalize_ticker(ticker))
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to insert watchlist entry", e))?;

        self.register_subscriber(session_id).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn remove_watch(&self, session_id: &SessionId, ticker: &str) -> Result<bool> {
        self.ensure_schema().await?;

        let result = sqlx::query("DELETE FROM watchlist WHERE session_id = $1 AND ticker = $2")
            .bind(session_id.as_str())
            .bind(normalize_ticker(ticker))
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("Failed to delete watchlist entry", e))?;

        Ok(result.rows_affected() > 0)
    }

    async fn watchlist(&self, session_id: &SessionId) -> Result<Vec<String>> {
        self.ensure_schema().await?;

        let rows = sqlx::query("SELECT ticker FROM watchlist WHERE session_id = $1 ORDER BY ticker")
            .bind(session_id.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error("Failed to load watchlist", e))?;

        rows.iter()
            .map(|row| row.try_get("ticker").map_err(|e| db_error("ticker", e)))
            .collect()
    }

    async fn subscribed_sessions(&self) -> Result<Vec<SessionId>> {
        self.ensure_schema().await?;

        let rows = sqlx::query(
            "SELECT session_id FROM digest_subscribers WHERE daily_updates_enabled ORDER BY session_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list digest subscribers", e))?;

        rows.iter()
            .map(|row| {
                let id: String = row.try_get("session_id").map_err(|e| db_error("session_id", e))?;
                SessionId::new(id)
            })
            .collect()
    }
}
