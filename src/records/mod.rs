//! Holdings and watchlist records
//!
//! Plain keyed CRUD behind a trait. Tool handlers are the only callers;
//! the orchestration loop never touches these records directly.

use crate::error::OrchestrationError;
use crate::models::SessionId;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

pub mod postgres;

pub use postgres::PostgresRecordStore;

/// Aggregated position for one ticker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Holding {
    pub ticker: String,
    pub shares: f64,
    /// Weighted average cost per share
    pub purchase_price: f64,
    pub updated_at: DateTime<Utc>,
}

const MAX_TICKER_LEN: usize = 12;

pub fn normalize_ticker(ticker: &str) -> String {
    ticker.trim().to_uppercase()
}

/// Normalized ticker, or `InvalidToolInput` unless it is 1-12 chars of `A-Z 0-9 . ^ = -`.
pub fn validate_ticker(ticker: &str) -> Result<String> {
    let symbol = normalize_ticker(ticker);
    let valid = !symbol.is_empty()
        && symbol.len() <= MAX_TICKER_LEN
        && symbol
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || matches!(c, '.' | '^' | '=' | '-'));

    if valid {
        Ok(symbol)
    } else {
        Err(OrchestrationError::InvalidToolInput(format!(
            "'{}' is not a valid ticker symbol",
            ticker.trim()
        )))
    }
}

#[async_trait::async_trait]
pub trait RecordStore: Send + Sync {
    /// Add shares to a position, merging into the average cost.
    async fn add_holding(&self, session_id: &SessionId, ticker: &str, shares: f64, price: f64) -> Result<Holding>;
    /// Returns false when the ticker was not held.
    async fn remove_holding(&self, session_id: &SessionId, ticker: &str) -> Result<bool>;
    async fn holdings(&self, session_id: &SessionId) -> Result<Vec<Holding>>;

    /// Returns false when the ticker is already watched.
    async fn add_watch(&self, session_id: &SessionId, ticker: &str) -> Result<bool>;
    async fn remove_watch(&self, session_id: &SessionId, ticker: &str) -> Result<bool>;
    async fn watchlist(&self, session_id: &SessionId) -> Result<Vec<String>>;

    /// Sessions registered for daily digests.
    async fn subscribed_sessions(&self) -> Result<Vec<SessionId>>;
}

#[derive(Default)]
struct SessionRecords {
    holdings: BTreeMap<String, Holding>,
    watchlist: BTreeSet<String>,
}

/// In-memory record store for development and tests
pub struct InMemoryRecordStore {
    records: Arc<RwLock<HashMap<SessionId, SessionRecords>>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn add_holding(&self, session_id: &SessionId, ticker: &str, shares: f64, price: f64) -> Result<Holding> {
        let ticker = normalize_ticker(ticker);
        let mut records = self.records.write().await;
        let entry = records.entry(session_id.clone()).or_default();

        let holding = entry
            .holdings
            .entry(ticker.clone())
            .and_modify(|h| {
                let total = h.shares + shares;
                if total > 0.0 {
                    h.purchase_price = (h.shares * h.purchase_price + shares * price) / total;
                }
                h.shares = total;
                h.updated_at = Utc::now();
            })
            .or_insert_with(|| Holding {
                ticker,
                shares,
                purchase_price: price,
                updated_at: Utc::now(),
            });

        Ok(holding.clone())
    }

    async fn remove_holding(&self, session_id: &SessionId, ticker: &str) -> Result<bool> {
        let mut records = self.records.write().await;
        Ok(records
            .get_mut(session_id)
            .map(|r| r.holdings.remove(&normalize_ticker(ticker)).is_some())
            .unwrap_or(false))
    }

    async fn holdings(&self, session_id: &SessionId) -> Result<Vec<Holding>> {
        let records = self.records.read().await;
        Ok(records
            .get(session_id)
            .map(|r| r.holdings.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn add_watch(&self, session_id: &SessionId, ticker: &str) -> Result<bool> {
        let mut records = self.records.write().await;
        Ok(records
            .entry(session_id.clone())
            .or_default()
            .watchlist
            .insert(normalize_ticker(ticker)))
    }

    async fn remove_watch(&self, session_id: &SessionId, ticker: &str) -> Result<bool> {
        let mut records = self.records.write().await;
        Ok(records
            .get_mut(session_id)
            .map(|r| r.watchlist.remove(&normalize_ticker(ticker)))
            .unwrap_or(false))
    }

    async fn watchlist(&self, session_id: &SessionId) -> Result<Vec<String>> {
        let records = self.records.read().await;
        Ok(records
            .get(session_id)
            .map(|r| r.watchlist.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn subscribed_sessions(&self) -> Result<Vec<SessionId>> {
        // A session subscribes on its first holding or watch entry and stays subscribed.
        let records = self.records.read().await;
        let mut ids: Vec<SessionId> = records.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(s: &str) -> SessionId {
        SessionId::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_add_holding_merges_weighted_average() {
        let store = InMemoryRecordStore::new();
        store.add_holding(&sid("+1"), "aapl", 10.0, 150.0).await.unwrap();
        let merged = store.add_holding(&sid("+1"), "AAPL ", 30.0, 170.0).await.unwrap();

        assert_eq!(merged.ticker, "AAPL");
        assert_eq!(merged.shares, 40.0);
        assert!((merged.purchase_price - 165.0).abs() < 1e-9);
        assert_eq!(store.holdings(&sid("+1")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_watchlist_rejects_duplicates() {
        let store = InMemoryRecordStore::new();
        assert!(store.add_watch(&sid("+1"), "tsla").await.unwrap());
        assert!(!store.add_watch(&sid("+1"), "TSLA").await.unwrap());
        assert!(store.remove_watch(&sid("+1"), "tsla").await.unwrap());
        assert!(!store.remove_watch(&sid("+1"), "tsla").await.unwrap());
    }

    #[test]
    fn test_validate_ticker() {
        assert_eq!(validate_ticker(" brk.b ").unwrap(), "BRK.B");
        assert_eq!(validate_ticker("^GSPC").unwrap(), "^GSPC");
        assert_eq!(validate_ticker("EURUSD=X").unwrap(), "EURUSD=X");

        for bad in ["", "../AAPL", "AAPL?x=1", "AA PL", "A/B", "TOOLONGTICKER1"] {
            assert!(
                matches!(validate_ticker(bad), Err(OrchestrationError::InvalidToolInput(_))),
                "accepted {:?}",
                bad
            );
        }
    }

    #[tokio::test]
    async fn test_records_are_per_session() {
        let store = InMemoryRecordStore::new();
        store.add_holding(&sid("+1"), "MSFT", 1.0, 300.0).await.unwrap();

        assert!(store.holdings(&sid("+2")).await.unwrap().is_empty());
        assert!(!store.remove_holding(&sid("+2"), "MSFT").await.unwrap());
        assert_eq!(store.subscribed_sessions().await.unwrap(), vec![sid("+1")]);
    }
}
