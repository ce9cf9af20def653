//! Portfolio and watchlist tools
//!
//! Every handler acts on the session in its `ToolContext`; the model never
//! names whose records to touch.

use crate::error::OrchestrationError;
use crate::records::RecordStore;
use crate::tools::market::{price_snapshot, MarketData};
use crate::tools::{require_f64, require_ticker, round2, ToolContext, ToolHandler, ToolSpec};
use crate::Result;
use futures_util::future::join_all;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::info;

struct UpdatePortfolio {
    records: Arc<dyn RecordStore>,
}

#[async_trait::async_trait]
impl ToolHandler for UpdatePortfolio {
    async fn call(&self, ctx: &ToolContext, arguments: &Map<String, Value>) -> Result<Value> {
        let ticker = require_ticker(arguments, "ticker")?;
        let shares = require_f64(arguments, "shares")?;
        let purchase_price = require_f64(arguments, "purchase_price")?;

        if shares <= 0.0 {
            return Err(OrchestrationError::InvalidToolInput("'shares' must be positive".to_string()));
        }
        if purchase_price < 0.0 {
            return Err(OrchestrationError::InvalidToolInput(
                "'purchase_price' must not be negative".to_string(),
            ));
        }

        let holding = self
            .records
            .add_holding(&ctx.session_id, &ticker, shares, purchase_price)
            .await?;

        info!(
            session = %ctx.session_id.log_key(),
            ticker = %ticker,
            shares,
            "Portfolio position updated"
        );

        Ok(json!({
            "success": true,
            "message": format!("Added {} shares of {} at ${:.2} to your portfolio.", shares, ticker, purchase_price),
            "ticker": ticker,
            "shares": shares,
            "purchase_price": purchase_price,
            "total_shares": holding.shares,
            "average_price": round2(holding.purchase_price),
        }))
    }
}

struct RemoveFromPortfolio {
    records: Arc<dyn RecordStore>,
}

#[async_trait::async_trait]
impl ToolHandler for RemoveFromPortfolio {
    async fn call(&self, ctx: &ToolContext, arguments: &Map<String, Value>) -> Result<Value> {
        let ticker = require_ticker(arguments, "ticker")?;

        if self.records.remove_holding(&ctx.session_id, &ticker).await? {
            Ok(json!({
                "success": true,
                "message": format!("Removed {} from your portfolio.", ticker),
            }))
        } else {
            Ok(json!({
                "success": false,
                "message": format!("{} was not found in your portfolio.", ticker),
            }))
        }
    }
}

struct GetPortfolio {
    records: Arc<dyn RecordStore>,
}

#[async_trait::async_trait]
impl ToolHandler for GetPortfolio {
    async fn call(&self, ctx: &ToolContext, _arguments: &Map<String, Value>) -> Result<Value> {
        let holdings = self.records.holdings(&ctx.session_id).await?;

        if holdings.is_empty() {
            return Ok(json!({
                "success": true,
                "holdings": [],
                "message": "Your portfolio is empty.",
            }));
        }

        Ok(json!({
            "success": true,
            "count": holdings.len(),
            "holdings": holdings,
        }))
    }
}

struct CalculatePortfolioStats {
    records: Arc<dyn RecordStore>,
    market: Arc<dyn MarketData>,
}

#[async_trait::async_trait]
impl ToolHandler for CalculatePortfolioStats {
    async fn call(&self, ctx: &ToolContext, _arguments: &Map<String, Value>) -> Result<Value> {
        let holdings = self.records.holdings(&ctx.session_id).await?;

        if holdings.is_empty() {
            return Ok(json!({
                "success": true,
                "message": "Your portfolio is empty.",
                "total_value": 0,
                "total_cost": 0,
                "total_gain_loss": 0,
                "total_percent_change": 0,
                "holdings": [],
            }));
        }

        let quotes = join_all(
            holdings
                .iter()
                .map(|h| price_snapshot(self.market.as_ref(), &h.ticker)),
        )
        .await;

        let mut total_value = 0.0;
        let mut total_cost = 0.0;
        let mut detailed = Vec::with_capacity(holdings.len());

        for (holding, quote) in holdings.iter().zip(quotes) {
            // A missing quote values the position at cost.
            let (current_price, daily_change_pct) = match quote["current_price"].as_f64() {
                Some(price) if quote["success"] == true => {
                    (price, quote["percent_change"].as_f64().unwrap_or(0.0))
                }
                _ => (holding.purchase_price, 0.0),
            };

            let current_value = holding.shares * current_price;
            let cost_basis = holding.shares * holding.purchase_price;
            let percent_change = if holding.purchase_price > 0.0 {
                (current_price - holding.purchase_price) / holding.purchase_price * 100.0
            } else {
                0.0
            };

            total_value += current_value;
            total_cost += cost_basis;

            detailed.push(json!({
                "ticker": holding.ticker,
                "shares": holding.shares,
                "purchase_price": round2(holding.purchase_price),
                "current_price": round2(current_price),
                "current_value": round2(current_value),
                "cost_basis": round2(cost_basis),
                "gain_loss": round2(current_value - cost_basis),
                "percent_change": round2(percent_change),
                "daily_change_pct": round2(daily_change_pct),
            }));
        }

        let total_percent_change = if total_cost > 0.0 {
            (total_value - total_cost) / total_cost * 100.0
        } else {
            0.0
        };

        Ok(json!({
            "success": true,
            "total_value": round2(total_value),
            "total_cost": round2(total_cost),
            "total_gain_loss": round2(total_value - total_cost),
            "total_percent_change": round2(total_percent_change),
            "holdings": detailed,
        }))
    }
}

struct AddToWatchlist {
    records: Arc<dyn RecordStore>,
}

#[async_trait::async_trait]
impl ToolHandler for AddToWatchlist {
    async fn call(&self, ctx: &ToolContext, arguments: &Map<String, Value>) -> Result<Value> {
        let ticker = require_ticker(arguments, "ticker")?;

        if self.records.add_watch(&ctx.session_id, &ticker).await? {
            Ok(json!({
                "success": true,
                "message": format!("Added {} to your watchlist.", ticker),
            }))
        } else {
            Ok(json!({
                "success": false,
                "message": format!("{} is already in your watchlist.", ticker),
            }))
        }
    }
}

struct RemoveFromWatchlist {
    records: Arc<dyn RecordStore>,
}

#[async_trait::async_trait]
impl ToolHandler for RemoveFromWatchlist {
    async fn call(&self, ctx: &ToolContext, arguments: &Map<String, Value>) -> Result<Value> {
        let ticker = require_ticker(arguments, "ticker")?;

        if self.records.remove_watch(&ctx.session_id, &ticker).await? {
            Ok(json!({
                "success": true,
                "message": format!("Removed {} from your watchlist.", ticker),
            }))
        } else {
            Ok(json!({
                "success": false,
                "message": format!("{} was not found in your watchlist.", ticker),
            }))
        }
    }
}

struct GetWatchlist {
    records: Arc<dyn RecordStore>,
    market: Arc<dyn MarketData>,
}

#[async_trait::async_trait]
impl ToolHandler for GetWatchlist {
    async fn call(&self, ctx: &ToolContext, _arguments: &Map<String, Value>) -> Result<Value> {
        let tickers = self.records.watchlist(&ctx.session_id).await?;

        if tickers.is_empty() {
            return Ok(json!({
                "success": true,
                "watchlist": [],
                "message": "Your watchlist is empty.",
            }));
        }

        let quotes = join_all(
            tickers
                .iter()
                .map(|t| price_snapshot(self.market.as_ref(), t)),
        )
        .await;

        let watchlist: Vec<Value> = tickers
            .iter()
            .zip(quotes)
            .map(|(ticker, quote)| {
                json!({
                    "ticker": ticker,
                    "current_price": quote.get("current_price").cloned().unwrap_or(Value::Null),
                    "percent_change": quote.get("percent_change").cloned().unwrap_or(Value::Null),
                    "success": quote["success"] == true,
                })
            })
            .collect();

        Ok(json!({
            "success": true,
            "count": watchlist.len(),
            "watchlist": watchlist,
        }))
    }
}

fn ticker_only(description: &str) -> Value {
    json!({
        "type": "object",
        "properties": {
            "ticker": {"type": "string", "description": description}
        },
        "required": ["ticker"]
    })
}

fn no_arguments() -> Value {
    json!({"type": "object", "properties": {}})
}

pub(crate) fn specs(records: Arc<dyn RecordStore>, market: Arc<dyn MarketData>) -> Vec<ToolSpec> {
    vec![
        ToolSpec::new(
            "update_portfolio",
            "Add shares of a stock to the user's portfolio at a purchase price per share.",
            json!({
                "type": "object",
                "properties": {
                    "ticker": {"type": "string", "description": "Stock ticker symbol, e.g. AAPL"},
                    "shares": {"type": "number", "description": "Number of shares purchased"},
                    "purchase_price": {"type": "number", "description": "Price per share at purchase"}
                },
                "required": ["ticker", "shares", "purchase_price"]
            }),
            Arc::new(UpdatePortfolio { records: records.clone() }),
        ),
        ToolSpec::new(
            "remove_from_portfolio",
            "Remove a stock from the user's portfolio.",
            ticker_only("Stock ticker symbol to remove"),
            Arc::new(RemoveFromPortfolio { records: records.clone() }),
        ),
        ToolSpec::new(
            "get_portfolio",
            "List the stocks in the user's portfolio with shares and average purchase price.",
            no_arguments(),
            Arc::new(GetPortfolio { records: records.clone() }),
        ),
        ToolSpec::new(
            "calculate_portfolio_stats",
            "Value the user's portfolio at current prices: per-holding and total gain/loss.",
            no_arguments(),
            Arc::new(CalculatePortfolioStats {
                records: records.clone(),
                market: market.clone(),
            }),
        ),
        ToolSpec::new(
            "add_to_watchlist",
            "Add a stock to the user's watchlist.",
            ticker_only("Stock ticker symbol to watch"),
            Arc::new(AddToWatchlist { records: records.clone() }),
        ),
        ToolSpec::new(
            "remove_from_watchlist",
            "Remove a stock from the user's watchlist.",
            ticker_only("Stock ticker symbol to remove"),
            Arc::new(RemoveFromWatchlist { records: records.clone() }),
        ),
        ToolSpec::new(
            "get_watchlist",
            "List the user's watchlist with current prices.",
            no_arguments(),
            Arc::new(GetWatchlist { records, market }),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SessionId;
    use crate::records::InMemoryRecordStore;
    use crate::tools::market::StaticMarketData;

    fn ctx(id: &str) -> ToolContext {
        ToolContext::new(SessionId::new(id).unwrap())
    }

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_update_portfolio_writes_for_context_session() {
        let records = Arc::new(InMemoryRecordStore::new());
        let tool = UpdatePortfolio { records: records.clone() };

        let out = tool
            .call(&ctx("+1"), &args(json!({"ticker": "aapl", "shares": 10, "purchase_price": 150})))
            .await
            .unwrap();

        assert_eq!(out["success"], true);
        assert_eq!(out["message"], "Added 10 shares of AAPL at $150.00 to your portfolio.");
        assert_eq!(records.holdings(&SessionId::new("+1").unwrap()).await.unwrap().len(), 1);
        assert!(records.holdings(&SessionId::new("+2").unwrap()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_portfolio_rejects_bad_shares() {
        let tool = UpdatePortfolio {
            records: Arc::new(InMemoryRecordStore::new()),
        };
        let err = tool
            .call(&ctx("+1"), &args(json!({"ticker": "AAPL", "shares": 0, "purchase_price": 1})))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::InvalidToolInput(_)));
    }

    #[tokio::test]
    async fn test_stats_fall_back_to_purchase_price() {
        let records = Arc::new(InMemoryRecordStore::new());
        let market = Arc::new(StaticMarketData::new());
        market.set_price("AAPL", 200.0, 190.0).await;

        let id = SessionId::new("+1").unwrap();
        records.add_holding(&id, "AAPL", 10.0, 150.0).await.unwrap();
        records.add_holding(&id, "GONE", 5.0, 20.0).await.unwrap();

        let tool = CalculatePortfolioStats { records, market };
        let out = tool.call(&ctx("+1"), &Map::new()).await.unwrap();

        assert_eq!(out["total_value"], 2100.0);
        assert_eq!(out["total_cost"], 1600.0);
        assert_eq!(out["total_gain_loss"], 500.0);
        assert_eq!(out["total_percent_change"], 31.25);

        let gone = &out["holdings"][1];
        assert_eq!(gone["ticker"], "GONE");
        assert_eq!(gone["current_price"], 20.0);
        assert_eq!(gone["gain_loss"], 0.0);
    }

    #[tokio::test]
    async fn test_empty_portfolio_stats() {
        let tool = CalculatePortfolioStats {
            records: Arc::new(InMemoryRecordStore::new()),
            market: Arc::new(StaticMarketData::new()),
        };
        let out = tool.call(&ctx("+1"), &Map::new()).await.unwrap();
        assert_eq!(out["message"], "Your portfolio is empty.");
        assert_eq!(out["total_value"], 0);
    }

    #[tokio::test]
    async fn test_watchlist_round_trip() {
        let records: Arc<dyn RecordStore> = Arc::new(InMemoryRecordStore::new());
        let market = Arc::new(StaticMarketData::new());
        market.set_price("TSLA", 250.0, 240.0).await;

        let add = AddToWatchlist { records: records.clone() };
        let first = add.call(&ctx("+1"), &args(json!({"ticker": "tsla"}))).await.unwrap();
        let again = add.call(&ctx("+1"), &args(json!({"ticker": "TSLA"}))).await.unwrap();
        assert_eq!(first["success"], true);
        assert_eq!(again["success"], false);

        let list = GetWatchlist { records: records.clone(), market };
        let out = list.call(&ctx("+1"), &Map::new()).await.unwrap();
        assert_eq!(out["count"], 1);
        assert_eq!(out["watchlist"][0]["current_price"], 250.0);

        let remove = RemoveFromWatchlist { records };
        let removed = remove.call(&ctx("+1"), &args(json!({"ticker": "TSLA"}))).await.unwrap();
        assert_eq!(removed["success"], true);
    }
}
