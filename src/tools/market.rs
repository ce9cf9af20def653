//! Market data source and the price lookup tools

use crate::error::OrchestrationError;
use crate::records::{normalize_ticker, validate_ticker};
use crate::tools::{require_str_list, require_ticker, round2, ToolContext, ToolHandler, ToolSpec};
use crate::Result;
use futures_util::future::join_all;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

const YAHOO_CHART_URL: &str = "https://query1.finance.yahoo.com/v8/finance/chart";
const YAHOO_SUMMARY_URL: &str = "https://query2.finance.yahoo.com/v10/finance/quoteSummary";
const MAX_BATCH_TICKERS: usize = 20;
const DESCRIPTION_LIMIT: usize = 500;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub current_price: Option<f64>,
    pub previous_close: Option<f64>,
    pub currency: String,
    pub market_state: String,
}

impl Quote {
    /// Absolute and percent change against the previous close; zero when either side is missing.
    pub fn change(&self) -> (f64, f64) {
        match (self.current_price, self.previous_close) {
            (Some(current), Some(previous)) if current > 0.0 && previous > 0.0 => {
                let change = current - previous;
                (change, change / previous * 100.0)
            }
            _ => (0.0, 0.0),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompanyProfile {
    pub symbol: String,
    pub name: String,
    pub sector: String,
    pub industry: String,
    pub market_cap: Option<f64>,
    pub pe_ratio: Option<f64>,
    pub dividend_yield: Option<f64>,
    pub fifty_two_week_high: Option<f64>,
    pub fifty_two_week_low: Option<f64>,
    pub avg_volume: Option<f64>,
    pub description: String,
}

/// Source of quotes and company details
#[async_trait::async_trait]
pub trait MarketData: Send + Sync {
    async fn quote(&self, symbol: &str) -> Result<Quote>;
    async fn profile(&self, symbol: &str) -> Result<CompanyProfile>;
}

// =============================
// Yahoo Finance
// =============================

pub struct YahooFinanceClient {
    client: Client,
    chart_url: String,
    summary_url: String,
}

impl YahooFinanceClient {
    pub fn new() -> Result<Self> {
        Self::with_base_urls(YAHOO_CHART_URL, YAHOO_SUMMARY_URL)
    }

    pub fn with_base_urls(chart_url: &str, summary_url: &str) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(8)
            .timeout(Duration::from_secs(15))
            .user_agent("Mozilla/5.0 (compatible; stockpulse/0.1)")
            .build()?;

        Ok(Self {
            client,
            chart_url: chart_url.trim_end_matches('/').to_string(),
            summary_url: summary_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get_json(&self, url: String, query: &[(&str, &str)]) -> Result<Value> {
        let response = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|e| OrchestrationError::MarketDataError(format!("Request failed for {}: {}", url, e)))?;

        let status = response.status();
        let body = response
            .json::<Value>()
            .await
            .map_err(|e| OrchestrationError::MarketDataError(format!("Invalid JSON response: {}", e)))?;

        if !status.is_success() {
            return Err(OrchestrationError::MarketDataError(format!(
                "Market data returned {} for {}",
                status, url
            )));
        }

        Ok(body)
    }

    async fn chart_meta(&self, symbol: &str) -> Result<Value> {
        let url = format!("{}/{}", self.chart_url, symbol);
        let body = self.get_json(url, &[("range", "1d"), ("interval", "1d")]).await?;

        body.pointer("/chart/result/0/meta")
            .cloned()
            .ok_or_else(|| OrchestrationError::MarketDataError(format!("No quote data for {}", symbol)))
    }
}

fn raw_number(value: Option<&Value>) -> Option<f64> {
    let value = value?;
    // quoteSummary wraps numbers as {"raw": .., "fmt": ..}
    value
        .get("raw")
        .and_then(Value::as_f64)
        .or_else(|| value.as_f64())
}

fn text(value: Option<&Value>) -> Option<String> {
    value.and_then(Value::as_str).map(str::to_string)
}

#[async_trait::async_trait]
impl MarketData for YahooFinanceClient {
    async fn quote(&self, symbol: &str) -> Result<Quote> {
        let symbol = validate_ticker(symbol)?;
        let meta = self.chart_meta(&symbol).await?;

        let current_price = raw_number(meta.get("regularMarketPrice"));
        let previous_close =
            raw_number(meta.get("previousClose")).or_else(|| raw_number(meta.get("chartPreviousClose")));

        if current_price.is_none() {
            return Err(OrchestrationError::MarketDataError(format!("No price available for {}", symbol)));
        }

        debug!(symbol = %symbol, price = ?current_price, "Fetched quote");

        Ok(Quote {
            symbol,
            current_price,
            previous_close,
            currency: text(meta.get("currency")).unwrap_or_else(|| "USD".to_string()),
            market_state: text(meta.get("marketState")).unwrap_or_else(|| "UNKNOWN".to_string()),
        })
    }

    async fn profile(&self, symbol: &str) -> Result<CompanyProfile> {
        let symbol = validate_ticker(symbol)?;
        let url = format!("{}/{}", self.summary_url, symbol);

        match self
            .get_json(url, &[("modules", "assetProfile,summaryDetail,price")])
            .await
        {
            Ok(body) => {
                let result = body.pointer("/quoteSummary/result/0").cloned().ok_or_else(|| {
                    OrchestrationError::MarketDataError(format!("No company data for {}", symbol))
                })?;

                let asset = result.get("assetProfile").cloned().unwrap_or(Value::Null);
                let summary = result.get("summaryDetail").cloned().unwrap_or(Value::Null);
                let price = result.get("price").cloned().unwrap_or(Value::Null);

                Ok(CompanyProfile {
                    name: text(price.get("longName"))
                        .or_else(|| text(price.get("shortName")))
                        .unwrap_or_else(|| "Unknown".to_string()),
                    sector: text(asset.get("sector")).unwrap_or_else(|| "Unknown".to_string()),
                    industry: text(asset.get("industry")).unwrap_or_else(|| "Unknown".to_string()),
                    market_cap: raw_number(summary.get("marketCap")),
                    pe_ratio: raw_number(summary.get("trailingPE")),
                    dividend_yield: raw_number(summary.get("dividendYield")),
                    fifty_two_week_high: raw_number(summary.get("fiftyTwoWeekHigh")),
                    fifty_two_week_low: raw_number(summary.get("fiftyTwoWeekLow")),
                    avg_volume: raw_number(summary.get("averageVolume")),
                    description: text(asset.get("longBusinessSummary")).unwrap_or_default(),
                    symbol,
                })
            }
            Err(e) => {
                // quoteSummary is often gated; the chart meta still carries name and range.
                debug!(symbol = %symbol, error = %e, "Company summary unavailable, using chart meta");
                let meta = self.chart_meta(&symbol).await?;
                Ok(CompanyProfile {
                    name: text(meta.get("longName"))
                        .or_else(|| text(meta.get("shortName")))
                        .unwrap_or_else(|| "Unknown".to_string()),
                    sector: "Unknown".to_string(),
                    industry: "Unknown".to_string(),
                    fifty_two_week_high: raw_number(meta.get("fiftyTwoWeekHigh")),
                    fifty_two_week_low: raw_number(meta.get("fiftyTwoWeekLow")),
                    avg_volume: raw_number(meta.get("regularMarketVolume")),
                    symbol,
                    ..CompanyProfile::default()
                })
            }
        }
    }
}

// =============================
// Static market data
// =============================

/// Fixed quotes for offline runs and tests
#[derive(Default)]
pub struct StaticMarketData {
    quotes: Arc<RwLock<HashMap<String, Quote>>>,
    profiles: Arc<RwLock<HashMap<String, CompanyProfile>>>,
}

impl StaticMarketData {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_price(&self, symbol: &str, current: f64, previous_close: f64) {
        let symbol = normalize_ticker(symbol);
        self.quotes.write().await.insert(
            symbol.clone(),
            Quote {
                symbol,
                current_price: Some(current),
                previous_close: Some(previous_close),
                currency: "USD".to_string(),
                market_state: "REGULAR".to_string(),
            },
        );
    }

    pub async fn set_profile(&self, profile: CompanyProfile) {
        self.profiles
            .write()
            .await
            .insert(normalize_ticker(&profile.symbol), profile);
    }
}

#[async_trait::async_trait]
impl MarketData for StaticMarketData {
    async fn quote(&self, symbol: &str) -> Result<Quote> {
        let symbol = normalize_ticker(symbol);
        self.quotes
            .read()
            .await
            .get(&symbol)
            .cloned()
            .ok_or_else(|| OrchestrationError::MarketDataError(format!("No quote data for {}", symbol)))
    }

    async fn profile(&self, symbol: &str) -> Result<CompanyProfile> {
        let symbol = normalize_ticker(symbol);
        self.profiles
            .read()
            .await
            .get(&symbol)
            .cloned()
            .ok_or_else(|| OrchestrationError::MarketDataError(format!("No company data for {}", symbol)))
    }
}

// =============================
// Tools
// =============================

/// Price snapshot as a tool-shaped object. Lookup failures become `success: false`
/// so batch callers can report per-ticker outcomes.
pub(crate) async fn price_snapshot(market: &dyn MarketData, ticker: &str) -> Value {
    let ticker = normalize_ticker(ticker);
    let quote = match validate_ticker(&ticker) {
        Ok(symbol) => market.quote(&symbol).await,
        Err(e) => Err(e),
    };
    match quote {
        Ok(quote) => {
            let (change, percent_change) = quote.change();
            json!({
                "ticker": ticker,
                "current_price": quote.current_price.map(round2),
                "previous_close": quote.previous_close.map(round2),
                "change": round2(change),
                "percent_change": round2(percent_change),
                "currency": quote.currency,
                "market_state": quote.market_state,
                "success": true,
            })
        }
        Err(e) => json!({
            "ticker": ticker,
            "error": e.to_string(),
            "success": false,
        }),
    }
}

struct FetchPrice {
    market: Arc<dyn MarketData>,
}

#[async_trait::async_trait]
impl ToolHandler for FetchPrice {
    async fn call(&self, _ctx: &ToolContext, arguments: &Map<String, Value>) -> Result<Value> {
        let ticker = require_ticker(arguments, "ticker")?;
        Ok(price_snapshot(self.market.as_ref(), &ticker).await)
    }
}

struct FetchMultiplePrices {
    market: Arc<dyn MarketData>,
}

#[async_trait::async_trait]
impl ToolHandler for FetchMultiplePrices {
    async fn call(&self, _ctx: &ToolContext, arguments: &Map<String, Value>) -> Result<Value> {
        let tickers = require_str_list(arguments, "tickers")?;
        if tickers.len() > MAX_BATCH_TICKERS {
            return Err(OrchestrationError::InvalidToolInput(format!(
                "At most {} tickers per request",
                MAX_BATCH_TICKERS
            )));
        }

        let prices = join_all(
            tickers
                .iter()
                .map(|ticker| price_snapshot(self.market.as_ref(), ticker)),
        )
        .await;

        Ok(json!({
            "success": true,
            "count": prices.len(),
            "prices": prices,
        }))
    }
}

struct GetStockInfo {
    market: Arc<dyn MarketData>,
}

#[async_trait::async_trait]
impl ToolHandler for GetStockInfo {
    async fn call(&self, _ctx: &ToolContext, arguments: &Map<String, Value>) -> Result<Value> {
        let ticker = require_ticker(arguments, "ticker")?;
        let profile = self.market.profile(&ticker).await?;

        let description: String = profile.description.chars().take(DESCRIPTION_LIMIT).collect();

        Ok(json!({
            "ticker": ticker,
            "name": profile.name,
            "sector": profile.sector,
            "industry": profile.industry,
            "market_cap": profile.market_cap,
            "pe_ratio": profile.pe_ratio,
            "dividend_yield": profile.dividend_yield,
            "52_week_high": profile.fifty_two_week_high,
            "52_week_low": profile.fifty_two_week_low,
            "avg_volume": profile.avg_volume,
            "description": description,
            "success": true,
        }))
    }
}

fn ticker_schema(description: &str) -> Value {
    json!({
        "type": "object",
        "properties": {
            "ticker": {"type": "string", "description": description}
        },
        "required": ["ticker"]
    })
}

pub(crate) fn specs(market: Arc<dyn MarketData>) -> Vec<ToolSpec> {
    vec![
        ToolSpec::new(
            "fetch_price",
            "Fetch the current price and daily change for a stock ticker.",
            ticker_schema("Stock ticker symbol, e.g. AAPL, TSLA, MSFT"),
            Arc::new(FetchPrice { market: market.clone() }),
        ),
        ToolSpec::new(
            "fetch_multiple_prices",
            "Fetch current prices for several stock tickers at once.",
            json!({
                "type": "object",
                "properties": {
                    "tickers": {
                        "type": "array",
                        "items": {"type": "string"},
                        "description": "List of stock ticker symbols"
                    }
                },
                "required": ["tickers"]
            }),
            Arc::new(FetchMultiplePrices { market: market.clone() }),
        ),
        ToolSpec::new(
            "get_stock_info",
            "Get company details for a stock: name, sector, market cap, P/E, 52-week range.",
            ticker_schema("Stock ticker symbol"),
            Arc::new(GetStockInfo { market }),
        ),
    ]
}
