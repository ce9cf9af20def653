//! Daily portfolio digest
//!
//! Reads each subscribed session's portfolio and watchlist through the same
//! tool handlers the agent uses, formats a WhatsApp message, and hands it to
//! a `Notifier`. Runs beside the agent, never through a turn.

use crate::error::OrchestrationError;
use crate::models::SessionId;
use crate::records::RecordStore;
use crate::tools::{ToolContext, ToolRegistry};
use crate::Result;
use chrono::{Duration as ChronoDuration, Local, NaiveDate, NaiveDateTime, NaiveTime};
use serde_json::{Map, Value};
use std::fmt::{self, Write as _};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub mod notifier;

pub use notifier::{LogNotifier, Notifier, TwilioNotifier};

const RULE: &str = "────────────────────";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DigestReport {
    pub sent: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct DigestJob {
    registry: Arc<ToolRegistry>,
    records: Arc<dyn RecordStore>,
    notifier: Arc<dyn Notifier>,
}

impl DigestJob {
    pub fn new(registry: Arc<ToolRegistry>, records: Arc<dyn RecordStore>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            registry,
            records,
            notifier,
        }
    }

    /// Digest text for one session, or None when it has nothing to report.
    pub async fn format_digest(&self, session_id: &SessionId, date: NaiveDate) -> Result<Option<String>> {
        let ctx = ToolContext::new(session_id.clone());
        let no_args = Map::new();

        let stats = self.registry.call(&ctx, "calculate_portfolio_stats", &no_args).await?;
        let watch = self.registry.call(&ctx, "get_watchlist", &no_args).await?;

        let holdings = stats["holdings"].as_array().cloned().unwrap_or_default();
        let watchlist = watch["watchlist"].as_array().cloned().unwrap_or_default();

        if holdings.is_empty() && watchlist.is_empty() {
            return Ok(None);
        }

        let mut out = String::new();
        write_digest(&mut out, date, &stats, &holdings, &watchlist)
            .map_err(|_| OrchestrationError::Internal("failed to format digest".to_string()))?;

        Ok(Some(out))
    }

    /// Send today's digest to every subscribed session. One failing session
    /// is logged and counted; the rest still go out.
    pub async fn run_once(&self) -> Result<DigestReport> {
        let sessions = self.records.subscribed_sessions().await?;
        let today = Local::now().date_naive();
        let mut report = DigestReport::default();

        info!(sessions = sessions.len(), "Starting daily digest");

        for session_id in &sessions {
            let outcome = match self.format_digest(session_id, today).await {
                Ok(Some(body)) => self.notifier.send(session_id, &body).await.map(|_| true),
                Ok(None) => Ok(false),
                Err(e) => Err(e),
            };

            match outcome {
                Ok(true) => report.sent += 1,
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    report.failed += 1;
                    error!(session = %session_id.log_key(), error = %e, "Failed to deliver digest");
                }
            }
        }

        info!(
            sent = report.sent,
            skipped = report.skipped,
            failed = report.failed,
            "Daily digest completed"
        );
        Ok(report)
    }
}

/// Runs a `DigestJob` every day at a fixed local time until shut down.
pub struct DigestScheduler {
    job: Arc<DigestJob>,
    at: NaiveTime,
}

impl DigestScheduler {
    pub fn new(job: Arc<DigestJob>, hour: u32, minute: u32) -> Option<Self> {
        NaiveTime::from_hms_opt(hour, minute, 0).map(|at| Self { job, at })
    }

    pub async fn run(self, shutdown: CancellationToken) {
        info!(at = %self.at.format("%H:%M"), "Digest scheduler started");

        loop {
            let now = Local::now().naive_local();
            let wait = (next_run(now, self.at) - now)
                .to_std()
                .unwrap_or(Duration::from_secs(60));

            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Digest scheduler stopped");
                    return;
                }
                _ = tokio::time::sleep(wait) => {}
            }

            if let Err(e) = self.job.run_once().await {
                warn!(error = %e, "Daily digest run failed");
            }
        }
    }
}

/// Next occurrence of `at` strictly after `now`.
pub fn next_run(now: NaiveDateTime, at: NaiveTime) -> NaiveDateTime {
    let today = now.date().and_time(at);
    if today > now {
        today
    } else {
        today + ChronoDuration::days(1)
    }
}

fn write_digest(
    out: &mut String,
    date: NaiveDate,
    stats: &Value,
    holdings: &[Value],
    watchlist: &[Value],
) -> fmt::Result {
    writeln!(out, "🌅 *Good Morning! Here's your StockPulse Update*")?;
    writeln!(out, "📅 {}", date.format("%B %d, %Y"))?;
    writeln!(out)?;

    if !holdings.is_empty() {
        writeln!(out, "📊 *Your Portfolio*")?;
        writeln!(out, "{}", RULE)?;

        for h in holdings {
            let ticker = h["ticker"].as_str().unwrap_or("?");
            let daily = num(h, "daily_change_pct");
            let gain = num(h, "gain_loss");

            writeln!(out, "*{}*: {} shares", ticker, format_shares(num(h, "shares")))?;
            writeln!(out, "  💰 ${:.2} {} {:+.2}% today", num(h, "current_price"), trend(daily), daily)?;
            writeln!(
                out,
                "  {} {} ({:+.2}%) total",
                if gain >= 0.0 { "✅" } else { "❌" },
                signed_money(gain),
                num(h, "percent_change")
            )?;
            writeln!(out)?;
        }

        let total_gain = num(stats, "total_gain_loss");
        writeln!(out, "{}", RULE)?;
        writeln!(out, "💼 *Total Value*: ${}", money(num(stats, "total_value")))?;
        writeln!(
            out,
            "{} *Total P/L*: {} ({:+.2}%)",
            if total_gain >= 0.0 { "🎉" } else { "😔" },
            signed_money(total_gain),
            num(stats, "total_percent_change")
        )?;
        writeln!(out)?;
    }

    if !watchlist.is_empty() {
        writeln!(out, "👀 *Watchlist*")?;
        writeln!(out, "{}", RULE)?;

        for w in watchlist {
            let ticker = w["ticker"].as_str().unwrap_or("?");
            match w["current_price"].as_f64() {
                Some(price) if w["success"] == true => {
                    let change = num(w, "percent_change");
                    writeln!(out, "*{}*: ${:.2} {} {:+.2}%", ticker, price, trend(change), change)?;
                }
                _ => writeln!(out, "*{}*: Price unavailable", ticker)?,
            }
        }
        writeln!(out)?;
    }

    writeln!(out, "{}", RULE)?;
    out.write_str("💬 Reply with any questions about your portfolio!")
}

fn num(value: &Value, key: &str) -> f64 {
    value.get(key).and_then(Value::as_f64).unwrap_or(0.0)
}

fn trend(change: f64) -> &'static str {
    if change >= 0.0 {
        "📈"
    } else {
        "📉"
    }
}

fn format_shares(shares: f64) -> String {
    if shares.fract() == 0.0 {
        format!("{}", shares as i64)
    } else {
        format!("{}", shares)
    }
}

/// 1234567.891 → "1,234,567.89"
fn money(amount: f64) -> String {
    let fixed = format!("{:.2}", amount.abs());
    let (whole, cents) = fixed.split_once('.').unwrap_or((fixed.as_str(), "00"));

    let mut grouped = String::with_capacity(whole.len() + whole.len() / 3);
    for (i, ch) in whole.chars().enumerate() {
        if i > 0 && (whole.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }

    let sign = if amount < 0.0 && fixed != "0.00" { "-" } else { "" };
    format!("{}{}.{}", sign, grouped, cents)
}

fn signed_money(amount: f64) -> String {
    if amount < 0.0 {
        format!("-${}", money(amount.abs()))
    } else {
        format!("+${}", money(amount))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::InMemoryRecordStore;
    use crate::tools::StaticMarketData;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Outbox {
        sent: Mutex<Vec<(SessionId, String)>>,
        fail_for: Option<SessionId>,
    }

    #[async_trait::async_trait]
    impl Notifier for Outbox {
        async fn send(&self, session_id: &SessionId, body: &str) -> Result<()> {
            if self.fail_for.as_ref() == Some(session_id) {
                return Err(OrchestrationError::NotificationError("rejected".to_string()));
            }
            self.sent.lock().unwrap().push((session_id.clone(), body.to_string()));
            Ok(())
        }
    }

    fn sid(s: &str) -> SessionId {
        SessionId::new(s).unwrap()
    }

    async fn job(outbox: Arc<Outbox>) -> (DigestJob, Arc<InMemoryRecordStore>) {
        let records = Arc::new(InMemoryRecordStore::new());
        let market = Arc::new(StaticMarketData::new());
        market.set_price("AAPL", 200.0, 190.0).await;
        market.set_price("TSLA", 240.0, 250.0).await;

        let registry = Arc::new(ToolRegistry::stockpulse(records.clone(), market).unwrap());
        (DigestJob::new(registry, records.clone(), outbox), records)
    }

    #[tokio::test]
    async fn test_digest_lists_portfolio_and_watchlist() {
        let (job, records) = job(Arc::new(Outbox::default())).await;
        let id = sid("+1");
        records.add_holding(&id, "AAPL", 10.0, 150.0).await.unwrap();
        records.add_watch(&id, "TSLA").await.unwrap();
        records.add_watch(&id, "UNLISTED").await.unwrap();

        let date = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
        let text = job.format_digest(&id, date).await.unwrap().unwrap();

        assert!(text.contains("📅 March 05, 2024"));
        assert!(text.contains("*AAPL*: 10 shares"));
        assert!(text.contains("💰 $200.00 📈 +5.26% today"));
        assert!(text.contains("✅ +$500.00 (+33.33%) total"));
        assert!(text.contains("💼 *Total Value*: $2,000.00"));
        assert!(text.contains("*TSLA*: $240.00 📉 -4.00%"));
        assert!(text.contains("*UNLISTED*: Price unavailable"));
    }

    #[tokio::test]
    async fn test_run_once_skips_empty_and_survives_failures() {
        let outbox = Arc::new(Outbox {
            fail_for: Some(sid("+2")),
            ..Outbox::default()
        });
        let (job, records) = job(outbox.clone()).await;

        records.add_holding(&sid("+1"), "AAPL", 1.0, 100.0).await.unwrap();
        records.add_watch(&sid("+2"), "TSLA").await.unwrap();
        records.add_watch(&sid("+3"), "TSLA").await.unwrap();
        records.remove_watch(&sid("+3"), "TSLA").await.unwrap();

        let report = job.run_once().await.unwrap();
        assert_eq!(report, DigestReport { sent: 1, skipped: 1, failed: 1 });

        let sent = outbox.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, sid("+1"));
    }

    #[test]
    fn test_watchlist_only_digest_has_no_portfolio_section() {
        let watchlist = vec![
            serde_json::json!({"ticker": "TSLA", "success": false, "error": "not found"}),
            serde_json::json!({"ticker": "NVDA", "success": true, "current_price": 120.5, "percent_change": -1.25}),
        ];
        let date = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();

        let mut out = String::new();
        write_digest(&mut out, date, &Value::Null, &[], &watchlist).unwrap();

        assert!(out.contains("📅 March 05, 2024"));
        assert!(!out.contains("Your Portfolio"));
        assert!(out.contains("*TSLA*: Price unavailable"));
        assert!(out.contains("*NVDA*: $120.50 📉 -1.25%"));
        assert!(out.ends_with("portfolio!"));
    }

    #[test]
    fn test_next_run_rolls_over_to_tomorrow() {
        let at = NaiveTime::from_hms_opt(8, 30, 0).unwrap();
        let day = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();

        let before = day.and_hms_opt(7, 0, 0).unwrap();
        assert_eq!(next_run(before, at), day.and_time(at));

        let exactly = day.and_time(at);
        let tomorrow = NaiveDate::from_ymd_opt(2024, 3, 6).unwrap().and_time(at);
        assert_eq!(next_run(exactly, at), tomorrow);
    }

    #[test]
    fn test_money_grouping() {
        assert_eq!(money(1234567.891), "1,234,567.89");
        assert_eq!(money(999.5), "999.50");
        assert_eq!(signed_money(-1200.0), "-$1,200.00");
        assert_eq!(format_shares(2.5), "2.5");
    }
}
