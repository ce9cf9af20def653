//! Outbound message delivery for digests

use crate::config::TwilioSettings;
use crate::error::OrchestrationError;
use crate::models::SessionId;
use crate::Result;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info};

const TWILIO_API_BASE: &str = "https://api.twilio.com/2010-04-01";

#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, session_id: &SessionId, body: &str) -> Result<()>;
}

/// WhatsApp delivery through the Twilio Messages API
pub struct TwilioNotifier {
    client: Client,
    settings: TwilioSettings,
    base_url: String,
}

impl TwilioNotifier {
    pub fn new(settings: TwilioSettings) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .timeout(Duration::from_secs(20))
            .build()?;

        Ok(Self {
            client,
            settings,
            base_url: TWILIO_API_BASE.to_string(),
        })
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/Accounts/{}/Messages.json",
            self.base_url, self.settings.account_sid
        )
    }
}

/// Twilio addresses WhatsApp users as `whatsapp:<number>`.
pub(crate) fn whatsapp_address(session_id: &SessionId) -> String {
    format!("whatsapp:{}", session_id.as_str())
}

#[async_trait::async_trait]
impl Notifier for TwilioNotifier {
    async fn send(&self, session_id: &SessionId, body: &str) -> Result<()> {
        let to = whatsapp_address(session_id);
        let form = [
            ("From", self.settings.whatsapp_number.as_str()),
            ("To", to.as_str()),
            ("Body", body),
        ];

        let response = self
            .client
            .post(self.messages_url())
            .basic_auth(&self.settings.account_sid, Some(&self.settings.auth_token))
            .form(&form)
            .send()
            .await
            .map_err(|e| OrchestrationError::NotificationError(format!("Twilio request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response
                .json::<Value>()
                .await
                .ok()
                .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
                .unwrap_or_default();
            return Err(OrchestrationError::NotificationError(format!(
                "Twilio returned {}: {}",
                status, detail
            )));
        }

        debug!(session = %session_id.log_key(), "Twilio accepted message");
        Ok(())
    }
}

/// Writes digests to the log instead of sending them
#[derive(Default)]
pub struct LogNotifier;

#[async_trait::async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, session_id: &SessionId, body: &str) -> Result<()> {
        info!(
            session = %session_id.log_key(),
            chars = body.chars().count(),
            "Digest not sent (no Twilio credentials):\n{}",
            body
        );
        Ok(())
    }
}
