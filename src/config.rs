//! Runtime settings
//!
//! Read once at startup from the process environment (after loading an
//! optional `.env`). Malformed numbers are rejected rather than defaulted.

use crate::error::OrchestrationError;
use crate::model::RetryPolicy;
use crate::Result;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct TwilioSettings {
    pub account_sid: String,
    pub auth_token: String,
    pub whatsapp_number: String,
}

#[derive(Debug, Clone)]
pub struct Settings {
    // Model
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    pub model_timeout: Duration,
    pub model_temperature: f32,
    pub retry: RetryPolicy,

    // Turn loop
    pub max_tool_rounds: u32,
    pub tool_timeout: Duration,
    pub turn_timeout: Duration,

    // Server
    pub host: String,
    pub port: u16,

    // Storage
    pub database_url: Option<String>,

    // Daily digest
    pub digest_enabled: bool,
    pub daily_update_hour: u32,
    pub daily_update_minute: u32,
    pub twilio: Option<TwilioSettings>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            gemini_api_key: None,
            gemini_model: "gemini-2.0-flash".to_string(),
            model_timeout: Duration::from_secs(30),
            model_temperature: 0.7,
            retry: RetryPolicy::default(),
            max_tool_rounds: 6,
            tool_timeout: Duration::from_secs(20),
            turn_timeout: Duration::from_secs(90),
            host: "0.0.0.0".to_string(),
            port: 8000,
            database_url: None,
            digest_enabled: true,
            daily_update_hour: 8,
            daily_update_minute: 30,
            twilio: None,
        }
    }
}

impl Settings {
    /// Load `.env` (if present) and read the process environment.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build settings from any key → value source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Settings::default();

        let retry = RetryPolicy {
            max_attempts: parse_or(&get, "MODEL_RETRY_ATTEMPTS", defaults.retry.max_attempts)?,
            base_ms: parse_or(&get, "MODEL_RETRY_BASE_MS", defaults.retry.base_ms)?,
            cap_ms: parse_or(&get, "MODEL_RETRY_CAP_MS", defaults.retry.cap_ms)?,
            ..defaults.retry.clone()
        };
        if retry.max_attempts == 0 {
            return Err(OrchestrationError::ConfigError(
                "MODEL_RETRY_ATTEMPTS must be at least 1".to_string(),
            ));
        }

        let max_tool_rounds: u32 = parse_or(&get, "MAX_TOOL_ROUNDS", defaults.max_tool_rounds)?;
        if max_tool_rounds == 0 {
            return Err(OrchestrationError::ConfigError("MAX_TOOL_ROUNDS must be at least 1".to_string()));
        }

        let daily_update_hour: u32 = parse_or(&get, "DAILY_UPDATE_HOUR", defaults.daily_update_hour)?;
        let daily_update_minute: u32 = parse_or(&get, "DAILY_UPDATE_MINUTE", defaults.daily_update_minute)?;
        if daily_update_hour > 23 || daily_update_minute > 59 {
            return Err(OrchestrationError::ConfigError(format!(
                "Invalid daily update time {:02}:{:02}",
                daily_update_hour, daily_update_minute
            )));
        }

        let twilio = match (get("TWILIO_ACCOUNT_SID"), get("TWILIO_AUTH_TOKEN")) {
            (Some(account_sid), Some(auth_token)) => Some(TwilioSettings {
                account_sid,
                auth_token,
                whatsapp_number: get("TWILIO_WHATSAPP_NUMBER")
                    .unwrap_or_else(|| "whatsapp:+14155238886".to_string()),
            }),
            _ => None,
        };

        Ok(Self {
            gemini_api_key: get("GEMINI_API_KEY"),
            gemini_model: get("GEMINI_MODEL").unwrap_or(defaults.gemini_model),
            model_timeout: Duration::from_secs(parse_or(&get, "MODEL_TIMEOUT_SECS", 30)?),
            model_temperature: parse_or(&get, "MODEL_TEMPERATURE", defaults.model_temperature)?,
            retry,
            max_tool_rounds,
            tool_timeout: Duration::from_secs(parse_or(&get, "TOOL_TIMEOUT_SECS", 20)?),
            turn_timeout: Duration::from_secs(parse_or(&get, "TURN_TIMEOUT_SECS", 90)?),
            host: get("HOST").unwrap_or(defaults.host),
            port: parse_or(&get, "PORT", defaults.port)?,
            database_url: get("DATABASE_URL").or_else(|| get("POSTGRES_URL")),
            digest_enabled: parse_bool_or(&get, "DIGEST_ENABLED", defaults.digest_enabled)?,
            daily_update_hour,
            daily_update_minute,
            twilio,
        })
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|_| OrchestrationError::ConfigError(format!("{} has invalid value '{}'", key, raw))),
        None => Ok(default),
    }
}

fn parse_bool_or<G>(get: &G, key: &str, default: bool) -> Result<bool>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key).map(|v| v.to_ascii_lowercase()) {
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
        Some(v) => Err(OrchestrationError::ConfigError(format!("{} has invalid value '{}'", key, v))),
        None => Ok(default),
    }
}
