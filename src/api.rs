//! HTTP gateway
//!
//! Twilio's WhatsApp webhook plus a JSON chat endpoint, both thin wrappers
//! around `Agent::handle_incoming`. Internal errors never reach the response.

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Form, Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::agent::Agent;
use crate::models::SessionId;
use crate::Result;

const SERVICE_NAME: &str = "StockPulse WhatsApp Agent";

/// =============================
/// Request Models
/// =============================

/// Form fields Twilio posts for an inbound WhatsApp message
#[derive(Debug, Deserialize)]
pub struct TwilioWebhook {
    #[serde(rename = "Body")]
    pub body: String,
    #[serde(rename = "From")]
    pub from: String,
    #[serde(rename = "To")]
    pub to: Option<String>,
    #[serde(rename = "MessageSid")]
    pub message_sid: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub session_id: String,
    pub message: String,
}

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub agent: Arc<Agent>,
}

/// =============================
/// Helpers
/// =============================

pub fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(ch),
        }
    }
    out
}

fn twiml(message: &str) -> Response {
    let body = format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<Response>\n    <Message>{}</Message>\n</Response>",
        escape_xml(message)
    );
    ([(header::CONTENT_TYPE, "application/xml")], body).into_response()
}

/// =============================
/// Health Endpoints
/// =============================

async fn root() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn health(State(state): State<ApiState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "agent": "ready",
        "tools": state.agent.registry().len(),
        "active_sessions": state.agent.active_sessions(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

/// =============================
/// WhatsApp Webhook
/// =============================

async fn whatsapp_webhook(State(state): State<ApiState>, Form(msg): Form<TwilioWebhook>) -> Response {
    let log_key = SessionId::from_address(&msg.from)
        .map(|id| id.log_key())
        .unwrap_or_else(|_| "invalid".to_string());
    info!(
        session = %log_key,
        message_sid = msg.message_sid.as_deref().unwrap_or("-"),
        chars = msg.body.chars().count(),
        "Received WhatsApp message"
    );

    let reply = state.agent.handle_incoming(&msg.from, &msg.body).await;

    info!(session = %log_key, chars = reply.chars().count(), "Sending WhatsApp reply");
    twiml(&reply)
}

async fn whatsapp_verify() -> &'static str {
    "StockPulse WhatsApp Webhook is active"
}

/// =============================
/// JSON Chat
/// =============================

async fn chat_handler(
    State(state): State<ApiState>,
    Json(req): Json<ChatRequest>,
) -> (StatusCode, Json<ApiResponse>) {
    let session_id = match SessionId::from_address(&req.session_id) {
        Ok(id) => id,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ApiResponse::error("session_id must not be empty".into())),
            )
        }
    };

    let reply = state.agent.handle_incoming(&req.session_id, &req.message).await;

    (
        StatusCode::OK,
        Json(ApiResponse::success(serde_json::json!({
            "session_id": session_id.as_str(),
            "reply": reply,
        }))),
    )
}

/// =============================
/// Router
/// =============================

pub fn create_router(agent: Arc<Agent>) -> Router {
    let state = ApiState { agent };

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/whatsapp", post(whatsapp_webhook).get(whatsapp_verify))
        .route("/api/chat", post(chat_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    agent: Arc<Agent>,
    address: &str,
    shutdown: CancellationToken,
) -> Result<()> {
    let router = create_router(agent);

    let listener = tokio::net::TcpListener::bind(address).await?;

    info!("API Server listening on http://{}", address);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}
