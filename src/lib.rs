//! StockPulse Agent
//!
//! A WhatsApp stock assistant built around a tool-calling loop:
//! - One inbound message runs one turn against the session's transcript
//! - The model either answers or requests tools; tools run concurrently
//! - Every turn is checkpointed per session so conversations resume
//! - Portfolio and watchlist records back the tool set
//! - A daily digest pushes portfolio summaries to subscribed users
//!
//! TURN LOOP:
//! INPUT → MODEL → TOOLS? → MODEL → ... → REPLY → CHECKPOINT

pub mod agent;
pub mod api;
pub mod config;
pub mod digest;
pub mod error;
pub mod execution;
pub mod gemini;
pub mod graph;
pub mod memory;
pub mod model;
pub mod models;
pub mod records;
pub mod router;
pub mod state;
pub mod tools;

pub use error::Result;

// Re-export common types
pub use agent::Agent;
pub use config::Settings;
pub use models::*;
