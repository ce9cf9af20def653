//! Error types for the StockPulse agent

use thiserror::Error;

/// Result type alias for agent operations
pub type Result<T> = std::result::Result<T, OrchestrationError>;

#[derive(Error, Debug)]
pub enum OrchestrationError {

    // =============================
    // Turn Errors
    // =============================

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Model transport error: {0}")]
    ModelTransport(String),

    #[error("Model response error: {0}")]
    ModelResponse(String),

    #[error("Tool loop exceeded {rounds} model/tool rounds")]
    LoopLimitExceeded { rounds: u32 },

    #[error("Checkpoint error: {0}")]
    CheckpointError(String),

    #[error("Turn cancelled: {0}")]
    Cancelled(String),

    #[error("Internal error: {0}")]
    Internal(String),

    // =============================
    // Tool Errors
    // =============================

    #[error("Tool error: {0}")]
    ToolError(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Duplicate tool name: {0}")]
    DuplicateTool(String),

    #[error("Invalid tool input: {0}")]
    InvalidToolInput(String),

    #[error("Market data error: {0}")]
    MarketDataError(String),

    // =============================
    // Infrastructure Errors
    // =============================

    #[error("Notification error: {0}")]
    NotificationError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl OrchestrationError {
    /// Whether a failed model invocation is worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            OrchestrationError::ModelTransport(_) => true,
            OrchestrationError::HttpError(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(OrchestrationError::ModelTransport("timeout".into()).is_transient());
        assert!(!OrchestrationError::ModelResponse("no candidates".into()).is_transient());
        assert!(!OrchestrationError::LoopLimitExceeded { rounds: 6 }.is_transient());
    }

    #[test]
    fn test_loop_limit_is_distinct_from_model_failure() {
        let err = OrchestrationError::LoopLimitExceeded { rounds: 3 };
        assert_eq!(err.to_string(), "Tool loop exceeded 3 model/tool rounds");
        assert!(!matches!(err, OrchestrationError::ModelResponse(_)));
        assert!(!OrchestrationError::Internal("turn task failed".into()).is_transient());
    }
}
