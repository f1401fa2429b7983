use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowError {
    // Domain errors
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    IllegalParameter(String),

    #[error("Unrecognized command type: {0}")]
    UnknownCommandType(String),

    #[error("Invalid callback identifier: {0}")]
    InvalidIdentifier(String),

    // Dispatch errors
    #[error("Command dispatch failed: {0}")]
    Dispatch(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FlowError {
    /// Domain failures caused by the caller's input rather than by the engine.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            FlowError::NotFound(_)
                | FlowError::IllegalParameter(_)
                | FlowError::UnknownCommandType(_)
                | FlowError::InvalidIdentifier(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, FlowError>;
