//! Error types for the sync core

use thiserror::Error;

use crate::api::{ApiError, FailureClass};

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Rejected by server: {message}")]
    Rejected { status: Option<u16>, message: String },

    #[error("Realtime channel error: {0}")]
    Realtime(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<ApiError> for SyncError {
    fn from(err: ApiError) -> Self {
        match err.class() {
            FailureClass::Transient => SyncError::Network(err.to_string()),
            FailureClass::Permanent => SyncError::Rejected {
                status: err.status(),
                message: err.to_string(),
            },
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

impl From<config::ConfigError> for SyncError {
    fn from(err: config::ConfigError) -> Self {
        SyncError::Config(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        SyncError::Realtime(err.to_string())
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
