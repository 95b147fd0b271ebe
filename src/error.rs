use crate::config::TransferConfigError;
use std::io;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransferError {
    /// Transport failure, 404 or 5xx.
    #[error("Network error: {0}")]
    Network(String),

    /// Resume assumptions no longer hold; the task must be restarted.
    #[error("Breakpoint expired: {0}")]
    ProtocolExpiry(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid argument: {0}")]
    Argument(String),

    #[error("Unknown transfer state: {0}")]
    UnknownState(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Task {0} must be saved before it is started")]
    NotSaved(String),

    #[error("Task {0} not found")]
    TaskNotFound(String),
}

impl TransferError {
    /// True for the failures that can only be cleared by `restart()`.
    pub fn requires_restart(&self) -> bool {
        matches!(self, TransferError::ProtocolExpiry(_) | TransferError::Storage(_))
    }
}

impl From<io::Error> for TransferError {
    fn from(err: io::Error) -> Self {
        TransferError::Io(err.to_string())
    }
}

impl From<sqlx::Error> for TransferError {
    fn from(err: sqlx::Error) -> Self {
        TransferError::Database(err.to_string())
    }
}

impl From<reqwest::Error> for TransferError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_builder() {
            TransferError::Argument(err.to_string())
        } else {
            TransferError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for TransferError {
    fn from(err: serde_json::Error) -> Self {
        TransferError::Argument(err.to_string())
    }
}

impl From<url::ParseError> for TransferError {
    fn from(err: url::ParseError) -> Self {
        TransferError::Argument(err.to_string())
    }
}

impl From<TransferConfigError> for TransferError {
    fn from(err: TransferConfigError) -> Self {
        TransferError::Config(err.to_string())
    }
}

impl From<reqwest::header::ToStrError> for TransferError {
    fn from(err: reqwest::header::ToStrError) -> Self {
        TransferError::Http(err.to_string())
    }
}
