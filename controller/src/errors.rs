//! Error types for the OTA controller

use thiserror::Error;

/// Main error type for the OTA controller
#[derive(Error, Debug)]
pub enum OtaError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// A conditional write lost against a concurrent writer
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Store error: {0}")]
    StoreError(String),

    #[error("MQTT error: {0}")]
    MqttError(String),

    #[error("RPC error: {0}")]
    RpcError(String),

    #[error("Invalid transition: {event} from {from}")]
    InvalidTransition { from: String, event: String },

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl OtaError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, OtaError::NotFound(_))
    }

    /// Errors worth retrying with backoff: infrastructure hiccups and lost races.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            OtaError::IoError(_)
                | OtaError::HttpError(_)
                | OtaError::Conflict(_)
                | OtaError::StoreError(_)
                | OtaError::MqttError(_)
                | OtaError::RpcError(_)
        )
    }
}

impl From<anyhow::Error> for OtaError {
    fn from(err: anyhow::Error) -> Self {
        OtaError::Internal(err.to_string())
    }
}
