use thiserror::Error;
use super::types::{UploadId, UploadState};

#[derive(Error, Debug)]
pub enum UploaderError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Image codec error: {0}")]
    Codec(#[from] image::ImageError),

    #[error("Authorization failed: status code {status_code}, message: {message}")]
    Authorization {
        status_code: u16,
        message: String,
    },

    #[error("Upload task not found: {0}")]
    TaskNotFound(UploadId),

    #[error("Cannot {action} task in state {state}")]
    InvalidState {
        action: &'static str,
        state: UploadState,
    },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Scheduler shut down")]
    SchedulerShutdown,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl UploaderError {
    pub fn authorization(status_code: u16, message: impl Into<String>) -> Self {
        Self::Authorization {
            status_code,
            message: message.into(),
        }
    }

    pub fn invalid_state(action: &'static str, state: UploadState) -> Self {
        Self::InvalidState { action, state }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

/// Error alias
pub type Result<T, E = UploaderError> = std::result::Result<T, E>;
