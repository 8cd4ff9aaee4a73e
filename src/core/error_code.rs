use std::time::Duration;
use serde::{Deserialize, Serialize};

/// Upload error taxonomy shared by validation, transfer and the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UploadErrorCode {
    ValidationError,
    UnsupportedType,
    PayloadTooLarge,
    Unauthorized,
    Forbidden,
    ExpiredSession,
    RateLimited,
    Timeout,
    ServerError,
    NetworkError,
    Canceled,
    Unknown,
}

impl UploadErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            UploadErrorCode::ValidationError => "VALIDATION_ERROR",
            UploadErrorCode::UnsupportedType => "UNSUPPORTED_TYPE",
            UploadErrorCode::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            UploadErrorCode::Unauthorized => "UNAUTHORIZED",
            UploadErrorCode::Forbidden => "FORBIDDEN",
            UploadErrorCode::ExpiredSession => "EXPIRED_SESSION",
            UploadErrorCode::RateLimited => "RATE_LIMITED",
            UploadErrorCode::Timeout => "TIMEOUT",
            UploadErrorCode::ServerError => "SERVER_ERROR",
            UploadErrorCode::NetworkError => "NETWORK_ERROR",
            UploadErrorCode::Canceled => "CANCELED",
            UploadErrorCode::Unknown => "UNKNOWN",
        }
    }

    /// Parse a machine error code reported by the remote side.
    pub fn from_machine_code(code: &str) -> Option<Self> {
        let code = code.trim().to_ascii_uppercase();
        let parsed = match code.as_str() {
            "VALIDATION_ERROR" => UploadErrorCode::ValidationError,
            "UNSUPPORTED_TYPE" | "UNSUPPORTED_MEDIA_TYPE" => UploadErrorCode::UnsupportedType,
            "PAYLOAD_TOO_LARGE" | "ENTITY_TOO_LARGE" | "ENTITYTOOLARGE" => UploadErrorCode::PayloadTooLarge,
            "UNAUTHORIZED" => UploadErrorCode::Unauthorized,
            "FORBIDDEN" | "ACCESS_DENIED" | "ACCESSDENIED" => UploadErrorCode::Forbidden,
            "EXPIRED_SESSION" | "SESSION_EXPIRED" | "EXPIREDTOKEN" | "EXPIRED_TOKEN" => UploadErrorCode::ExpiredSession,
            "RATE_LIMITED" | "TOO_MANY_REQUESTS" | "SLOWDOWN" => UploadErrorCode::RateLimited,
            "TIMEOUT" | "REQUESTTIMEOUT" => UploadErrorCode::Timeout,
            "SERVER_ERROR" | "INTERNAL_ERROR" | "INTERNALERROR" => UploadErrorCode::ServerError,
            "NETWORK_ERROR" => UploadErrorCode::NetworkError,
            "CANCELED" | "CANCELLED" | "ABORTED" => UploadErrorCode::Canceled,
            "UNKNOWN" => UploadErrorCode::Unknown,
            _ => return None,
        };
        Some(parsed)
    }

    /// Message shown next to a failed file.
    pub fn message(self) -> &'static str {
        match self {
            UploadErrorCode::ValidationError => "The file did not pass validation.",
            UploadErrorCode::UnsupportedType => "This file type is not supported.",
            UploadErrorCode::PayloadTooLarge => "The file is too large to upload.",
            UploadErrorCode::Unauthorized => "Your session has ended. Please sign in again.",
            UploadErrorCode::Forbidden => "You do not have permission to upload this file.",
            UploadErrorCode::ExpiredSession => "Session expired. Please refresh to continue.",
            UploadErrorCode::RateLimited => "Too many uploads. Please wait a moment and try again.",
            UploadErrorCode::Timeout => "The upload timed out. Please try again.",
            UploadErrorCode::ServerError => "The server had a problem. Please try again.",
            UploadErrorCode::NetworkError => "Network error. Check your connection and try again.",
            UploadErrorCode::Canceled => "Upload canceled.",
            UploadErrorCode::Unknown => "Something went wrong. Please try again.",
        }
    }

    /// Plain retry has a chance of succeeding.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            UploadErrorCode::RateLimited
                | UploadErrorCode::Timeout
                | UploadErrorCode::ServerError
                | UploadErrorCode::NetworkError
                | UploadErrorCode::Unknown
        )
    }

    /// The upload authorization lapsed; a fresh destination is needed.
    pub fn requires_reauthorization(self) -> bool {
        matches!(
            self,
            UploadErrorCode::Unauthorized | UploadErrorCode::Forbidden | UploadErrorCode::ExpiredSession
        )
    }
}

impl std::fmt::Display for UploadErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure reported by a transfer primitive.
///
/// `status` is 0 when no response was received at all.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TransferFailure {
    pub status: u16,
    pub code: Option<String>,
    pub retry_after: Option<Duration>,
    pub message: Option<String>,
}

impl TransferFailure {
    pub fn http(status: u16) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self {
            status: 0,
            code: Some(UploadErrorCode::NetworkError.as_str().to_string()),
            retry_after: None,
            message: Some(message.into()),
        }
    }

    pub fn timeout() -> Self {
        Self {
            status: 0,
            code: Some(UploadErrorCode::Timeout.as_str().to_string()),
            retry_after: None,
            message: Some("Transfer timed out".to_string()),
        }
    }

    pub fn canceled() -> Self {
        Self {
            status: 0,
            code: Some(UploadErrorCode::Canceled.as_str().to_string()),
            retry_after: None,
            message: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Map the failure onto the taxonomy. A recognised machine code wins
    /// over the status code.
    pub fn classify(&self) -> UploadErrorCode {
        if let Some(code) = self.code.as_deref().and_then(UploadErrorCode::from_machine_code) {
            return code;
        }

        match self.status {
            0 => UploadErrorCode::NetworkError,
            400 | 415 => UploadErrorCode::UnsupportedType,
            401 => UploadErrorCode::Unauthorized,
            403 => UploadErrorCode::Forbidden,
            408 => UploadErrorCode::Timeout,
            413 => UploadErrorCode::PayloadTooLarge,
            429 => UploadErrorCode::RateLimited,
            500..=599 => UploadErrorCode::ServerError,
            _ => UploadErrorCode::Unknown,
        }
    }
}

impl std::fmt::Display for TransferFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "transfer failed with status {}", self.status)?;
        if let Some(code) = &self.code {
            write!(f, " ({})", code)?;
        }
        if let Some(message) = &self.message {
            write!(f, ": {}", message)?;
        }
        Ok(())
    }
}

impl std::error::Error for TransferFailure {}
