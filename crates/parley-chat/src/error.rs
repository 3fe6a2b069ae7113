use thiserror::Error;
use uuid::Uuid;

use parley_types::events::ErrorCode;

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("Thread not found: {0}")]
    ThreadNotFound(Uuid),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Server error: {0}")]
    Server(#[from] anyhow::Error),
}

impl ChatError {
    pub fn denied(reason: impl Into<String>) -> Self {
        Self::AccessDenied(reason.into())
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::Validation(reason.into())
    }

    /// Wire code for `error` frames.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::ThreadNotFound(_) => ErrorCode::ThreadNotFound,
            Self::AccessDenied(_) => ErrorCode::Forbidden,
            Self::Validation(_) => ErrorCode::ValidationError,
            Self::Server(_) => ErrorCode::ServerError,
        }
    }

    /// Message safe to show a client. Server errors are not echoed verbatim.
    pub fn public_message(&self) -> String {
        match self {
            Self::Server(_) => "internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

pub type ChatResult<T> = std::result::Result<T, ChatError>;
