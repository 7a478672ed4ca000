use axum::{http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::ErrorResponse;

/// Error codes exposed at the wire boundary
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ConnectionFailed,
    StaleSession,
    UnsupportedOperation,
    DocumentUnavailable,
    InvalidMessage,
    Internal,
}

/// Everything that can go wrong while synchronizing a document
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SyncError {
    #[error("connection failed after {attempts} attempts: {reason}")]
    ConnectionFailed { attempts: u32, reason: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("base version {base} is ahead of current version {current}")]
    FutureBaseVersion { base: u64, current: u64 },

    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("session is stale, rejoin required")]
    StaleSession,

    #[error("document '{doc_id}' is unavailable: {reason}")]
    DocumentUnavailable { doc_id: String, reason: String },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("document coordinator closed")]
    CoordinatorClosed,
}

impl SyncError {
    pub fn code(&self) -> ErrorCode {
        match self {
            SyncError::ConnectionFailed { .. } | SyncError::Transport(_) => ErrorCode::ConnectionFailed,
            SyncError::FutureBaseVersion { .. } | SyncError::StaleSession | SyncError::CoordinatorClosed => {
                ErrorCode::StaleSession
            }
            SyncError::UnsupportedOperation(_) => ErrorCode::UnsupportedOperation,
            SyncError::InvalidMessage(_) => ErrorCode::InvalidMessage,
            SyncError::DocumentUnavailable { .. } => ErrorCode::DocumentUnavailable,
            SyncError::Storage(_) => ErrorCode::Internal,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self.code() {
            ErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ErrorCode::StaleSession => StatusCode::CONFLICT,
            ErrorCode::UnsupportedOperation | ErrorCode::InvalidMessage => StatusCode::BAD_REQUEST,
            ErrorCode::DocumentUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(e: sqlx::Error) -> Self {
        SyncError::Storage(e.to_string())
    }
}

impl From<SyncError> for (StatusCode, Json<ErrorResponse>) {
    fn from(e: SyncError) -> Self {
        let status = e.status_code();
        (status, Json(ErrorResponse::new(status, e.to_string())))
    }
}
