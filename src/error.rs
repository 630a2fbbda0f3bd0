//! Error taxonomy for the verification core.
//!
//! Every variant is recoverable at the caller boundary. The HTTP layer maps
//! each one to a status code via [`IntoResponse`]; store failures are logged in
//! full and returned to clients with a sanitized message.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Session {0} is closed")]
    SessionClosed(Uuid),

    #[error("Session {0} not found")]
    UnknownSession(Uuid),

    #[error("No session found for class {0}")]
    NoActiveSession(String),

    #[error("Class {0} already has an open session")]
    SessionAlreadyOpen(String),

    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Invalid window: {0}")]
    InvalidWindow(String),

    #[error("Student {0} not found")]
    UnknownStudent(Uuid),

    #[error("No student registered with RFID tag {0}")]
    UnknownTag(String),

    #[error("RFID tag {0} is already registered")]
    DuplicateTag(String),

    #[error("Store error: {0}")]
    Store(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn invalid_event(msg: impl Into<String>) -> Self {
        Self::InvalidEvent(msg.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::UnknownSession(_)
            | Self::NoActiveSession(_)
            | Self::UnknownStudent(_)
            | Self::UnknownTag(_) => StatusCode::NOT_FOUND,
            Self::SessionClosed(_) | Self::SessionAlreadyOpen(_) | Self::DuplicateTag(_) => {
                StatusCode::CONFLICT
            }
            Self::InvalidEvent(_) | Self::InvalidWindow(_) => StatusCode::BAD_REQUEST,
            Self::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short machine-readable name, used in batch ingest results.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionClosed(_) => "session_closed",
            Self::UnknownSession(_) => "unknown_session",
            Self::NoActiveSession(_) => "no_active_session",
            Self::SessionAlreadyOpen(_) => "session_already_open",
            Self::InvalidEvent(_) => "invalid_event",
            Self::InvalidWindow(_) => "invalid_window",
            Self::UnknownStudent(_) => "unknown_student",
            Self::UnknownTag(_) => "unknown_tag",
            Self::DuplicateTag(_) => "duplicate_tag",
            Self::Store(_) => "internal",
        }
    }

    /// Message that is safe to hand to a client.
    pub fn public_message(&self) -> String {
        match self {
            Self::Store(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("Internal error: {}", self);
        } else {
            tracing::warn!("Request rejected: {}", self);
        }

        let body = serde_json::json!({
            "error": self.kind(),
            "message": self.public_message(),
        });
        (status, Json(body)).into_response()
    }
}
