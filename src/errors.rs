//! Domain error taxonomy and its single HTTP mapping.
//!
//! Every rejection carries a stable `kind` string so clients can tell
//! "retry is safe" (transient storage failures) from "do not retry"
//! (validation, checksum, exhausted token) without parsing messages.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::io;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ShareError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("checksum mismatch: {0}")]
    ChecksumMismatch(String),

    #[error("owner quota exceeded")]
    QuotaExceeded,

    #[error("upload session `{0}` not found")]
    SessionNotFound(Uuid),

    #[error("upload session `{0}` has expired")]
    SessionExpired(Uuid),

    #[error("session state conflict: {0}")]
    StateConflict(String),

    #[error("chunk index {index} out of range 0..{total}")]
    IndexOutOfRange { index: i64, total: i64 },

    #[error("chunk of {got} bytes exceeds the {max} byte limit")]
    ChunkTooLarge { got: u64, max: u64 },

    #[error("file `{0}` not found")]
    FileNotFound(Uuid),

    #[error("download link not found")]
    LinkNotFound,

    #[error("download token invalid")]
    TokenInvalid,

    #[error("download token expired")]
    TokenExpired,

    #[error("download link exhausted")]
    TokenExhausted,

    #[error("password required")]
    PasswordRequired,

    #[error("password incorrect")]
    PasswordIncorrect,

    #[error("unauthorized")]
    Unauthorized,

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type ShareResult<T> = Result<T, ShareError>;

impl ShareError {
    /// Stable machine-readable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation-failed",
            Self::ChecksumMismatch(_) => "checksum-mismatch",
            Self::QuotaExceeded => "quota-exceeded",
            Self::SessionNotFound(_) => "session-not-found",
            Self::SessionExpired(_) => "session-expired",
            Self::StateConflict(_) => "session-state-conflict",
            Self::IndexOutOfRange { .. } => "index-out-of-range",
            Self::ChunkTooLarge { .. } => "payload-too-large",
            Self::FileNotFound(_) => "file-not-found",
            Self::LinkNotFound => "link-not-found",
            Self::TokenInvalid => "token-invalid",
            Self::TokenExpired => "token-expired",
            Self::TokenExhausted => "token-exhausted",
            Self::PasswordRequired => "password-required",
            Self::PasswordIncorrect => "password-incorrect",
            Self::Unauthorized => "unauthorized",
            Self::Sqlx(_) | Self::Io(_) => "storage-failure",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) | Self::ChecksumMismatch(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::QuotaExceeded => StatusCode::FORBIDDEN,
            Self::SessionNotFound(_) | Self::FileNotFound(_) | Self::LinkNotFound => {
                StatusCode::NOT_FOUND
            }
            Self::SessionExpired(_) => StatusCode::GONE,
            Self::StateConflict(_) | Self::IndexOutOfRange { .. } => StatusCode::CONFLICT,
            Self::ChunkTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::TokenInvalid => StatusCode::BAD_REQUEST,
            Self::TokenExpired | Self::TokenExhausted => StatusCode::GONE,
            Self::PasswordRequired | Self::PasswordIncorrect | Self::Unauthorized => {
                StatusCode::UNAUTHORIZED
            }
            Self::Sqlx(_) | Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether a client may retry the same call unchanged.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Sqlx(_) | Self::Io(_))
    }
}

impl IntoResponse for ShareError {
    fn into_response(self) -> Response {
        let status = self.status();
        // Internal failure details stay in the logs, not the response.
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("internal error: {self}");
            "internal server error".to_string()
        } else {
            self.to_string()
        };

        let body = Json(json!({
            "error": message,
            "kind": self.kind(),
            "status": status.as_u16(),
        }));
        (status, body).into_response()
    }
}

/// Return true if a SQLx error indicates a unique constraint violation.
/// Used where an insert race is resolved as an idempotent duplicate.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}
