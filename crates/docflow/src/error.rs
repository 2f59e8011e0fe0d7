//! Error types for docflow

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

/// Result type alias for docflow operations
pub type Result<T> = std::result::Result<T, Error>;

/// Docflow errors
///
/// The first six variants form the ingestion taxonomy: validation and conflict
/// errors surface to the uploader, transient errors are retried by the indexer,
/// permanent errors go straight to the dead-letter topic.
#[derive(Debug, Error)]
pub enum Error {
    /// Bad input: empty file, disallowed type, infected content
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Byte-identical content already stored
    #[error("Duplicate content: already stored as document {existing_id}")]
    Conflict { existing_id: Uuid },

    /// Missing document, blob or job
    #[error("Not found: {0}")]
    NotFound(String),

    /// Storage or network hiccup, worth retrying
    #[error("Transient failure: {0}")]
    Transient(String),

    /// Corrupt or unparseable content, never retried
    #[error("Permanent failure: {0}")]
    Permanent(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// HTTP request error
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a not-found error
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    /// Create a transient error
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    /// Create a permanent error
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Whether another attempt might succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Io(_) | Self::Http(_))
    }

    /// Short machine-readable kind, used in API bodies and dead-letter reasons
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::Conflict { .. } => "conflict",
            Self::NotFound(_) => "not_found",
            Self::Transient(_) => "transient_error",
            Self::Permanent(_) => "permanent_error",
            Self::Config(_) => "config_error",
            Self::Io(_) => "io_error",
            Self::Json(_) => "json_error",
            Self::Database(_) => "database_error",
            Self::Http(_) => "http_error",
            Self::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::Conflict { .. } => StatusCode::CONFLICT,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Transient(_) | Error::Http(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Permanent(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::Json(_) => StatusCode::BAD_REQUEST,
            Error::Config(_) | Error::Io(_) | Error::Database(_) | Error::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let mut error = json!({
            "type": self.kind(),
            "message": self.to_string(),
        });
        if let Error::Conflict { existing_id } = &self {
            error["existing_id"] = json!(existing_id);
        }

        (status, Json(json!({ "error": error }))).into_response()
    }
}
