use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

use crate::protocol::Reply;

/// Main error type for storage engine operations
#[derive(Debug, Error)]
pub enum ShardisError {
    #[error("ERR no such key")]
    KeyNotFound(String),

    #[error("ERR value is not an integer or out of range")]
    NotAnInteger,

    #[error("ERR invalid expire time in '{0}' command")]
    InvalidExpire(String),

    #[error("ERR syntax error")]
    Syntax,

    #[error("ERR wrong number of arguments for '{0}' command")]
    WrongArity(String),

    #[error("ERR unknown command '{0}'")]
    UnknownCommand(String),

    #[error("ERR invalid request: {0}")]
    InvalidRequest(String),

    #[error("ERR serialization error: {0}")]
    SerializationError(String),

    #[error("ERR io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ERR internal error: {0}")]
    InternalError(String),
}

impl ShardisError {
    /// Get HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::KeyNotFound(_) => StatusCode::NOT_FOUND,
            Self::NotAnInteger
            | Self::InvalidExpire(_)
            | Self::Syntax
            | Self::WrongArity(_)
            | Self::UnknownCommand(_)
            | Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::SerializationError(_) | Self::Io(_) | Self::InternalError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<serde_json::Error> for ShardisError {
    fn from(e: serde_json::Error) -> Self {
        ShardisError::SerializationError(e.to_string())
    }
}

impl From<ShardisError> for Reply {
    fn from(e: ShardisError) -> Self {
        Reply::error(e.to_string())
    }
}

/// Implement IntoResponse for Axum integration
impl IntoResponse for ShardisError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({
            "error": self.to_string(),
            "code": status.as_u16(),
        }));

        (status, body).into_response()
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, ShardisError>;
