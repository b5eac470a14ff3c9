use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::mcp::rpc::json_rpc_error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("unauthorized: {message}")]
    Unauthorized {
        code: &'static str,
        message: &'static str,
    },
    #[error("bad request: {message}")]
    BadRequest {
        code: &'static str,
        message: &'static str,
    },
    #[error("session limit of {limit} reached")]
    CapacityExceeded { limit: usize },
    #[error("session {session_id} not found")]
    NotFound { session_id: String },
    #[error("session cannot be resumed: {message}")]
    Gone { message: String },
    #[error("malformed inbound message: {message}")]
    Parse {
        id: Option<Value>,
        code: i32,
        message: &'static str,
    },
    #[error("session {session_id} is draining")]
    Draining { session_id: String },
    #[error("write to session {session_id} failed")]
    WriteFailure { session_id: String },
    #[error("internal error")]
    Internal { code: &'static str, message: String },
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    pub details: serde_json::Value,
}

impl AppError {
    pub fn unauthorized(code: &'static str, message: &'static str) -> Self {
        Self::Unauthorized { code, message }
    }

    pub fn bad_request(code: &'static str, message: &'static str) -> Self {
        Self::BadRequest { code, message }
    }

    pub fn not_found(session_id: impl Into<String>) -> Self {
        Self::NotFound {
            session_id: session_id.into(),
        }
    }

    pub fn gone(message: impl Into<String>) -> Self {
        Self::Gone {
            message: message.into(),
        }
    }

    pub fn parse_error() -> Self {
        Self::Parse {
            id: None,
            code: -32700,
            message: "Parse error",
        }
    }

    pub fn invalid_request(id: Option<Value>) -> Self {
        Self::Parse {
            id,
            code: -32600,
            message: "Invalid Request",
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            code: "internal_error",
            message: message.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            Self::Unauthorized { code, message } => {
                (StatusCode::UNAUTHORIZED, code, message.to_string())
            }
            Self::BadRequest { code, message } => {
                (StatusCode::BAD_REQUEST, code, message.to_string())
            }
            Self::CapacityExceeded { limit } => (
                StatusCode::SERVICE_UNAVAILABLE,
                "capacity_exceeded",
                format!("session limit of {limit} reached"),
            ),
            Self::NotFound { session_id } => (
                StatusCode::NOT_FOUND,
                "session_not_found",
                format!("session {session_id} not found"),
            ),
            Self::Gone { message } => (StatusCode::GONE, "session_gone", message),
            Self::Parse { id, code, message } => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json_rpc_error(id, code, message)),
                )
                    .into_response();
            }
            Self::Draining { session_id } => (
                StatusCode::CONFLICT,
                "session_draining",
                format!("session {session_id} is closing"),
            ),
            Self::WriteFailure { session_id } => {
                tracing::error!(session_id = %session_id, "write failure surfaced to a response");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "write_failure",
                    "internal server error".to_string(),
                )
            }
            Self::Internal { code, message } => {
                tracing::error!(error = %message, "request failed with internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    code,
                    "internal server error".to_string(),
                )
            }
        };

        (
            status,
            Json(ErrorResponse {
                code: code.to_string(),
                message,
                details: json!({}),
            }),
        )
            .into_response()
    }
}
