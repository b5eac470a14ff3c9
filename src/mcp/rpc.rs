//! JSON-RPC protocol representations and formatting utilities
//!
//! Classifies inbound frames and builds the JSON-RPC payloads the transports enqueue.

use rust_mcp_sdk::schema::{
    JsonrpcErrorResponse, JsonrpcMessage, JsonrpcResultResponse, RequestId, Result as McpResult,
    RpcError,
};
use serde_json::{json, Value};

use crate::errors::AppError;

/// A parsed inbound frame, ready for the message handler.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Request {
        id: Value,
        method: String,
        params: Option<Value>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
    /// A client's reply to a server-initiated request.
    Response(Value),
}

impl InboundMessage {
    pub fn id(&self) -> Option<&Value> {
        match self {
            Self::Request { id, .. } => Some(id),
            Self::Response(value) => value.get("id"),
            Self::Notification { .. } => None,
        }
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request { method, .. } | Self::Notification { method, .. } => Some(method),
            Self::Response(_) => None,
        }
    }
}

/// Parses one inbound frame. Failures carry the JSON-RPC error to report on the same
/// connection.
pub fn parse_inbound(body: &[u8]) -> Result<InboundMessage, AppError> {
    let payload: Value = serde_json::from_slice(body).map_err(|_| AppError::parse_error())?;

    if !payload.is_object() {
        return Err(AppError::invalid_request(None));
    }

    let request_id = payload.get("id").cloned();
    if payload.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
        return Err(AppError::invalid_request(request_id));
    }

    let parsed: JsonrpcMessage = serde_json::from_value(payload.clone())
        .map_err(|_| AppError::invalid_request(request_id.clone()))?;

    match parsed {
        JsonrpcMessage::Request(request) => {
            if request.method.trim().is_empty() {
                return Err(AppError::invalid_request(request_id));
            }
            Ok(InboundMessage::Request {
                id: request_id_to_value(request.id),
                method: request.method,
                params: request.params.map(Value::Object),
            })
        }
        JsonrpcMessage::Notification(notification) => {
            if notification.method.trim().is_empty() {
                return Err(AppError::invalid_request(None));
            }
            Ok(InboundMessage::Notification {
                method: notification.method,
                params: notification.params.map(Value::Object),
            })
        }
        JsonrpcMessage::ResultResponse(_) | JsonrpcMessage::ErrorResponse(_) => {
            Ok(InboundMessage::Response(payload))
        }
    }
}

pub fn is_json_rpc_error(value: &Value) -> bool {
    value.get("error").is_some()
}

pub fn app_error_to_json_rpc(id: Option<Value>, err: AppError) -> Value {
    match err {
        AppError::BadRequest { code, message } => json_rpc_error_with_data(
            id,
            -32602,
            "Invalid params",
            Some(json!({
                "code": code,
                "message": message,
                "details": {}
            })),
        ),
        AppError::Unauthorized { code, message } => json_rpc_error_with_data(
            id,
            -32001,
            "Unauthorized",
            Some(json!({
                "code": code,
                "message": message,
                "details": {}
            })),
        ),
        AppError::Parse { code, message, .. } => json_rpc_error(id, code, message),
        AppError::CapacityExceeded { .. }
        | AppError::NotFound { .. }
        | AppError::Gone { .. }
        | AppError::Draining { .. }
        | AppError::WriteFailure { .. }
        | AppError::Internal { .. } => json_rpc_error(id, -32603, "Internal error"),
    }
}

pub fn json_rpc_error(id: Option<Value>, code: i32, message: &str) -> Value {
    json_rpc_error_with_data(id, code, message, None)
}

pub fn json_rpc_error_with_data(
    id: Option<Value>,
    code: i32,
    message: &str,
    data: Option<Value>,
) -> Value {
    let response = JsonrpcErrorResponse::new(
        RpcError {
            code: i64::from(code),
            data,
            message: message.to_string(),
        },
        id.as_ref().and_then(value_to_request_id),
    );
    serde_json::to_value(response).expect("jsonrpc error response serialization")
}

pub fn json_rpc_result(id: Option<Value>, result: Value) -> Value {
    if let Some(request_id) = id.as_ref().and_then(value_to_request_id) {
        let extra = result.as_object().cloned();
        let response = JsonrpcResultResponse::new(request_id, McpResult { meta: None, extra });
        return serde_json::to_value(response).expect("jsonrpc result response serialization");
    }

    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": result
    })
}

pub fn json_rpc_notification(method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params
    })
}

pub fn value_to_request_id(value: &Value) -> Option<RequestId> {
    if let Some(string_id) = value.as_str() {
        return Some(RequestId::String(string_id.to_string()));
    }

    value.as_i64().map(RequestId::Integer)
}

pub fn request_id_to_value(id: RequestId) -> Value {
    match id {
        RequestId::String(value) => Value::String(value),
        RequestId::Integer(value) => Value::Number(value.into()),
    }
}
