//! Boundary between the transports and the request handlers that run on parsed messages
//!
//! Transports hand every parsed inbound message to a [`MessageHandler`] together with the
//! session's [`UserContext`]. A returned value is enqueued as the reply; anything sent
//! later (progress, notifications) goes through the [`Outbox`].

use std::sync::Arc;

use async_trait::async_trait;
use rust_mcp_sdk::schema::{
    Implementation, InitializeRequest, InitializeResult, PingRequest, ProtocolVersion,
    ServerCapabilities,
};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::mcp::rpc::{
    app_error_to_json_rpc, is_json_rpc_error, json_rpc_error, json_rpc_notification,
    json_rpc_result, InboundMessage,
};
use crate::session::SessionRegistry;
use crate::{errors::AppError, user_context::UserContext};

pub const SUPPORTED_PROTOCOL_VERSION: &str = "2024-11-05";

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(
        &self,
        user: &UserContext,
        message: InboundMessage,
        outbox: &Outbox,
    ) -> Result<Option<Value>, AppError>;
}

/// Handle for delivering asynchronous messages onto one session's reply stream.
#[derive(Clone)]
pub struct Outbox {
    registry: Arc<SessionRegistry>,
    session_id: String,
}

impl Outbox {
    pub fn new(registry: Arc<SessionRegistry>, session_id: impl Into<String>) -> Self {
        Self {
            registry,
            session_id: session_id.into(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn enqueue(&self, message: Value) -> Result<u64, AppError> {
        self.registry.enqueue(&self.session_id, message)
    }

    pub fn notify(&self, method: &str, params: Value) -> Result<u64, AppError> {
        self.enqueue(json_rpc_notification(method, params))
    }

    /// Requests a graceful close once the queued messages are flushed.
    pub fn close(&self) -> Result<(), AppError> {
        self.registry.drain(&self.session_id)
    }
}

/// Built-in handler covering the protocol handshake, used when no application handler is
/// plugged in.
#[derive(Debug, Default)]
pub struct McpHandler;

#[async_trait]
impl MessageHandler for McpHandler {
    async fn handle(
        &self,
        user: &UserContext,
        message: InboundMessage,
        _outbox: &Outbox,
    ) -> Result<Option<Value>, AppError> {
        let (id, method, params) = match message {
            InboundMessage::Request { id, method, params } => (id, method, params),
            InboundMessage::Notification { method, .. } => {
                debug!(method = %method, user_id = %user.user_id(), "notification received");
                return Ok(None);
            }
            InboundMessage::Response(response) => {
                debug!(id = ?response.get("id"), "client response received");
                return Ok(None);
            }
        };

        let audit_params = redact_audit_params(params.as_ref());
        let response = handle_request(Some(id), &method, params);

        info!(
            method = %method,
            user_id = %user.user_id(),
            params = %audit_params,
            outcome = if is_json_rpc_error(&response) { "failure" } else { "success" },
            "mcp action audited"
        );

        Ok(Some(response))
    }
}

fn handle_request(id: Option<Value>, method: &str, params: Option<Value>) -> Value {
    if let Err(error_response) = validate_request_shape(id.clone(), method, params.as_ref()) {
        return error_response;
    }

    match method {
        "initialize" => {
            let protocol_version = match negotiate_protocol_version(params.as_ref()) {
                Ok(version) => version,
                Err(err) => return app_error_to_json_rpc(id, err),
            };

            let initialize_result = InitializeResult {
                server_info: Implementation {
                    name: env!("CARGO_PKG_NAME").to_string(),
                    version: env!("CARGO_PKG_VERSION").to_string(),
                    title: None,
                    description: None,
                    icons: vec![],
                    website_url: None,
                },
                capabilities: ServerCapabilities::default(),
                protocol_version: protocol_version.into(),
                instructions: None,
                meta: None,
            };

            json_rpc_result(
                id,
                serde_json::to_value(initialize_result).expect("initialize result serialization"),
            )
        }
        "ping" => json_rpc_result(id, json!({})),
        _ => json_rpc_error(id, -32601, "Method not found"),
    }
}

fn validate_request_shape(
    id: Option<Value>,
    method: &str,
    params: Option<&Value>,
) -> Result<(), Value> {
    let mut payload = json!({
        "jsonrpc": "2.0",
        "id": id.clone(),
        "method": method,
    });
    if let Some(params) = params {
        payload["params"] = params.clone();
    }

    let valid = match method {
        "ping" => serde_json::from_value::<PingRequest>(payload).is_ok(),
        "initialize" => serde_json::from_value::<InitializeRequest>(payload).is_ok(),
        _ => true,
    };

    if valid {
        Ok(())
    } else {
        Err(json_rpc_error(id, -32602, "Invalid params"))
    }
}

pub fn negotiate_protocol_version(params: Option<&Value>) -> Result<ProtocolVersion, AppError> {
    let offered_version = params
        .and_then(Value::as_object)
        .and_then(|object| object.get("protocolVersion"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|version| !version.is_empty())
        .ok_or_else(|| {
            AppError::bad_request(
                "invalid_protocol_version",
                "initialize params.protocolVersion is required",
            )
        })?;

    if offered_version != SUPPORTED_PROTOCOL_VERSION {
        return Err(AppError::bad_request(
            "unsupported_protocol_version",
            "unsupported initialize protocolVersion",
        ));
    }

    Ok(ProtocolVersion::V2024_11_05)
}

pub fn redact_audit_params(params: Option<&Value>) -> Value {
    params.map(redact_audit_value).unwrap_or(Value::Null)
}

pub fn redact_audit_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, item)| {
                    if is_sensitive_key(key) {
                        (key.clone(), Value::String("[REDACTED]".to_string()))
                    } else {
                        (key.clone(), redact_audit_value(item))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact_audit_value).collect()),
        _ => value.clone(),
    }
}

pub fn is_sensitive_key(key: &str) -> bool {
    let normalized = key.trim().to_ascii_lowercase();
    matches!(
        normalized.as_str(),
        "authorization" | "bearer" | "api_key" | "apikey"
    ) || normalized.contains("token")
        || normalized.contains("secret")
        || normalized.contains("password")
        || normalized.contains("credential")
}
