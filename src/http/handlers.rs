//! Public metadata endpoints: health probe and discovery document

use axum::{extract::State, http::StatusCode, Json};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;

use crate::http::{MCP_PATH, SSE_MESSAGES_PATH, SSE_PATH};
use crate::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub live: bool,
    pub ready: bool,
    pub sessions: usize,
    pub checked_at: String,
}

#[derive(Debug, Serialize)]
pub struct DiscoveryResponse {
    pub name: &'static str,
    pub version: &'static str,
    pub mcp_endpoint: &'static str,
    pub sse_endpoint: &'static str,
    pub sse_messages_endpoint: &'static str,
}

/// `200` once ready, `503` while starting up or shedding sessions.
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let status = state.health.check();
    let code = if status.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        code,
        Json(HealthResponse {
            live: status.live,
            ready: status.ready,
            sessions: state.health.session_count(),
            checked_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        }),
    )
}

pub async fn discovery() -> Json<DiscoveryResponse> {
    Json(DiscoveryResponse {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        mcp_endpoint: MCP_PATH,
        sse_endpoint: SSE_PATH,
        sse_messages_endpoint: SSE_MESSAGES_PATH,
    })
}
