//! Streamable HTTP transport
//!
//! For clients that cannot keep an event stream open: `POST /mcp` sends one message and gets
//! a synchronous acknowledgement, `GET /mcp` streams replies as newline-delimited JSON,
//! `DELETE /mcp` closes the session gracefully. Every exchange after the first carries the
//! `Mcp-Session-Id` header.

use std::{convert::Infallible, sync::Arc};

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use futures::StreamExt;
use serde_json::json;
use tracing::info;

use crate::{
    errors::AppError,
    http::{
        transport::{
            bind_stream, close_session, dispatch_inbound, find_session, last_sequence_from_headers,
            require_session_id, session_header, session_id_from_headers,
        },
        writer::{outbound_frames, Frame},
    },
    mcp::rpc::parse_inbound,
    session::TransportKind,
    user_context::UserContext,
    AppState,
};

pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

pub async fn send(
    State(state): State<AppState>,
    Extension(user): Extension<UserContext>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let (session, message) = match session_id_from_headers(&headers)? {
        Some(session_id) => {
            let session = find_session(
                &state,
                &user,
                &session_id,
                TransportKind::StreamableHttp,
            )?;
            session.touch();
            (session, parse_inbound(&body)?)
        }
        None => {
            // Parse first so a malformed handshake never takes a session slot.
            let message = parse_inbound(&body)?;
            let session = state
                .registry
                .create(user.clone(), TransportKind::StreamableHttp)?;
            (session, message)
        }
    };

    let ack = dispatch_inbound(&state, &session, message).await?;
    Ok((
        StatusCode::ACCEPTED,
        [session_header(session.id())?],
        Json(ack),
    )
        .into_response())
}

pub async fn stream(
    State(state): State<AppState>,
    Extension(user): Extension<UserContext>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let session_id = require_session_id(&headers)?;
    let last_sequence = last_sequence_from_headers(&headers)?;
    let binding = bind_stream(
        &state,
        &user,
        Some(&session_id),
        TransportKind::StreamableHttp,
        last_sequence,
    )?;
    info!(session_id = %session_id, cursor = binding.cursor, "ndjson stream opened");

    let records = outbound_frames(
        Arc::clone(&state.registry),
        binding.session,
        binding.cursor,
        state.heartbeat_interval,
    )
    .map(|frame| Ok::<_, Infallible>(encode_record(frame)));

    Ok((
        StatusCode::OK,
        [
            (
                header::CONTENT_TYPE,
                HeaderValue::from_static(NDJSON_CONTENT_TYPE),
            ),
            (header::CACHE_CONTROL, HeaderValue::from_static("no-cache")),
            session_header(&session_id)?,
        ],
        Body::from_stream(records),
    )
        .into_response())
}

pub async fn close(
    State(state): State<AppState>,
    Extension(user): Extension<UserContext>,
    headers: HeaderMap,
) -> Result<StatusCode, AppError> {
    let session_id = require_session_id(&headers)?;
    close_session(&state, &user, &session_id, TransportKind::StreamableHttp)?;
    Ok(StatusCode::ACCEPTED)
}

/// One `{"sequence", "message"}` record per line; a bare newline is a heartbeat.
pub fn encode_record(frame: Frame) -> Bytes {
    match frame {
        Frame::Message(message) => {
            let mut line = json!({
                "sequence": message.sequence,
                "message": message.payload,
            })
            .to_string();
            line.push('\n');
            Bytes::from(line)
        }
        Frame::Heartbeat => Bytes::from_static(b"\n"),
    }
}
