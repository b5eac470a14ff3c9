//! Server-Sent Events transport
//!
//! `GET /sse` opens (or resumes) the event stream, `POST /sse/messages` is the paired
//! inbound channel, `DELETE /sse` closes the session gracefully.

use std::{convert::Infallible, sync::Arc};

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    Extension, Json,
};
use futures::{stream, StreamExt};
use serde::Deserialize;
use tracing::info;

use crate::{
    errors::AppError,
    http::{
        transport::{
            bind_stream, close_session, dispatch_inbound, find_session, last_sequence_from_headers,
            require_session_id, session_header, session_id_from_headers,
        },
        writer::{outbound_frames, Frame},
        SSE_MESSAGES_PATH,
    },
    mcp::rpc::parse_inbound,
    session::TransportKind,
    user_context::UserContext,
    AppState,
};

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
}

/// Browsers' `EventSource` resends `Last-Event-ID` on reconnect but cannot add headers, so
/// the session may also be named by the `sessionId` query parameter.
pub async fn connect(
    State(state): State<AppState>,
    Extension(user): Extension<UserContext>,
    Query(query): Query<MessageQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let session_id = session_id_from_headers(&headers)?.or(query.session_id);
    let last_sequence = last_sequence_from_headers(&headers)?;
    let binding = bind_stream(
        &state,
        &user,
        session_id.as_deref(),
        TransportKind::Sse,
        last_sequence,
    )?;
    let session_id = binding.session.id().to_string();
    info!(session_id = %session_id, resumed = binding.resumed, cursor = binding.cursor, "sse stream opened");

    let endpoint = Event::default()
        .event("endpoint")
        .data(format!("{SSE_MESSAGES_PATH}?sessionId={session_id}"));
    let frames = outbound_frames(
        Arc::clone(&state.registry),
        binding.session,
        binding.cursor,
        state.heartbeat_interval,
    )
    .map(|frame| Ok::<_, Infallible>(encode_event(frame)));
    let events = stream::once(async move { Ok::<_, Infallible>(endpoint) }).chain(frames);

    Ok(([session_header(&session_id)?], Sse::new(events)).into_response())
}

pub async fn post_message(
    State(state): State<AppState>,
    Extension(user): Extension<UserContext>,
    Query(query): Query<MessageQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let session_id = session_id_from_headers(&headers)?
        .or(query.session_id)
        .ok_or_else(|| {
            AppError::bad_request(
                "missing_session_id",
                "Mcp-Session-Id header or sessionId query parameter is required",
            )
        })?;
    let session = find_session(&state, &user, &session_id, TransportKind::Sse)?;
    session.touch();

    let message = parse_inbound(&body)?;
    let ack = dispatch_inbound(&state, &session, message).await?;
    Ok((StatusCode::ACCEPTED, Json(ack)).into_response())
}

pub async fn close(
    State(state): State<AppState>,
    Extension(user): Extension<UserContext>,
    headers: HeaderMap,
) -> Result<StatusCode, AppError> {
    let session_id = require_session_id(&headers)?;
    close_session(&state, &user, &session_id, TransportKind::Sse)?;
    Ok(StatusCode::ACCEPTED)
}

/// One event per message with the sequence as its id; heartbeats are comment-only frames.
pub fn encode_event(frame: Frame) -> Event {
    match frame {
        Frame::Message(message) => Event::default()
            .id(message.sequence.to_string())
            .data(message.payload.to_string()),
        Frame::Heartbeat => Event::default().comment("heartbeat"),
    }
}
