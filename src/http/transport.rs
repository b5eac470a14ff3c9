//! Session binding and inbound dispatch shared by the SSE and streamable HTTP adapters
//!
//! Both transports resolve sessions, validate resumption tokens and run inbound messages
//! through the handler here, so delivery semantics cannot drift between them.

use std::sync::Arc;

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    errors::AppError,
    mcp::{
        handler::Outbox,
        rpc::{app_error_to_json_rpc, InboundMessage},
    },
    session::{Session, TransportKind},
    user_context::UserContext,
    AppState,
};

pub const SESSION_ID_HEADER: HeaderName = HeaderName::from_static("mcp-session-id");
pub const LAST_EVENT_ID_HEADER: HeaderName = HeaderName::from_static("last-event-id");

/// A session bound to a new outbound stream, and where that stream starts.
#[derive(Debug)]
pub struct StreamBinding {
    pub session: Arc<Session>,
    pub cursor: u64,
    pub resumed: bool,
}

/// Synchronous answer to an inbound-send.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Acknowledgement {
    pub session_id: String,
    pub accepted: bool,
    pub reply_sequence: Option<u64>,
}

pub fn session_id_from_headers(headers: &HeaderMap) -> Result<Option<String>, AppError> {
    let Some(value) = headers.get(SESSION_ID_HEADER) else {
        return Ok(None);
    };

    value
        .to_str()
        .ok()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(|id| Some(id.to_string()))
        .ok_or_else(|| {
            AppError::bad_request("invalid_session_id", "Mcp-Session-Id header is malformed")
        })
}

pub fn require_session_id(headers: &HeaderMap) -> Result<String, AppError> {
    session_id_from_headers(headers)?.ok_or_else(|| {
        AppError::bad_request("missing_session_id", "Mcp-Session-Id header is required")
    })
}

pub fn last_sequence_from_headers(headers: &HeaderMap) -> Result<Option<u64>, AppError> {
    let Some(value) = headers.get(LAST_EVENT_ID_HEADER) else {
        return Ok(None);
    };

    value
        .to_str()
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .map(Some)
        .ok_or_else(|| {
            AppError::bad_request(
                "invalid_last_event_id",
                "Last-Event-ID must be a message sequence number",
            )
        })
}

pub fn session_header(session_id: &str) -> Result<(HeaderName, HeaderValue), AppError> {
    let value = HeaderValue::from_str(session_id)
        .map_err(|err| AppError::internal(format!("session id is not a valid header: {err}")))?;
    Ok((SESSION_ID_HEADER, value))
}

/// Resolves the session an outbound stream should serve.
///
/// Without a session id this is a handshake and a new session is created. With one, the
/// session must still exist, belong to `user`, use `transport`, and still retain every
/// message after `last_sequence`; any other outcome is `Gone` and the client has to start
/// over.
pub fn bind_stream(
    state: &AppState,
    user: &UserContext,
    session_id: Option<&str>,
    transport: TransportKind,
    last_sequence: Option<u64>,
) -> Result<StreamBinding, AppError> {
    let Some(session_id) = session_id else {
        if last_sequence.is_some() {
            return Err(AppError::bad_request(
                "missing_session_id",
                "Last-Event-ID requires an Mcp-Session-Id header",
            ));
        }
        let session = state.registry.create(user.clone(), transport)?;
        return Ok(StreamBinding {
            session,
            cursor: 0,
            resumed: false,
        });
    };

    let session = state
        .registry
        .get(session_id)
        .ok()
        .filter(|session| session.transport() == transport)
        .filter(|session| session.user().is_same_principal(user))
        .ok_or_else(|| AppError::gone(format!("session {session_id} is no longer available")))?;

    let cursor = session.resume_cursor(last_sequence).inspect_err(|err| {
        warn!(session_id = %session_id, ?last_sequence, error = %err, "resumption rejected");
    })?;

    info!(
        session_id = %session_id,
        cursor,
        last_sequence = session.last_sequence(),
        retained = session.retained(),
        replacing_writer = session.has_writer(),
        "session resumed"
    );
    Ok(StreamBinding {
        session,
        cursor,
        resumed: true,
    })
}

/// Looks up the session an inbound message is addressed to. Sessions owned by another
/// principal or bound to the other transport are reported as unknown.
pub fn find_session(
    state: &AppState,
    user: &UserContext,
    session_id: &str,
    transport: TransportKind,
) -> Result<Arc<Session>, AppError> {
    let session = state.registry.get(session_id)?;
    if session.transport() != transport || !session.user().is_same_principal(user) {
        return Err(AppError::not_found(session_id));
    }
    Ok(session)
}

/// Runs one parsed inbound message through the handler and enqueues its reply.
///
/// Dispatch holds the session's inbound lock, so messages from one session reach the
/// handler one at a time while other sessions proceed independently.
pub async fn dispatch_inbound(
    state: &AppState,
    session: &Arc<Session>,
    message: InboundMessage,
) -> Result<Acknowledgement, AppError> {
    session.ensure_accepting_inbound()?;
    let _reader = session.lock_inbound().await;
    session.ensure_accepting_inbound()?;
    session.touch();

    let request_id = message.id().cloned();
    debug!(
        session_id = %session.id(),
        method = message.method().unwrap_or("<response>"),
        "dispatching inbound message"
    );

    let outbox = Outbox::new(Arc::clone(&state.registry), session.id());
    let reply = match state.handler.handle(session.user(), message, &outbox).await {
        Ok(reply) => reply,
        Err(err) => {
            warn!(session_id = %session.id(), error = %err, "message handler failed");
            request_id.map(|id| app_error_to_json_rpc(Some(id), err))
        }
    };

    let reply_sequence = match reply {
        Some(reply) => match session.enqueue(reply) {
            Ok(sequence) => Some(sequence),
            Err(err) => {
                debug!(session_id = %session.id(), error = %err, "reply dropped, session closed");
                None
            }
        },
        None => None,
    };

    Ok(Acknowledgement {
        session_id: session.id().to_string(),
        accepted: true,
        reply_sequence,
    })
}

/// Starts a graceful close on behalf of the session's owner.
pub fn close_session(
    state: &AppState,
    user: &UserContext,
    session_id: &str,
    transport: TransportKind,
) -> Result<(), AppError> {
    find_session(state, user, session_id, transport)?;
    state.registry.drain(session_id)
}
