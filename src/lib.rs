use std::{sync::Arc, time::Duration};

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

pub mod auth;
pub mod config;
pub mod errors;
pub mod health;
pub mod http;
pub mod logging;
pub mod mcp;
pub mod session;
pub mod user_context;

use auth::CredentialResolver;
use health::HealthCheck;
use mcp::handler::MessageHandler;
use session::SessionRegistry;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub resolver: Arc<dyn CredentialResolver>,
    pub handler: Arc<dyn MessageHandler>,
    pub health: HealthCheck,
    pub heartbeat_interval: Duration,
}

impl AppState {
    pub fn new(
        registry: Arc<SessionRegistry>,
        resolver: Arc<dyn CredentialResolver>,
        handler: Arc<dyn MessageHandler>,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            health: HealthCheck::new(Arc::clone(&registry)),
            registry,
            resolver,
            handler,
            heartbeat_interval,
        }
    }
}

pub fn build_app(state: AppState) -> Router {
    let protected = Router::new()
        .route(
            http::SSE_PATH,
            get(http::sse::connect).delete(http::sse::close),
        )
        .route(http::SSE_MESSAGES_PATH, post(http::sse::post_message))
        .route(
            http::MCP_PATH,
            post(http::streamable::send)
                .get(http::streamable::stream)
                .delete(http::streamable::close),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_user_context,
        ));

    Router::new()
        .route(http::HEALTH_PATH, get(http::handlers::health))
        .route(http::DISCOVERY_PATH, get(http::handlers::discovery))
        .merge(protected)
        .layer(middleware::from_fn(logging::request_logging_middleware))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use axum::{
        body::Body,
        http::{header, Request, Response, StatusCode},
    };
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use crate::{
        auth::StaticTokenResolver,
        errors::AppError,
        mcp::handler::McpHandler,
        session::{RegistryConfig, TransportKind},
        user_context::UserContext,
    };

    use super::*;

    const TOKEN: &str = "token-1234567890ab";
    const OTHER_TOKEN: &str = "token-other-user00";
    const INITIALIZE: &str = r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{"protocolVersion":"2024-11-05","clientInfo":{"name":"test-client","version":"1.0.0"},"capabilities":{}}}"#;

    struct TwoUserResolver;

    #[async_trait::async_trait]
    impl CredentialResolver for TwoUserResolver {
        async fn resolve(&self, credential: &str) -> Result<UserContext, AppError> {
            match credential {
                TOKEN => Ok(UserContext::new("u-1", "alice", None, credential)),
                OTHER_TOKEN => Ok(UserContext::new("u-2", "bob", None, credential)),
                _ => Err(AppError::unauthorized("invalid_token", "invalid bearer token")),
            }
        }
    }

    fn state_with(max_sessions: usize, retention: usize) -> AppState {
        let registry = Arc::new(SessionRegistry::new(RegistryConfig {
            max_sessions,
            retention,
            idle_timeout: Duration::from_secs(300),
        }));
        let state = AppState::new(
            registry,
            Arc::new(TwoUserResolver),
            Arc::new(McpHandler),
            Duration::from_secs(30),
        );
        state.health.mark_started();
        state
    }

    fn state() -> AppState {
        state_with(8, 16)
    }

    async fn call(state: &AppState, request: Request<Body>) -> Response<Body> {
        build_app(state.clone())
            .oneshot(request)
            .await
            .expect("request execution")
    }

    fn post_mcp(session_id: Option<&str>, body: &str) -> Request<Body> {
        let mut builder = Request::builder()
            .uri("/mcp")
            .method("POST")
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"));
        if let Some(session_id) = session_id {
            builder = builder.header("mcp-session-id", session_id);
        }
        builder.body(Body::from(body.to_string())).expect("request build")
    }

    fn get_stream(uri: &str, session_id: Option<&str>, last_event_id: Option<u64>) -> Request<Body> {
        let mut builder = Request::builder()
            .uri(uri)
            .method("GET")
            .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"));
        if let Some(session_id) = session_id {
            builder = builder.header("mcp-session-id", session_id);
        }
        if let Some(last_event_id) = last_event_id {
            builder = builder.header("last-event-id", last_event_id.to_string());
        }
        builder.body(Body::empty()).expect("request build")
    }

    fn session_id_of(response: &Response<Body>) -> String {
        response
            .headers()
            .get("mcp-session-id")
            .and_then(|value| value.to_str().ok())
            .expect("session id header")
            .to_string()
    }

    async fn json_body(response: Response<Body>) -> Value {
        let body = response
            .into_body()
            .collect()
            .await
            .expect("collect body")
            .to_bytes();
        serde_json::from_slice(&body).expect("valid json response")
    }

    async fn read_chunk(body: &mut Body) -> String {
        let frame = tokio::time::timeout(Duration::from_secs(2), body.frame())
            .await
            .expect("frame before timeout")
            .expect("stream still open")
            .expect("frame ok");
        match frame.into_data() {
            Ok(data) => String::from_utf8(data.to_vec()).expect("utf8 chunk"),
            Err(_) => String::new(),
        }
    }

    async fn next_record(body: &mut Body, buffer: &mut String) -> Value {
        loop {
            if let Some(end) = buffer.find('\n') {
                let line: String = buffer.drain(..=end).collect();
                if line.trim().is_empty() {
                    continue;
                }
                return serde_json::from_str(line.trim()).expect("json record");
            }
            let chunk = read_chunk(body).await;
            buffer.push_str(&chunk);
        }
    }

    async fn read_sse_until(body: &mut Body, buffer: &mut String, needle: &str) {
        while !buffer.contains(needle) {
            let chunk = read_chunk(body).await;
            buffer.push_str(&chunk);
        }
    }

    #[tokio::test]
    async fn health_reports_not_live_before_start_up() {
        let registry = Arc::new(SessionRegistry::new(RegistryConfig {
            max_sessions: 4,
            retention: 4,
            idle_timeout: Duration::from_secs(60),
        }));
        let state = AppState::new(
            registry,
            Arc::new(StaticTokenResolver::new(TOKEN, "u-1", "alice", None)),
            Arc::new(McpHandler),
            Duration::from_secs(30),
        );

        let request = Request::builder()
            .uri("/health")
            .method("GET")
            .body(Body::empty())
            .expect("request build");
        let response = call(&state, request).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = json_body(response).await;
        assert_eq!(body["live"], false);
        assert_eq!(body["ready"], false);
    }

    #[tokio::test]
    async fn health_is_public_and_ready_after_start_up() {
        let request = Request::builder()
            .uri("/health")
            .method("GET")
            .body(Body::empty())
            .expect("request build");
        let response = call(&state(), request).await;

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["live"], true);
        assert_eq!(body["ready"], true);
        assert_eq!(body["sessions"], 0);
        assert!(body["checkedAt"].is_string());
    }

    #[tokio::test]
    async fn discovery_is_public() {
        let request = Request::builder()
            .uri("/.well-known/mcp")
            .method("GET")
            .body(Body::empty())
            .expect("request build");
        let response = call(&state(), request).await;

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["mcp_endpoint"], "/mcp");
        assert_eq!(body["sse_endpoint"], "/sse");
    }

    #[tokio::test]
    async fn transports_require_a_token_and_create_no_session() {
        let state = state();
        let request = Request::builder()
            .uri("/mcp")
            .method("POST")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(INITIALIZE))
            .expect("request build");
        assert_eq!(call(&state, request).await.status(), StatusCode::UNAUTHORIZED);

        let request = Request::builder()
            .uri("/sse")
            .method("GET")
            .header(header::AUTHORIZATION, "Bearer not-a-valid-token")
            .body(Body::empty())
            .expect("request build");
        assert_eq!(call(&state, request).await.status(), StatusCode::UNAUTHORIZED);

        assert!(state.registry.is_empty());
    }

    #[tokio::test]
    async fn streamable_handshake_returns_session_and_acknowledgement() {
        let state = state();
        let response = call(&state, post_mcp(None, INITIALIZE)).await;

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let session_id = session_id_of(&response);
        assert!(session_id.starts_with("mcp_"));
        let ack = json_body(response).await;
        assert_eq!(ack["sessionId"], session_id.as_str());
        assert_eq!(ack["accepted"], true);
        assert_eq!(ack["replySequence"], 1);

        let session = state.registry.get(&session_id).expect("session registered");
        assert_eq!(session.transport(), TransportKind::StreamableHttp);
        assert_eq!(session.user().user_id(), "u-1");
    }

    #[tokio::test]
    async fn handshake_at_capacity_fails_without_creating_a_session() {
        let state = state_with(1, 16);
        let first = call(&state, post_mcp(None, INITIALIZE)).await;
        assert_eq!(first.status(), StatusCode::ACCEPTED);

        let second = call(&state, post_mcp(None, INITIALIZE)).await;
        assert_eq!(second.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = json_body(second).await;
        assert_eq!(body["code"], "capacity_exceeded");
        assert_eq!(state.registry.len(), 1);
    }

    #[tokio::test]
    async fn malformed_frames_are_reported_and_keep_the_session_open() {
        let state = state();
        let response = call(&state, post_mcp(None, "{")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(state.registry.is_empty());

        let response = call(&state, post_mcp(None, INITIALIZE)).await;
        let session_id = session_id_of(&response);

        let response = call(&state, post_mcp(Some(&session_id), "{")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["jsonrpc"], "2.0");
        assert_eq!(body["error"]["code"], -32700);

        let response = call(
            &state,
            post_mcp(Some(&session_id), r#"{"jsonrpc":"2.0","id":2,"method":"ping"}"#),
        )
        .await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(json_body(response).await["replySequence"], 2);
    }

    #[tokio::test]
    async fn reconnect_redelivers_only_unacknowledged_messages() {
        let state = state();
        let response = call(&state, post_mcp(None, INITIALIZE)).await;
        let session_id = session_id_of(&response);
        for id in [2, 3] {
            state
                .registry
                .enqueue(
                    &session_id,
                    json!({"jsonrpc": "2.0", "method": "notifications/message", "params": {"n": id}}),
                )
                .expect("enqueue");
        }

        let response = call(&state, get_stream("/mcp", Some(&session_id), None)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).expect("content type"),
            "application/x-ndjson"
        );
        let mut body = response.into_body();
        let mut buffer = String::new();
        for expected in 1..=3 {
            let record = next_record(&mut body, &mut buffer).await;
            assert_eq!(record["sequence"], expected);
        }
        drop(body);

        for _ in 0..2 {
            let response = call(&state, get_stream("/mcp", Some(&session_id), Some(2))).await;
            assert_eq!(response.status(), StatusCode::OK);
            let mut body = response.into_body();
            let mut buffer = String::new();
            let record = next_record(&mut body, &mut buffer).await;
            assert_eq!(record["sequence"], 3);
            assert_eq!(record["message"]["params"]["n"], 3);
        }
    }

    #[tokio::test]
    async fn resumption_outside_the_retention_window_is_gone() {
        let state = state_with(4, 2);
        let response = call(&state, post_mcp(None, INITIALIZE)).await;
        let session_id = session_id_of(&response);
        for n in 0..4 {
            state
                .registry
                .enqueue(&session_id, json!({"jsonrpc": "2.0", "method": "tick", "params": {"n": n}}))
                .expect("enqueue");
        }

        let response = call(&state, get_stream("/mcp", Some(&session_id), Some(1))).await;
        assert_eq!(response.status(), StatusCode::GONE);
        assert_eq!(json_body(response).await["code"], "session_gone");
    }

    #[tokio::test]
    async fn unknown_sessions_are_gone_for_streams_and_not_found_for_sends() {
        let state = state();
        let response = call(&state, get_stream("/mcp", Some("mcp_unknown"), None)).await;
        assert_eq!(response.status(), StatusCode::GONE);

        let response = call(
            &state,
            post_mcp(Some("mcp_unknown"), r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = call(&state, get_stream("/mcp", None, None)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn sessions_are_bound_to_their_principal() {
        let state = state();
        let response = call(&state, post_mcp(None, INITIALIZE)).await;
        let session_id = session_id_of(&response);

        let request = Request::builder()
            .uri("/mcp")
            .method("GET")
            .header(header::AUTHORIZATION, format!("Bearer {OTHER_TOKEN}"))
            .header("mcp-session-id", session_id.as_str())
            .body(Body::empty())
            .expect("request build");
        assert_eq!(call(&state, request).await.status(), StatusCode::GONE);

        let request = Request::builder()
            .uri("/mcp")
            .method("POST")
            .header(header::AUTHORIZATION, format!("Bearer {OTHER_TOKEN}"))
            .header("mcp-session-id", session_id.as_str())
            .body(Body::from(r#"{"jsonrpc":"2.0","id":2,"method":"ping"}"#))
            .expect("request build");
        assert_eq!(call(&state, request).await.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn delete_closes_an_idle_streamable_session() {
        let state = state();
        let response = call(&state, post_mcp(None, INITIALIZE)).await;
        let session_id = session_id_of(&response);

        let request = Request::builder()
            .uri("/mcp")
            .method("DELETE")
            .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
            .header("mcp-session-id", session_id.as_str())
            .body(Body::empty())
            .expect("request build");
        assert_eq!(call(&state, request).await.status(), StatusCode::ACCEPTED);
        assert!(state.registry.get(&session_id).is_err());

        let response = call(
            &state,
            post_mcp(Some(&session_id), r#"{"jsonrpc":"2.0","id":2,"method":"ping"}"#),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn sse_handshake_announces_endpoint_and_streams_events() {
        let state = state();
        let response = call(&state, get_stream("/sse", None, None)).await;

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .expect("content type")
            .to_string();
        assert!(content_type.starts_with("text/event-stream"));
        let session_id = session_id_of(&response);

        let mut body = response.into_body();
        let mut buffer = String::new();
        read_sse_until(&mut body, &mut buffer, "event: endpoint").await;
        assert!(buffer.contains(&format!("/sse/messages?sessionId={session_id}")));

        state
            .registry
            .enqueue(&session_id, json!({"jsonrpc": "2.0", "method": "notifications/message"}))
            .expect("enqueue");
        read_sse_until(&mut body, &mut buffer, "id: 1\n").await;
        assert!(buffer.contains("notifications/message"));
    }

    #[tokio::test]
    async fn sse_inbound_replies_travel_on_the_event_stream() {
        let state = state();
        let response = call(&state, get_stream("/sse", None, None)).await;
        let session_id = session_id_of(&response);
        let mut body = response.into_body();
        let mut buffer = String::new();
        read_sse_until(&mut body, &mut buffer, "event: endpoint").await;

        let request = Request::builder()
            .uri(format!("/sse/messages?sessionId={session_id}"))
            .method("POST")
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
            .body(Body::from(r#"{"jsonrpc":"2.0","id":5,"method":"ping"}"#))
            .expect("request build");
        let response = call(&state, request).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(json_body(response).await["replySequence"], 1);

        read_sse_until(&mut body, &mut buffer, "\"id\":5").await;
        assert!(buffer.contains("id: 1\n"));
    }

    #[tokio::test]
    async fn sse_sessions_cannot_be_driven_through_the_streamable_endpoint() {
        let state = state();
        let response = call(&state, get_stream("/sse", None, None)).await;
        let session_id = session_id_of(&response);

        let response = call(
            &state,
            post_mcp(Some(&session_id), r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn sse_resume_replays_after_last_event_id() {
        let state = state();
        let response = call(&state, get_stream("/sse", None, None)).await;
        let session_id = session_id_of(&response);
        drop(response);

        for n in 1..=3 {
            state
                .registry
                .enqueue(&session_id, json!({"jsonrpc": "2.0", "method": "tick", "params": {"n": n}}))
                .expect("enqueue");
        }

        let response = call(&state, get_stream("/sse", Some(&session_id), Some(2))).await;
        assert_eq!(response.status(), StatusCode::OK);
        let mut body = response.into_body();
        let mut buffer = String::new();
        read_sse_until(&mut body, &mut buffer, "id: 3\n").await;
        assert!(!buffer.contains("id: 1\n"));
        assert!(!buffer.contains("id: 2\n"));
    }

    #[tokio::test]
    async fn sse_resume_accepts_session_id_query_parameter() {
        let state = state();
        let response = call(&state, get_stream("/sse", None, None)).await;
        let session_id = session_id_of(&response);
        drop(response);

        for n in 1..=2 {
            state
                .registry
                .enqueue(&session_id, json!({"jsonrpc": "2.0", "method": "tick", "params": {"n": n}}))
                .expect("enqueue");
        }

        let uri = format!("/sse?sessionId={session_id}");
        let response = call(&state, get_stream(&uri, None, Some(1))).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(session_id_of(&response), session_id);
        let mut body = response.into_body();
        let mut buffer = String::new();
        read_sse_until(&mut body, &mut buffer, "id: 2\n").await;
        assert!(!buffer.contains("id: 1\n"));
        assert_eq!(state.registry.len(), 1);
    }
}
