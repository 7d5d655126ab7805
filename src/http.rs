//! Streaming HTTP transport.
//!
//! - `GET /mcp` opens an SSE stream bound to a session (new or existing).
//!   The first event is `endpoint`, carrying the URL to POST messages to;
//!   every later event is a `message` with one JSON-RPC object.
//! - `POST /mcp` accepts one JSON-RPC object for a session. The reply is not
//!   in the HTTP response: it is broadcast to every stream of the session.
//! - `DELETE /mcp` tears a session down.
//!
//! Sessions are addressed by the `mcp-session-id` header or the
//! `sessionId` query parameter.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::gateway::{dispatch, GatewayError, Session, SessionRegistry};

pub const SESSION_HEADER: &str = "mcp-session-id";
const MCP_PATH: &str = "/mcp";
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SessionQuery {
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
}

pub fn router(registry: Arc<SessionRegistry>) -> Router {
    Router::new()
        .route(MCP_PATH, get(open_stream).post(post_message).delete(delete_session))
        .route("/health", get(health))
        .route("/api/sessions", get(list_sessions))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { registry })
}

// ── GET /mcp ────────────────────────────────────────────────────────────────

async fn open_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SessionQuery>,
) -> Response {
    let session = match session_id(&headers, &query) {
        Some(id) => match state.registry.get(&id).await {
            Ok(session) => session,
            Err(e) => return error_response(StatusCode::NOT_FOUND, &e),
        },
        None => match state.registry.create().await {
            Ok(session) => session,
            Err(e) => {
                tracing::error!(error = %e, "failed to create session");
                return error_response(StatusCode::SERVICE_UNAVAILABLE, &e);
            }
        },
    };

    let endpoint = Uuid::new_v4();
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    session.attach(endpoint, tx);
    let guard = EndpointGuard {
        session: Arc::clone(&session),
        endpoint,
    };

    let first = Event::default()
        .event("endpoint")
        .data(format!("{MCP_PATH}?sessionId={}", session.id()));
    let messages = UnboundedReceiverStream::new(rx).map(move |message| {
        // The guard lives as long as the stream does.
        let _attached = &guard;
        Event::default().event("message").data(message.to_string())
    });
    let events = stream::once(async move { first })
        .chain(messages)
        .map(Ok::<_, Infallible>);

    let sse = Sse::new(events).keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL));
    (session_header(session.id()), sse).into_response()
}

/// Detaches an SSE endpoint from its session when the stream is dropped.
struct EndpointGuard {
    session: Arc<Session>,
    endpoint: Uuid,
}

impl Drop for EndpointGuard {
    fn drop(&mut self) {
        self.session.detach(self.endpoint);
    }
}

// ── POST /mcp ───────────────────────────────────────────────────────────────

async fn post_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SessionQuery>,
    body: Bytes,
) -> Response {
    let message = match serde_json::from_slice::<Value>(&body) {
        Ok(message) if message.is_object() => message,
        Ok(_) => {
            let err = GatewayError::InvalidRequest {
                reason: "expected a JSON-RPC object".into(),
            };
            return error_response(StatusCode::BAD_REQUEST, &err);
        }
        Err(e) => {
            let err = GatewayError::ParseError {
                reason: e.to_string(),
            };
            return error_response(StatusCode::BAD_REQUEST, &err);
        }
    };

    let id = session_id(&headers, &query).unwrap_or_default();
    let session = match state.registry.get(&id).await {
        Ok(session) => session,
        Err(e) => return error_response(StatusCode::NOT_FOUND, &e),
    };

    // Replies go out over the session's streams, so long tool calls must not
    // hold the POST open.
    tokio::spawn(async move {
        dispatch::process(&session, message).await;
    });

    StatusCode::ACCEPTED.into_response()
}

// ── DELETE /mcp ─────────────────────────────────────────────────────────────

async fn delete_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SessionQuery>,
) -> Response {
    let id = session_id(&headers, &query).unwrap_or_default();
    match state.registry.remove(&id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(StatusCode::NOT_FOUND, &e),
    }
}

// ── status ──────────────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "sessions": state.registry.len().await,
    }))
}

async fn list_sessions(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "sessions": state.registry.snapshot().await }))
}

// ── helpers ─────────────────────────────────────────────────────────────────

fn session_id(headers: &HeaderMap, query: &SessionQuery) -> Option<String> {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| query.session_id.clone())
        .filter(|id| !id.is_empty())
}

fn session_header(id: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(id) {
        headers.insert(HeaderName::from_static(SESSION_HEADER), value);
    }
    headers
}

fn error_response(status: StatusCode, err: &GatewayError) -> Response {
    (status, Json(err.to_json_rpc(Value::Null))).into_response()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
