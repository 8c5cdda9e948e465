//! Streamable HTTP JSON-RPC transport
//!
//! `POST <path>` takes a single JSON-RPC object or a batch and answers 200
//! with the response, or 202 when the request was notification-only.
//! Requests are serialized through a per-server queue. `GET /health` is an
//! unauthenticated liveness probe.

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::env::HttpSettings;
use crate::jsonrpc::{JsonRpcResponse, PARSE_ERROR};
use crate::service::McpService;
use vdo_bridge_core::types::Timestamp;

// ----------------------------------------------------------------------------
// Server State
// ----------------------------------------------------------------------------

struct HttpState {
    service: Arc<McpService>,
    settings: HttpSettings,
    /// Per-server dispatch queue; one request is in flight at a time.
    queue: Mutex<()>,
}

/// Build the router for the configured settings.
pub fn build_router(service: Arc<McpService>, settings: HttpSettings) -> Router {
    let max_body = settings.max_body_bytes;
    let path = settings.path.clone();
    let state = Arc::new(HttpState {
        service,
        settings,
        queue: Mutex::new(()),
    });
    Router::new()
        .route(&path, post(handle_post).options(handle_preflight))
        .route("/health", get(handle_health))
        .layer(DefaultBodyLimit::max(max_body))
        .with_state(state)
}

/// Bind and serve until the process exits.
pub async fn run_http(service: Arc<McpService>, settings: HttpSettings) -> std::io::Result<()> {
    let addr = format!("{}:{}", settings.host, settings.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, path = %settings.path, "http transport listening");
    axum::serve(listener, build_router(service, settings)).await
}

// ----------------------------------------------------------------------------
// Handlers
// ----------------------------------------------------------------------------

async fn handle_post(
    State(state): State<Arc<HttpState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Some(expected) = &state.settings.bearer_token {
        let authorized = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(|presented| presented == expected)
            .unwrap_or(false);
        if !authorized {
            return with_cors(
                &state,
                (StatusCode::UNAUTHORIZED, Json(json!({"error": "unauthorized"}))).into_response(),
            );
        }
    }

    if body.len() > state.settings.max_body_bytes {
        return with_cors(
            &state,
            (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(json!({"error": "body too large"})),
            )
                .into_response(),
        );
    }

    let value: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(err) => {
            let response = JsonRpcResponse::failure(
                Value::Null,
                PARSE_ERROR,
                format!("parse error: {err}"),
            );
            return with_cors(
                &state,
                (StatusCode::OK, Json(serde_json::to_value(response).unwrap())).into_response(),
            );
        }
    };

    let result = {
        let _serialized = state.queue.lock().await;
        state.service.handle_value(value).await
    };

    let response = match result {
        Some(payload) => (StatusCode::OK, Json(payload)).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    };
    with_cors(&state, response)
}

async fn handle_preflight(State(state): State<Arc<HttpState>>) -> Response {
    let mut response = StatusCode::NO_CONTENT.into_response();
    if let Some(origin) = &state.settings.allow_origin {
        insert_cors_headers(response.headers_mut(), origin);
    }
    response
}

async fn handle_health(State(state): State<Arc<HttpState>>) -> Response {
    let payload = json!({
        "ok": true,
        "ts": Timestamp::now().as_millis(),
        "mode": "http",
        "endpoint": state.settings.path,
    });
    with_cors(&state, (StatusCode::OK, Json(payload)).into_response())
}

fn with_cors(state: &Arc<HttpState>, mut response: Response) -> Response {
    if let Some(origin) = &state.settings.allow_origin {
        insert_cors_headers(response.headers_mut(), origin);
    }
    response
}

fn insert_cors_headers(headers: &mut HeaderMap, origin: &str) {
    if let Ok(value) = HeaderValue::from_str(origin) {
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("POST, OPTIONS"),
        );
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static("content-type, authorization"),
        );
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
