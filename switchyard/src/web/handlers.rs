//! HTTP endpoint handlers.
//!
//! The RPC handler only parses the request and hands it to the dispatcher:
//! 1. Read the `token` and `application` headers
//! 2. Parse the JSON body (an empty body counts as `{}`)
//! 3. Return the worker's response as-is

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    Json,
};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::info;

use crate::dispatch::{Dispatch, DispatchRequest};
use crate::error::DispatchError;
use crate::response::Response;

/// Header carrying the access token.
pub const TOKEN_HEADER: &str = "token";

/// Header naming the calling application.
pub const APPLICATION_HEADER: &str = "application";

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<dyn Dispatch>,
}

impl AppState {
    pub fn new(dispatcher: impl Dispatch + 'static) -> Self {
        Self {
            dispatcher: Arc::new(dispatcher),
        }
    }
}

// =============================================================================
// Health Check
// =============================================================================

/// Health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

// =============================================================================
// RPC
// =============================================================================

/// RPC endpoint.
///
/// The body must be a JSON object. Non-UTF-8 header values are treated as
/// absent.
pub async fn dispatch(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, DispatchError> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };

    let request = DispatchRequest {
        token: header(TOKEN_HEADER),
        application: header(APPLICATION_HEADER),
        body: parse_body(&body)?,
    };

    info!(
        application = request.application.as_deref().unwrap_or(""),
        body_length = body.len(),
        "rpc_request_received"
    );

    state.dispatcher.dispatch(request).await
}

fn parse_body(body: &[u8]) -> Result<Map<String, Value>, DispatchError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Map::new());
    }

    match serde_json::from_slice(body) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(DispatchError::BadRequest(
            "Request body must be a JSON object".to_string(),
        )),
        Err(e) => Err(DispatchError::BadRequest(format!("Invalid JSON: {e}"))),
    }
}
