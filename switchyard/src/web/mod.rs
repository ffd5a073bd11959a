//! Web server module for the RPC endpoint.
//!
//! The server is a thin front for the dispatcher: it turns headers and the
//! JSON body into a [`DispatchRequest`](crate::dispatch::DispatchRequest) and
//! renders the worker's [`Response`](crate::response::Response).

pub mod handlers;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub use handlers::{dispatch, health, AppState, HealthResponse, APPLICATION_HEADER, TOKEN_HEADER};

/// Path of the health check endpoint.
pub const HEALTH_ROUTE: &str = "/health";

/// Build the router serving the dispatcher at `route`.
///
/// `route` must start with `/` and differ from [`HEALTH_ROUTE`]; see
/// [`Config::rpc_route`](crate::config::Config::rpc_route).
pub fn router(state: AppState, route: &str) -> Router {
    Router::new()
        .route(HEALTH_ROUTE, get(health))
        .route(route, post(dispatch))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
