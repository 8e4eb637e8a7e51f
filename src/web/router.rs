//! Route definitions for the web API.

use axum::{
    routing::{get, post},
    Router,
};

use super::{api, AppState};

/// Create the API router.
pub fn create_api_router() -> Router<AppState> {
    Router::new()
        .route("/messages", get(api::list_messages))
        .route("/send", post(api::send_message))
}

/// Create the full app router.
pub fn create_app_router(state: AppState) -> Router {
    Router::new()
        .nest("/api", create_api_router())
        .route("/health", get(health_check))
        .with_state(state)
}

/// Health check endpoint.
async fn health_check() -> &'static str {
    "OK"
}
