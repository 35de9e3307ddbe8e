//! HTTP router.

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::auth::{self, AppState};

/// Builds the relay's router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/auth/login", get(auth::login))
        .route("/auth/callback", get(auth::callback))
        .route("/auth/webhook", post(auth::webhook))
        .route("/health", get(auth::health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
