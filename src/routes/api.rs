use crate::{
    handlers::{diagnostics, doc_history, doc_latest, health_check, ready_check},
    AppState,
};
use axum::{routing::get, Router};
use std::sync::Arc;

/// Create API routes
pub fn create_api_routes(app_state: Arc<AppState>) -> Router {
    Router::<Arc<AppState>>::new()
        .route("/health", get(health_check))
        .route("/ready", get(ready_check))
        .route("/v1/diagnostics", get(diagnostics))
        .route("/v1/documents/:doc_id", get(doc_latest))
        .route("/v1/documents/:doc_id/history", get(doc_history))
        .with_state(app_state)
}
