pub mod client;
pub mod collab;
pub mod config;
pub mod db;
pub mod docs;
pub mod error;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod websocket;

use std::sync::Arc;

use axum::{http::HeaderValue, routing::get, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use collab::DocRegistry;
use config::Config;
use db::OpStore;
use docs::ApiDoc;
use routes::create_api_routes;
use websocket::websocket_handler;

/// State shared by every HTTP and WebSocket handler
pub struct AppState {
    pub config: Config,
    pub registry: DocRegistry,
}

impl AppState {
    pub fn new(config: Config, store: Arc<dyn OpStore>) -> Self {
        let registry = DocRegistry::new(store, config.coordinator_settings());
        Self { config, registry }
    }
}

/// Assemble the HTTP API, the WebSocket endpoint and the Swagger UI
pub fn build_app(app_state: Arc<AppState>) -> Router {
    let cors = cors_layer(&app_state.config);

    let app_routes = Router::new()
        // Mount API routes
        .nest("/api", create_api_routes(app_state.clone()))
        // Mount the collaboration socket
        .route("/ws", get(websocket_handler).with_state(app_state))
        // Mount Swagger UI
        .merge(SwaggerUi::new("/swagger").url("/api-docs/openapi.json", ApiDoc::openapi()))
        // Add tracing layer
        .layer(TraceLayer::new_for_http());

    match cors {
        Some(cors) => app_routes.layer(cors),
        None => app_routes,
    }
}

fn cors_layer(config: &Config) -> Option<CorsLayer> {
    let origins: Vec<HeaderValue> = config
        .cors_origin_list()
        .into_iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin '{}'", origin);
                None
            }
        })
        .collect();
    if origins.is_empty() {
        return None;
    }
    Some(CorsLayer::new().allow_origin(origins).allow_methods(Any).allow_headers(Any))
}
