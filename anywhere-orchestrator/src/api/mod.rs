// HTTP surface over the provisioning service.
pub mod docs;
pub mod handlers;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::provisioning::ProvisioningService;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ProvisioningService>,
}

impl AppState {
    pub fn new(service: Arc<ProvisioningService>) -> Arc<Self> {
        Arc::new(Self { service })
    }
}

/// Permissive CORS; the API sits behind the operator's own front end.
pub fn create_cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/api-docs/openapi.json", get(docs::openapi_json))
        .route("/api/v2ray/regions", get(handlers::list_regions))
        .route(
            "/api/v2ray/instances",
            get(handlers::list_instances).post(handlers::create_instance),
        )
        .route(
            "/api/v2ray/instances/{uuid}",
            get(handlers::get_instance).delete(handlers::delete_instance),
        )
        .layer(TraceLayer::new_for_http())
        .layer(create_cors())
        .with_state(state)
}
