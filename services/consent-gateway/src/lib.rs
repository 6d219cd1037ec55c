// Consent Gateway Library
// HTTP and WebSocket surface over the consent engine; exposed for tests

pub mod error;
pub mod handlers;
pub mod ws;

use axum::{
    routing::{get, post},
    Router,
};
use consent_engine::config::HubConfig;
use consent_engine::{ConsentService, Database, NotificationHub};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use error::GatewayError;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub consents: Arc<ConsentService>,
    pub hub: Arc<NotificationHub>,
    pub wait: HubConfig,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics_handler))
        .route("/ws", get(ws::websocket_handler))
        .route("/api/account-consent", post(handlers::create_account_consent))
        .route("/api/product-consents", post(handlers::create_product_consent))
        .route("/api/consents/:consent_id/wait", get(handlers::wait_for_approval))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
