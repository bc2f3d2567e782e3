//! HTTP front end and background scheduling for docbroker.
//!
//! The router exposes webhook intake plus manual triggers for every workflow; [`scheduler`]
//! runs the same workflows on timers.

pub mod config;
pub mod error;
pub mod handlers;
pub mod scheduler;
pub mod services;
pub mod sinks;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use handlers::AppState;
pub use services::{Services, Stores};

/// Build the application router.
pub fn router(services: Services) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health_handler))
        .route("/webhooks/notifications", post(handlers::notifications_handler))
        .route("/sync/{feed}", post(handlers::sync_handler))
        .route("/publication/drain", post(handlers::drain_handler))
        .route(
            "/subscriptions/ensure",
            post(handlers::ensure_subscriptions_handler),
        )
        .route(
            "/documents/{site_id}/{list_id}/{file_name}",
            post(handlers::register_document_handler),
        )
        .route(
            "/documents/{object_id}",
            get(handlers::get_document_handler).delete(handlers::delete_document_handler),
        )
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { services })
}
