//! Web server module for handling inbound DocuSign webhooks.
//!
//! This module provides a thin web server that:
//! - Receives DocuSign Connect callbacks
//! - Verifies the bearer token against the identity provider's keys
//! - Enqueues the raw payload to RabbitMQ
//!
//! All processing of the payload happens downstream of the queue.

pub mod handlers;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

pub use handlers::{docusign_webhook, health, AppState, HealthResponse};

/// Build the application router.
///
/// The webhook route takes bodies of any size: DocuSign Connect payloads can
/// embed whole documents, and the only answers are 200, 401 and 500.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/docusign_webhook",
            post(docusign_webhook).layer(DefaultBodyLimit::disable()),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
