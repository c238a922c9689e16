//! Webhook endpoint handlers.
//!
//! The DocuSign handler only:
//! 1. Checks the bearer token
//! 2. Enqueues the raw body to RabbitMQ
//! 3. Answers 200, 401 or 500
//!
//! Nothing about the payload is parsed here.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    Json,
};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::auth::TokenValidator;
use crate::queue::{Job, JobSink};

const BEARER_PREFIX: &str = "Bearer ";

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub validator: Arc<TokenValidator>,
    pub sink: Arc<dyn JobSink>,
}

impl AppState {
    pub fn new(validator: TokenValidator, sink: Arc<dyn JobSink>) -> Self {
        Self {
            validator: Arc::new(validator),
            sink,
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
// DocuSign Webhook
// =============================================================================

/// Pull the token out of an `Authorization: Bearer <token>` header.
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix(BEARER_PREFIX)
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// DocuSign webhook endpoint.
pub async fn docusign_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, &'static str) {
    info!(body_length = body.len(), "docusign_webhook_received");

    let Some(token) = bearer_token(&headers) else {
        warn!(
            has_authorization = headers.contains_key(AUTHORIZATION),
            "docusign_auth_missing"
        );
        return (StatusCode::UNAUTHORIZED, "Unauthorized");
    };

    if !state.validator.validate(token) {
        return (StatusCode::UNAUTHORIZED, "Unauthorized");
    }

    // Runs on its own task: a client disconnect does not abort the publish,
    // and a panic inside it surfaces here as a JoinError.
    let sink = Arc::clone(&state.sink);
    let job = Job::new(body);
    let outcome = tokio::spawn(async move { sink.enqueue(job).await }).await;

    match outcome {
        Ok(Ok(())) => {
            info!("docusign_enqueued");
            (StatusCode::OK, "Webhook Acknowledged")
        }
        Ok(Err(e)) => {
            error!(error = %e, "docusign_publish_failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
        }
        Err(e) => {
            error!(error = %e, "docusign_enqueue_task_failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
        }
    }
}
