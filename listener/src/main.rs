//! DocuSign listener - webhook gateway binary.
//!
//! This binary:
//! - Fetches the identity provider's signing keys (fatal if unavailable)
//! - Receives DocuSign webhooks and verifies their bearer tokens
//! - Enqueues raw payloads to a durable RabbitMQ queue
//!
//! The listener only binds once the key set is loaded, so `/health` never
//! answers for an instance that cannot authenticate requests.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::{net::TcpListener, signal};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use listener::{router, AppState, Config, KeyResolver, Publisher, TokenValidator};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("listener_starting");

    // Load configuration
    let config = Config::from_env().context("Invalid configuration")?;
    info!(
        port = config.port,
        rabbitmq_url_set = !config.broker_connection_url.is_empty(),
        queue = %config.queue_name,
        issuer = %config.issuer_url(),
        broker_timeout_ms = config.broker_timeout_ms,
        "config_loaded"
    );

    // Fetch signing keys before accepting any traffic
    let resolver = KeyResolver::new(config.jwks_url(), config.jwks_fetch_timeout())?;
    let key_set = resolver
        .resolve()
        .await
        .context("Cannot start without the identity provider's key set")?;

    let validator = TokenValidator::new(
        Arc::new(key_set),
        &config.issuer_url(),
        &config.identity_audience,
    );

    let publisher = Publisher::new(
        config.broker_connection_url.clone(),
        config.queue_name.clone(),
        config.broker_timeout(),
    );
    info!(queue = %publisher.queue_name(), "rabbitmq_publisher_created");

    let app = router(AppState::new(validator, Arc::new(publisher)));

    // Bind to address
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    info!(address = %addr, "listener_listening");

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("listener_shutdown_complete");

    Ok(())
}

/// Create a future that completes when a shutdown signal is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }

    info!("listener_shutting_down");
}
