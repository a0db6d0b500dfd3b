//! Rendezvous Relay
//!
//! Stateful WebSocket rendezvous relay for peer-to-peer session negotiation.
//!
//! # Servers
//!
//! The relay runs two servers:
//! - WebSocket server for client signaling (default: 0.0.0.0:9301)
//! - HTTP server for health, status and metrics endpoints (default: 0.0.0.0:8081)
//!
//! # Architecture
//!
//! A single `RelayActor` owns the session registry, connection graph,
//! pending join retries and deferred moderation handoffs. Connection tasks
//! and retry timers talk to it through `RelayActorHandle`.
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Initialize actor system (`RelayActorHandle`)
//! 4. Start health HTTP server (liveness, readiness, status, metrics)
//! 5. Start WebSocket server for clients
//! 6. Wait for shutdown signal

#![warn(clippy::pedantic)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use metrics_exporter_prometheus::PrometheusBuilder;
use rendezvous_relay::actors::{RelayActorHandle, RelayMetrics, RelaySettings};
use rendezvous_relay::config::Config;
use rendezvous_relay::errors::RelayError;
use rendezvous_relay::observability::{health_router, status_router, HealthState};
use rendezvous_relay::transport::{ws_router, WsState};
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rendezvous_relay=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Rendezvous Relay");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;
    let config = Arc::new(config);

    info!(
        relay_id = %config.relay_id,
        bind_address = %config.bind_address,
        health_bind_address = %config.health_bind_address,
        message_event = %config.message_event,
        max_password_tries = config.max_password_tries,
        join_retry_ticks = config.join_retry_ticks,
        join_retry_interval_ms = config.join_retry_interval_ms,
        "Configuration loaded successfully"
    );

    // Initialize Prometheus metrics recorder
    // This must happen before any metrics are recorded
    let prometheus_handle = PrometheusBuilder::new().install_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        format!("Failed to install Prometheus metrics recorder: {e}")
    })?;

    // Initialize health state
    let health_state = Arc::new(HealthState::new());

    // Initialize actor system
    let relay_metrics = RelayMetrics::new();
    let relay = RelayActorHandle::new(
        config.relay_id.clone(),
        RelaySettings::from(config.as_ref()),
        Arc::clone(&relay_metrics),
    );
    info!("Actor system initialized");

    // Shutdown token as child of the relay's token, so all server tasks
    // stop when the relay shuts down
    let shutdown_token = relay.child_token();

    // Start health HTTP server (MUST succeed - fail startup if it doesn't)
    let health_addr: SocketAddr = config.health_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.health_bind_address, "Invalid health bind address");
        RelayError::Config(format!("Invalid health bind address: {e}"))
    })?;

    let metrics_router = Router::new().route(
        "/metrics",
        axum::routing::get(move || {
            let handle = prometheus_handle.clone();
            async move { handle.render() }
        }),
    );

    let health_app = health_router(Arc::clone(&health_state))
        .merge(status_router(relay.clone(), Arc::clone(&relay_metrics)))
        .merge(metrics_router);

    // Bind listener BEFORE spawning to fail fast on bind errors
    let health_listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %health_addr, "Failed to bind health server");
            format!("Failed to bind health server to {health_addr}: {e}")
        })?;
    info!(addr = %health_addr, "Health server bound successfully");

    let health_shutdown_token = shutdown_token.child_token();
    tokio::spawn(async move {
        info!(addr = %health_addr, "Health server starting");
        let server = axum::serve(health_listener, health_app).with_graceful_shutdown(async move {
            health_shutdown_token.cancelled().await;
            info!("Health server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });

    // Start WebSocket server for clients
    let ws_addr: SocketAddr = config.bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.bind_address, "Invalid bind address");
        RelayError::Config(format!("Invalid bind address: {e}"))
    })?;

    let ws_app = ws_router(WsState::new(relay.clone(), Arc::clone(&config)))
        .layer(TraceLayer::new_for_http());

    let ws_listener = tokio::net::TcpListener::bind(ws_addr).await.map_err(|e| {
        error!(error = %e, addr = %ws_addr, "Failed to bind WebSocket server");
        format!("Failed to bind WebSocket server to {ws_addr}: {e}")
    })?;
    info!(addr = %ws_addr, "WebSocket server bound successfully");

    let ws_shutdown_token = shutdown_token.child_token();
    tokio::spawn(async move {
        info!(addr = %ws_addr, "WebSocket server starting");
        let server = axum::serve(ws_listener, ws_app).with_graceful_shutdown(async move {
            ws_shutdown_token.cancelled().await;
            info!("WebSocket server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "WebSocket server failed");
        }
    });

    // Both listeners are bound and the dispatcher is running
    health_state.set_ready();
    info!("Rendezvous Relay running - press Ctrl+C to shutdown");

    shutdown_signal().await;

    info!("Shutdown signal received, initiating graceful shutdown...");

    // Mark as not ready immediately so load balancers stop sending traffic
    health_state.set_not_ready();

    // Cancelling the relay's root token stops the dispatcher, every
    // connection task and every pending join timer
    relay.cancel();

    // Give tasks time to shut down
    tokio::time::sleep(Duration::from_secs(2)).await;

    info!("Rendezvous Relay shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. This is acceptable because
/// without signal handlers, we cannot gracefully shut down the service.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
