//! Health and introspection endpoints for the relay.
//!
//! Kubernetes-compatible probes:
//! - `GET /health` - liveness (is the process running?)
//! - `GET /ready` - readiness (are the dispatcher and listeners up?)
//!
//! Plus an operator endpoint:
//! - `GET /status` - relay id, registry counts and routing counters as JSON
//!
//! The `/metrics` endpoint is served separately via
//! `metrics-exporter-prometheus` and merged into the same router by `main`.

use crate::actors::{RelayActorHandle, RelayMetrics};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Json;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Liveness and readiness flags shared with the probe handlers.
#[derive(Debug)]
pub struct HealthState {
    /// True once startup initialization completes.
    live: AtomicBool,
    /// True when the dispatcher is running and listeners are bound.
    ready: AtomicBool,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    /// Create a new health state (live=true, ready=false).
    #[must_use]
    pub fn new() -> Self {
        Self {
            live: AtomicBool::new(true),
            ready: AtomicBool::new(false),
        }
    }

    /// Mark the relay as ready to accept connections.
    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    /// Mark the relay as not ready (during shutdown).
    pub fn set_not_ready(&self) {
        self.ready.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

/// Router with the liveness and readiness probes.
pub fn health_router(health_state: Arc<HealthState>) -> axum::Router {
    axum::Router::new()
        .route("/health", get(liveness_handler))
        .route("/ready", get(readiness_handler))
        .with_state(health_state)
}

/// Router with the `/status` introspection endpoint.
pub fn status_router(relay: RelayActorHandle, metrics: Arc<RelayMetrics>) -> axum::Router {
    axum::Router::new()
        .route("/status", get(status_handler))
        .with_state((relay, metrics))
}

async fn liveness_handler(State(state): State<Arc<HealthState>>) -> StatusCode {
    if state.is_live() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn readiness_handler(State(state): State<Arc<HealthState>>) -> StatusCode {
    if state.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn status_handler(
    State((relay, metrics)): State<(RelayActorHandle, Arc<RelayMetrics>)>,
) -> Response {
    match relay.status().await {
        Ok(status) => Json(json!({
            "relay_id": status.relay_id,
            "sessions": status.sessions,
            "pending_joins": status.pending_joins,
            "deferred_handoffs": status.deferred_handoffs,
            "counters": metrics.snapshot(),
        }))
        .into_response(),
        Err(_) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::actors::RelaySettings;
    use axum::body::Body;
    use axum::http::Request;
    use tower::util::ServiceExt;

    #[test]
    fn test_health_state_default() {
        let state = HealthState::new();
        assert!(state.is_live(), "Should be live by default");
        assert!(!state.is_ready(), "Should not be ready by default");
    }

    #[test]
    fn test_health_state_set_ready() {
        let state = HealthState::new();

        state.set_ready();
        assert!(state.is_ready(), "Should be ready after set_ready()");

        state.set_not_ready();
        assert!(
            !state.is_ready(),
            "Should not be ready after set_not_ready()"
        );
    }

    #[tokio::test]
    async fn test_health_router_liveness_endpoint() {
        let app = health_router(Arc::new(HealthState::new()));

        let request = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .expect("Failed to build request");
        let response = app.oneshot(request).await.expect("Failed to execute request");

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_health_router_readiness_transitions() {
        let state = Arc::new(HealthState::new());
        let app = health_router(Arc::clone(&state));

        let request = Request::builder()
            .uri("/ready")
            .body(Body::empty())
            .expect("Failed to build request");
        let response = app
            .clone()
            .oneshot(request)
            .await
            .expect("Failed to execute request");
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        state.set_ready();
        let request = Request::builder()
            .uri("/ready")
            .body(Body::empty())
            .expect("Failed to build request");
        let response = app.oneshot(request).await.expect("Failed to execute request");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_status_endpoint_reports_registry_counts() {
        let metrics = RelayMetrics::new();
        let relay = RelayActorHandle::new(
            "relay-status-test".to_string(),
            RelaySettings::default(),
            Arc::clone(&metrics),
        );
        let app = status_router(relay.clone(), metrics);

        let request = Request::builder()
            .uri("/status")
            .body(Body::empty())
            .expect("Failed to build request");
        let response = app.oneshot(request).await.expect("Failed to execute request");
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("Failed to read body");
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["relay_id"], "relay-status-test");
        assert_eq!(value["sessions"], 0);
        assert_eq!(value["counters"]["messages_routed"], 0);

        relay.cancel();
    }
}
