use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use ganglion_agent::availability::{ServiceAvailabilityMonitor, ServiceStatus};
use serde::Serialize;
use tracing::{error, info};

#[derive(Clone)]
pub struct HealthState {
    monitor: Arc<ServiceAvailabilityMonitor>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub reasoning: ServiceStatus,
    pub negotiation: ServiceStatus,
    pub checked_at: String,
}

pub fn router(monitor: Arc<ServiceAvailabilityMonitor>) -> Router {
    Router::new().route("/health", get(health)).with_state(HealthState { monitor })
}

pub async fn spawn(
    bind_address: &str,
    port: u16,
    monitor: Arc<ServiceAvailabilityMonitor>,
) -> std::io::Result<()> {
    let address = format!("{bind_address}:{port}");
    let listener = tokio::net::TcpListener::bind(&address).await?;

    info!(
        event_name = "system.health.start",
        correlation_id = "bootstrap",
        bind_address = %address,
        "health endpoint started"
    );

    tokio::spawn(async move {
        if let Err(error) = axum::serve(listener, router(monitor)).await {
            error!(
                event_name = "system.health.error",
                correlation_id = "bootstrap",
                error = %error,
                "health endpoint server terminated unexpectedly"
            );
        }
    });

    Ok(())
}

/// Sessions keep running on reasoning alone when negotiation can fall back,
/// so only a reasoning outage makes the process unavailable.
pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let snapshot = state.monitor.snapshot();
    let (status, code) = match (snapshot.reasoning.available, snapshot.negotiation.available) {
        (true, true) => ("ready", StatusCode::OK),
        (true, false) => ("degraded", StatusCode::OK),
        (false, _) => ("unavailable", StatusCode::SERVICE_UNAVAILABLE),
    };

    let payload = HealthResponse {
        status,
        reasoning: snapshot.reasoning,
        negotiation: snapshot.negotiation,
        checked_at: Utc::now().to_rfc3339(),
    };
    (code, Json(payload))
}
