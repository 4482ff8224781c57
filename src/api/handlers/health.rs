//! Health check and metrics handlers
//!
//! - `/health`: liveness, no dependencies touched
//! - `/ready`: document store round trip plus circuit breaker states
//! - `/metrics`: Prometheus text exposition

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::infra::collections;
use crate::server::AppState;
use crate::telemetry::SERVICE_NAME;

/// Response for the basic health check endpoint
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub service: &'static str,
    pub version: &'static str,
    pub timestamp: String,
}

/// Overall health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All components healthy
    Healthy,
    /// A collaborator's breaker is open; requests touching it fail fast
    Degraded,
    /// Document store unreachable
    Unhealthy,
}

impl HealthStatus {
    pub fn is_unhealthy(&self) -> bool {
        matches!(self, HealthStatus::Unhealthy)
    }
}

/// Individual component status
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentStatus {
    pub name: String,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessResponse {
    pub status: HealthStatus,
    pub backend: &'static str,
    pub store: ComponentStatus,
    pub circuit_breakers: serde_json::Value,
    pub reconciler_enabled: bool,
    pub uptime_secs: u64,
}

/// Liveness probe.
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: HealthStatus::Healthy,
        service: SERVICE_NAME,
        version: env!("CARGO_PKG_VERSION"),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

/// Readiness probe.
///
/// 503 when the document store cannot be read. Open breakers only degrade.
pub async fn readiness_check(
    State(state): State<AppState>,
) -> (StatusCode, Json<ReadinessResponse>) {
    let start = Instant::now();
    let store = match state.store.get(collections::SUBJECTS, "__readiness__").await {
        Ok(_) => ComponentStatus {
            name: state.backend.to_string(),
            status: HealthStatus::Healthy,
            message: None,
            response_time_ms: Some(start.elapsed().as_millis() as u64),
        },
        Err(e) => ComponentStatus {
            name: state.backend.to_string(),
            status: HealthStatus::Unhealthy,
            message: Some(format!("Store unavailable: {}", e)),
            response_time_ms: Some(start.elapsed().as_millis() as u64),
        },
    };

    let circuit_breakers = state.coordinator.breakers.status().await;
    let status = overall_status(&store, &circuit_breakers);

    let code = if status.is_unhealthy() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (
        code,
        Json(ReadinessResponse {
            status,
            backend: state.backend,
            store,
            circuit_breakers,
            reconciler_enabled: state.reconciler.is_some(),
            uptime_secs: state.coordinator.metrics.uptime_seconds(),
        }),
    )
}

/// Prometheus exposition of the in-process metrics.
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = state.coordinator.metrics.to_prometheus().await;
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}

fn overall_status(store: &ComponentStatus, breakers: &serde_json::Value) -> HealthStatus {
    if store.status.is_unhealthy() {
        return HealthStatus::Unhealthy;
    }

    let open_circuits = breakers
        .as_object()
        .map(|obj| {
            obj.values()
                .filter(|b| b.get("state").and_then(|s| s.as_str()) == Some("open"))
                .count()
        })
        .unwrap_or(0);

    if open_circuits > 0 {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}
