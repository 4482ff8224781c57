//! Provenance journal and reconciliation handlers.

use axum::extract::{Extension, Path, State};
use axum::Json;
use tracing::{info, instrument};

use crate::api::auth_helpers::ensure_regulator;
use crate::api::error::{service_unavailable, validation_error, ApiError};
use crate::api::types::ProvenanceResponse;
use crate::auth::AuthContextExt;
use crate::coordinator::ReconcileReport;
use crate::server::AppState;

/// GET /api/provenance/*subject - Journal for `manufacturer/<addr>` or `batch/<id>`.
pub async fn get_provenance(
    State(state): State<AppState>,
    Path(subject): Path<String>,
) -> Result<Json<ProvenanceResponse>, ApiError> {
    let subject = subject.trim_start_matches('/').to_string();
    if !(subject.starts_with("manufacturer/") || subject.starts_with("batch/")) {
        return Err(validation_error(
            "subject",
            "expected manufacturer/<address> or batch/<batchId>",
        ));
    }

    let events = state.coordinator.recorder.events_for(&subject).await?;
    Ok(Json(ProvenanceResponse { subject, events }))
}

/// POST /api/reconcile - Run one reconciliation pass now.
#[instrument(skip(state, auth), fields(key_id = %auth.key_id))]
pub async fn reconcile(
    State(state): State<AppState>,
    Extension(AuthContextExt(auth)): Extension<AuthContextExt>,
) -> Result<Json<ReconcileReport>, ApiError> {
    ensure_regulator(&auth)?;

    let reconciler = state
        .reconciler
        .as_ref()
        .ok_or_else(|| service_unavailable("Reconciliation is disabled"))?;

    let report = reconciler.run_once().await?;
    info!(
        unresolved = report.unresolved,
        acknowledged = report.acknowledged,
        promoted = report.batches_promoted,
        "Manual reconciliation pass"
    );
    Ok(Json(report))
}
