//! Drug batch handlers.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Extension, Path, State};
use axum::Json;
use tracing::instrument;

use crate::api::auth_helpers::{body_rejection, ensure_uploader};
use crate::api::error::{not_found, ApiError, ErrorCode};
use crate::api::types::{UploadResponse, VerifyBatchResponse};
use crate::auth::AuthContextExt;
use crate::domain::{BatchRecord, UploadRequest};
use crate::server::AppState;

/// POST /api/drugs/upload - Register a batch and mint its token.
#[instrument(skip(state, auth, body), fields(key_id = %auth.key_id))]
pub async fn upload_batch(
    State(state): State<AppState>,
    Extension(AuthContextExt(auth)): Extension<AuthContextExt>,
    body: Result<Json<UploadRequest>, JsonRejection>,
) -> Result<Json<UploadResponse>, ApiError> {
    ensure_uploader(&auth)?;
    let Json(request) = body.map_err(body_rejection)?;

    let outcome = state.coordinator.uploads.upload(request).await?;
    Ok(Json(outcome.into()))
}

/// GET /api/drugs/:batch_id - Stored batch record.
pub async fn get_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<String>,
) -> Result<Json<BatchRecord>, ApiError> {
    state
        .coordinator
        .uploads
        .batch(&batch_id)
        .await?
        .map(Json)
        .ok_or_else(|| not_found(ErrorCode::BatchNotFound, "Batch", &batch_id))
}

/// GET /api/drugs/verify/:batch_id - Consumer verification.
///
/// Always 200; unknown or malformed ids report `invalid`.
pub async fn verify_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<String>,
) -> Result<Json<VerifyBatchResponse>, ApiError> {
    let verification = state.coordinator.uploads.verify_batch(&batch_id).await?;
    Ok(Json(VerifyBatchResponse::new(batch_id, verification)))
}
