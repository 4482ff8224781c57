//! Manufacturer authorization handlers.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Extension, Path, State};
use axum::Json;
use tracing::{info, instrument};

use crate::api::auth_helpers::{body_rejection, ensure_regulator, parse_address};
use crate::api::error::{not_found, ApiError, ErrorCode};
use crate::api::types::{AddressRequest, IsVerifiedResponse, MutationResponse};
use crate::auth::AuthContextExt;
use crate::domain::ManufacturerRecord;
use crate::server::AppState;

/// POST /api/manufacturers/verify - Authorize a manufacturer in the registry.
#[instrument(skip(state, auth, body), fields(key_id = %auth.key_id))]
pub async fn verify_manufacturer(
    State(state): State<AppState>,
    Extension(AuthContextExt(auth)): Extension<AuthContextExt>,
    body: Result<Json<AddressRequest>, JsonRejection>,
) -> Result<Json<MutationResponse>, ApiError> {
    ensure_regulator(&auth)?;
    let Json(request) = body.map_err(body_rejection)?;
    let address = parse_address("address", &request.address)?;

    let outcome = state.coordinator.gateway.verify(address).await?;
    info!(address = %outcome.address, tx_hash = %outcome.tx_hash, "Manufacturer verified");
    Ok(Json(outcome.into()))
}

/// POST /api/manufacturers/revoke - Withdraw a manufacturer's authorization.
#[instrument(skip(state, auth, body), fields(key_id = %auth.key_id))]
pub async fn revoke_manufacturer(
    State(state): State<AppState>,
    Extension(AuthContextExt(auth)): Extension<AuthContextExt>,
    body: Result<Json<AddressRequest>, JsonRejection>,
) -> Result<Json<MutationResponse>, ApiError> {
    ensure_regulator(&auth)?;
    let Json(request) = body.map_err(body_rejection)?;
    let address = parse_address("address", &request.address)?;

    let outcome = state.coordinator.gateway.revoke(address).await?;
    info!(address = %outcome.address, tx_hash = %outcome.tx_hash, "Manufacturer revoked");
    Ok(Json(outcome.into()))
}

/// POST /api/manufacturers/is-verified - Current registry answer.
pub async fn is_verified(
    State(state): State<AppState>,
    body: Result<Json<AddressRequest>, JsonRejection>,
) -> Result<Json<IsVerifiedResponse>, ApiError> {
    let Json(request) = body.map_err(body_rejection)?;
    let address = parse_address("address", &request.address)?;

    let is_verified = state.coordinator.gateway.is_authorized(&address).await?;
    Ok(Json(IsVerifiedResponse { is_verified }))
}

/// GET /api/manufacturers/:address - Locally cached manufacturer record.
pub async fn get_manufacturer(
    State(state): State<AppState>,
    Path(raw): Path<String>,
) -> Result<Json<ManufacturerRecord>, ApiError> {
    let address = parse_address("address", &raw)?;

    state
        .coordinator
        .gateway
        .manufacturer(&address)
        .await?
        .map(Json)
        .ok_or_else(|| not_found(ErrorCode::ManufacturerNotFound, "Manufacturer", address))
}
