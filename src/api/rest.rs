//! REST routes for the provenance coordinator.

use axum::routing::{get, post};
use axum::Router;

use super::handlers::{
    get_batch, get_manufacturer, get_provenance, is_verified, reconcile, revoke_manufacturer,
    upload_batch, verify_batch, verify_manufacturer,
};
use crate::server::AppState;

/// Build the `/api` router. Every route sits behind the auth middleware.
pub fn router() -> Router<AppState> {
    Router::new()
        // Manufacturers
        .route("/manufacturers/verify", post(verify_manufacturer))
        .route("/manufacturers/revoke", post(revoke_manufacturer))
        .route("/manufacturers/is-verified", post(is_verified))
        .route("/manufacturers/:address", get(get_manufacturer))
        // Drug batches
        .route("/drugs/upload", post(upload_batch))
        .route("/drugs/verify/:batch_id", get(verify_batch))
        .route("/drugs/:batch_id", get(get_batch))
        // Audit trail
        .route("/provenance/*subject", get(get_provenance))
        .route("/reconcile", post(reconcile))
}
