//! Authorization helper functions for REST API handlers.

use axum::extract::rejection::JsonRejection;

use super::error::{forbidden, ApiError, ErrorCode};
use crate::auth::AuthContext;
use crate::domain::ManufacturerAddress;

/// Regulator role required (manufacturer verify/revoke, reconciliation).
pub fn ensure_regulator(auth: &AuthContext) -> Result<(), ApiError> {
    if !auth.is_regulator() {
        return Err(forbidden("Regulator role required"));
    }
    Ok(())
}

pub fn ensure_uploader(auth: &AuthContext) -> Result<(), ApiError> {
    if !auth.can_upload() {
        return Err(forbidden("Upload permission required"));
    }
    Ok(())
}

/// Parse an address field, reporting failures against `field`.
pub fn parse_address(field: &str, raw: &str) -> Result<ManufacturerAddress, ApiError> {
    ManufacturerAddress::parse(raw).map_err(|e| super::error::validation_error(field, e.to_string()))
}

/// Structured body for a rejected JSON extractor.
pub fn body_rejection(rejection: JsonRejection) -> ApiError {
    ApiError::new(ErrorCode::InvalidRequestBody, rejection.body_text())
}
