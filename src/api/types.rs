//! Shared request and response types for REST API handlers.

use serde::{Deserialize, Serialize};

use crate::coordinator::{BatchVerification, MutationOutcome, UploadOutcome, VerificationStatus};
use crate::domain::{BatchStatus, ProvenanceEvent};

// ============================================================================
// Manufacturer types
// ============================================================================

/// Body of the verify, revoke and is-verified endpoints.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct AddressRequest {
    pub address: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationResponse {
    pub success: bool,
    pub transaction_hash: String,
    pub audit_pending: bool,
}

impl From<MutationOutcome> for MutationResponse {
    fn from(outcome: MutationOutcome) -> Self {
        Self {
            success: true,
            transaction_hash: outcome.tx_hash.as_str().to_string(),
            audit_pending: outcome.audit_pending,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IsVerifiedResponse {
    pub is_verified: bool,
}

// ============================================================================
// Drug batch types
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub success: bool,
    pub token_id: String,
    pub audit_pending: bool,
    pub batch_id: String,
    pub status: BatchStatus,
    /// The batch was already registered with identical contents
    pub replayed: bool,
}

impl From<UploadOutcome> for UploadResponse {
    fn from(outcome: UploadOutcome) -> Self {
        let record = outcome.record;
        Self {
            success: true,
            token_id: record
                .token_id
                .map(|t| t.as_str().to_string())
                .unwrap_or_default(),
            audit_pending: outcome.audit_pending,
            batch_id: record.batch_id,
            status: record.status,
            replayed: outcome.replayed,
        }
    }
}

/// Consumer-facing answer for a scanned batch id.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyBatchResponse {
    pub status: VerificationStatus,
    pub batch_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drug_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiry: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_id: Option<String>,
}

impl VerifyBatchResponse {
    pub fn new(batch_id: impl Into<String>, verification: BatchVerification) -> Self {
        let record = verification.record;
        Self {
            status: verification.status,
            batch_id: batch_id.into(),
            drug_name: record.as_ref().map(|r| r.drug_name.clone()),
            expiry: record.as_ref().map(|r| r.expiry.clone()),
            manufacturer: record.as_ref().map(|r| r.manufacturer.clone()),
            token_id: record
                .and_then(|r| r.token_id)
                .map(|t| t.as_str().to_string()),
        }
    }
}

// ============================================================================
// Provenance types
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvenanceResponse {
    pub subject: String,
    pub events: Vec<ProvenanceEvent>,
}
