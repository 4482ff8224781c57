//! Drug batch records and upload requests

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;

use super::{validate_batch_id, EventDraft, EventType, ManufacturerAddress, TokenId};

/// Workflow state of a batch.
///
/// `Pending` only exists while an upload is in flight; records are first
/// persisted at `TokenMinted`. `Recorded` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    TokenMinted,
    Recorded,
    PendingAudit,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::TokenMinted => "token_minted",
            BatchStatus::Recorded => "recorded",
            BatchStatus::PendingAudit => "pending_audit",
            BatchStatus::Failed => "failed",
        }
    }

    /// A token exists for the batch.
    pub fn is_minted(&self) -> bool {
        matches!(
            self,
            BatchStatus::TokenMinted | BatchStatus::PendingAudit | BatchStatus::Recorded
        )
    }

    /// Audit trail still catching up.
    pub fn awaits_audit(&self) -> bool {
        matches!(self, BatchStatus::TokenMinted | BatchStatus::PendingAudit)
    }

    pub fn can_transition_to(&self, next: BatchStatus) -> bool {
        use BatchStatus::*;
        matches!(
            (self, next),
            (Pending, TokenMinted)
                | (Pending, Failed)
                | (TokenMinted, Recorded)
                | (TokenMinted, PendingAudit)
                | (PendingAudit, Recorded)
        )
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw upload body, as sent by the admin portal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UploadRequest {
    pub drug_name: String,
    pub manufacturer: String,
    pub batch_id: String,
    pub expiry: String,
    pub sender_address: String,
}

/// Field-level validation failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct FieldError {
    pub field: &'static str,
    pub message: String,
}

impl FieldError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

/// An upload request that passed validation
#[derive(Debug, Clone, PartialEq)]
pub struct NewBatch {
    pub batch_id: String,
    pub drug_name: String,
    pub manufacturer: String,
    pub expiry: String,
    pub sender_address: ManufacturerAddress,
}

impl NewBatch {
    pub fn validate(request: &UploadRequest) -> Result<Self, FieldError> {
        let required = [
            ("drugName", &request.drug_name),
            ("manufacturer", &request.manufacturer),
            ("batchId", &request.batch_id),
            ("expiry", &request.expiry),
            ("senderAddress", &request.sender_address),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(FieldError::new(field, "All fields are required"));
            }
        }

        let batch_id = request.batch_id.trim().to_string();
        validate_batch_id(&batch_id).map_err(|m| FieldError::new("batchId", m))?;

        let expiry = request.expiry.trim().to_string();
        if !is_valid_expiry(&expiry) {
            return Err(FieldError::new(
                "expiry",
                "expected YYYY-MM-DD or an RFC 3339 timestamp",
            ));
        }

        let sender_address = ManufacturerAddress::parse(&request.sender_address)
            .map_err(|e| FieldError::new("senderAddress", e.to_string()))?;

        Ok(Self {
            batch_id,
            drug_name: request.drug_name.trim().to_string(),
            manufacturer: request.manufacturer.trim().to_string(),
            expiry,
            sender_address,
        })
    }

    pub fn subject_key(&self) -> String {
        batch_subject_key(&self.batch_id)
    }
}

fn is_valid_expiry(expiry: &str) -> bool {
    NaiveDate::parse_from_str(expiry, "%Y-%m-%d").is_ok()
        || DateTime::parse_from_rfc3339(expiry).is_ok()
}

/// Ordering key for provenance events about a batch.
pub fn batch_subject_key(batch_id: &str) -> String {
    format!("batch/{}", batch_id)
}

/// Persisted batch, keyed by batch id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRecord {
    pub batch_id: String,
    pub drug_name: String,
    pub manufacturer: String,
    pub sender_address: ManufacturerAddress,
    pub expiry: String,
    pub token_id: Option<TokenId>,
    pub status: BatchStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub audit_event_key: Option<String>,
    pub audit_sequence_number: Option<u64>,
}

impl BatchRecord {
    pub fn minted(batch: &NewBatch, token_id: TokenId, at: DateTime<Utc>) -> Self {
        Self {
            batch_id: batch.batch_id.clone(),
            drug_name: batch.drug_name.clone(),
            manufacturer: batch.manufacturer.clone(),
            sender_address: batch.sender_address,
            expiry: batch.expiry.clone(),
            token_id: Some(token_id),
            status: BatchStatus::TokenMinted,
            created_at: at,
            updated_at: at,
            audit_event_key: None,
            audit_sequence_number: None,
        }
    }

    pub fn subject_key(&self) -> String {
        batch_subject_key(&self.batch_id)
    }

    /// Same batch contents as an incoming upload.
    pub fn matches(&self, batch: &NewBatch) -> bool {
        self.batch_id == batch.batch_id
            && self.drug_name == batch.drug_name
            && self.manufacturer == batch.manufacturer
            && self.expiry == batch.expiry
            && self.sender_address == batch.sender_address
    }

    /// The `BatchUploaded` event for this record.
    pub fn upload_event(&self) -> EventDraft {
        EventDraft::new(
            EventType::BatchUploaded,
            self.subject_key(),
            json!({
                "drugName": self.drug_name,
                "manufacturer": self.manufacturer,
                "batchId": self.batch_id,
                "expiry": self.expiry,
                "senderAddress": self.sender_address.to_string(),
                "tokenId": self.token_id.as_ref().map(|t| t.as_str()),
            }),
        )
    }

    pub fn transition(
        &mut self,
        next: BatchStatus,
        at: DateTime<Utc>,
    ) -> Result<(), (BatchStatus, BatchStatus)> {
        if !self.status.can_transition_to(next) {
            return Err((self.status, next));
        }
        self.status = next;
        self.updated_at = at;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> UploadRequest {
        UploadRequest {
            drug_name: "Amoxicillin".to_string(),
            manufacturer: "Acme Pharma".to_string(),
            batch_id: "B1".to_string(),
            expiry: "2027-01-31".to_string(),
            sender_address: "0.0.111".to_string(),
        }
    }

    #[test]
    fn test_validate_ok() {
        let batch = NewBatch::validate(&request()).unwrap();
        assert_eq!(batch.batch_id, "B1");
        assert_eq!(batch.subject_key(), "batch/B1");
        assert_eq!(batch.sender_address.to_string(), "0.0.111");
    }

    #[test]
    fn test_validate_missing_field() {
        let mut req = request();
        req.drug_name = "  ".to_string();
        let err = NewBatch::validate(&req).unwrap_err();
        assert_eq!(err.field, "drugName");
        assert_eq!(err.message, "All fields are required");
    }

    #[test]
    fn test_validate_expiry_formats() {
        let mut req = request();
        req.expiry = "2027-01-31T00:00:00Z".to_string();
        assert!(NewBatch::validate(&req).is_ok());

        req.expiry = "31/01/2027".to_string();
        assert_eq!(NewBatch::validate(&req).unwrap_err().field, "expiry");
    }

    #[test]
    fn test_validate_sender_address() {
        let mut req = request();
        req.sender_address = "not-an-address".to_string();
        assert_eq!(NewBatch::validate(&req).unwrap_err().field, "senderAddress");
    }

    #[test]
    fn test_upload_request_defaults_missing_fields() {
        let req: UploadRequest = serde_json::from_str(r#"{"batchId":"B9"}"#).unwrap();
        assert_eq!(req.batch_id, "B9");
        assert!(req.drug_name.is_empty());
        assert!(NewBatch::validate(&req).is_err());
    }

    #[test]
    fn test_status_transitions() {
        use BatchStatus::*;
        assert!(TokenMinted.can_transition_to(Recorded));
        assert!(TokenMinted.can_transition_to(PendingAudit));
        assert!(PendingAudit.can_transition_to(Recorded));
        assert!(!Recorded.can_transition_to(PendingAudit));
        assert!(!PendingAudit.can_transition_to(TokenMinted));
        assert!(!Failed.can_transition_to(Recorded));
    }

    #[test]
    fn test_status_predicates() {
        use BatchStatus::*;
        assert!(TokenMinted.awaits_audit() && PendingAudit.awaits_audit());
        assert!(!Recorded.awaits_audit());
        assert!(Recorded.is_minted() && TokenMinted.is_minted());
        assert!(!Pending.is_minted() && !Failed.is_minted());
    }

    #[test]
    fn test_record_matches_and_event() {
        let batch = NewBatch::validate(&request()).unwrap();
        let record = BatchRecord::minted(&batch, TokenId::new("T1"), Utc::now());
        assert!(record.matches(&batch));

        let mut other = batch.clone();
        other.drug_name = "Ibuprofen".to_string();
        assert!(!record.matches(&other));

        let event = record.upload_event();
        assert_eq!(event.event_type, EventType::BatchUploaded);
        assert_eq!(event.subject_key, "batch/B1");
        assert_eq!(event.payload["tokenId"], "T1");
        assert_eq!(event.payload["batchId"], "B1");
    }

    #[test]
    fn test_record_transition_rejects_downgrade() {
        let batch = NewBatch::validate(&request()).unwrap();
        let mut record = BatchRecord::minted(&batch, TokenId::new("T1"), Utc::now());
        record.transition(BatchStatus::Recorded, Utc::now()).unwrap();
        assert_eq!(
            record.transition(BatchStatus::PendingAudit, Utc::now()),
            Err((BatchStatus::Recorded, BatchStatus::PendingAudit))
        );
    }
}
