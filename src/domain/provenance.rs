//! Provenance events and audit-log receipts
//!
//! Every authorization change and batch registration produces one event.
//! Events sharing a subject key are journaled with a per-subject sequence
//! number and reach the audit log strictly in that order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;

use super::{ManufacturerAddress, TxHash};

/// Kind of provenance event. The variant names are the `event` values
/// written to the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    ManufacturerVerified,
    ManufacturerRevoked,
    BatchUploaded,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ManufacturerVerified => "ManufacturerVerified",
            EventType::ManufacturerRevoked => "ManufacturerRevoked",
            EventType::BatchUploaded => "BatchUploaded",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery state of an event with respect to the audit log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptStatus {
    /// Journaled, never submitted
    Unsent,
    /// Submission in flight (or interrupted before an answer arrived)
    Sent,
    /// Terminal: the log holds the entry
    Acknowledged,
    /// Last attempt failed; eligible for retry
    Failed,
}

impl ReceiptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReceiptStatus::Unsent => "unsent",
            ReceiptStatus::Sent => "sent",
            ReceiptStatus::Acknowledged => "acknowledged",
            ReceiptStatus::Failed => "failed",
        }
    }

    /// Statuses the reconciliation sweep picks up
    pub fn unresolved() -> [ReceiptStatus; 3] {
        [
            ReceiptStatus::Unsent,
            ReceiptStatus::Sent,
            ReceiptStatus::Failed,
        ]
    }
}

impl fmt::Display for ReceiptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event before it has been journaled
#[derive(Debug, Clone, PartialEq)]
pub struct EventDraft {
    pub event_type: EventType,
    pub subject_key: String,
    pub payload: serde_json::Value,
}

impl EventDraft {
    pub fn new(
        event_type: EventType,
        subject_key: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_type,
            subject_key: subject_key.into(),
            payload,
        }
    }

    pub fn manufacturer_verified(address: &ManufacturerAddress, tx_hash: &TxHash) -> Self {
        Self::new(
            EventType::ManufacturerVerified,
            address.subject_key(),
            json!({
                "address": address.to_string(),
                "txHash": tx_hash.as_str(),
            }),
        )
    }

    pub fn manufacturer_revoked(address: &ManufacturerAddress, tx_hash: &TxHash) -> Self {
        Self::new(
            EventType::ManufacturerRevoked,
            address.subject_key(),
            json!({
                "address": address.to_string(),
                "txHash": tx_hash.as_str(),
            }),
        )
    }

    /// Deterministic key over subject, type and canonical payload.
    pub fn idempotency_key(&self) -> Result<String, serde_json::Error> {
        crate::crypto::idempotency_key(&self.subject_key, self.event_type.as_str(), &self.payload)
    }
}

/// Journal entry for one provenance event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvenanceEvent {
    pub idempotency_key: String,
    pub event_type: EventType,
    pub subject_key: String,
    /// Position within the subject's journal; defines submission order
    pub subject_seq: u64,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub receipt_status: ReceiptStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Audit log sequence number once acknowledged
    pub sequence_number: Option<u64>,
}

impl ProvenanceEvent {
    pub fn journal(
        draft: &EventDraft,
        idempotency_key: String,
        subject_seq: u64,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            idempotency_key,
            event_type: draft.event_type,
            subject_key: draft.subject_key.clone(),
            subject_seq,
            payload: draft.payload.clone(),
            created_at: at,
            submitted_at: None,
            acknowledged_at: None,
            receipt_status: ReceiptStatus::Unsent,
            attempts: 0,
            last_error: None,
            sequence_number: None,
        }
    }

    pub fn is_acknowledged(&self) -> bool {
        self.receipt_status == ReceiptStatus::Acknowledged
    }

    /// True once the event may have reached the log, so a resubmission
    /// has to be preceded by a lookup.
    pub fn was_attempted(&self) -> bool {
        self.attempts > 0 || self.receipt_status == ReceiptStatus::Sent
    }

    /// Message body written to the audit log.
    ///
    /// The timestamp is the journal time, so every retry submits the same
    /// bytes.
    pub fn log_message(&self) -> serde_json::Value {
        let mut message = serde_json::Map::new();
        message.insert("event".to_string(), json!(self.event_type.as_str()));
        if let serde_json::Value::Object(fields) = &self.payload {
            for (k, v) in fields {
                message.insert(k.clone(), v.clone());
            }
        } else {
            message.insert("payload".to_string(), self.payload.clone());
        }
        message.insert("timestamp".to_string(), json!(self.created_at.to_rfc3339()));
        message.insert("idempotencyKey".to_string(), json!(self.idempotency_key));
        serde_json::Value::Object(message)
    }

    pub fn mark_sent(&mut self, at: DateTime<Utc>) {
        self.receipt_status = ReceiptStatus::Sent;
        self.attempts += 1;
        self.submitted_at = Some(at);
    }

    pub fn mark_acknowledged(&mut self, sequence_number: Option<u64>, at: DateTime<Utc>) {
        self.receipt_status = ReceiptStatus::Acknowledged;
        self.sequence_number = sequence_number;
        self.acknowledged_at = Some(at);
        self.last_error = None;
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.receipt_status = ReceiptStatus::Failed;
        self.last_error = Some(error.into());
    }

    pub fn receipt(&self) -> Receipt {
        Receipt {
            idempotency_key: self.idempotency_key.clone(),
            status: self.receipt_status,
            sequence_number: self.sequence_number,
            attempts: self.attempts,
        }
    }
}

/// Outcome of recording an event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub idempotency_key: String,
    pub status: ReceiptStatus,
    pub sequence_number: Option<u64>,
    pub attempts: u32,
}

impl Receipt {
    pub fn is_acknowledged(&self) -> bool {
        self.status == ReceiptStatus::Acknowledged
    }
}
