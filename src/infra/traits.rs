//! Collaborator contracts consumed by the coordinator
//!
//! None of these are transactional with each other. Every call may be slow
//! or fail, and callers bound them with timeouts.

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use crate::domain::{ManufacturerAddress, TokenId, TxHash};

use super::{ServiceError, StoreError};

/// Manufacturer authorization registry (source of truth for `is_authorized`).
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Registry: Send + Sync {
    async fn is_verified_manufacturer(
        &self,
        address: &ManufacturerAddress,
    ) -> Result<bool, ServiceError>;

    async fn verify_manufacturer(&self, address: &ManufacturerAddress)
        -> Result<TxHash, ServiceError>;

    async fn revoke_manufacturer(&self, address: &ManufacturerAddress)
        -> Result<TxHash, ServiceError>;
}

/// Answer from the append-only log for one submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogReceipt {
    pub acknowledged: bool,
    pub sequence_number: Option<u64>,
}

/// Append-only, receipt-acknowledged audit log.
///
/// The log does not order submissions from independent writers; the
/// recorder's subject queue provides ordering.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AppendLog: Send + Sync {
    async fn submit(
        &self,
        topic: &str,
        message: &str,
        idempotency_key: &str,
    ) -> Result<LogReceipt, ServiceError>;

    /// Sequence number of an entry previously written under this key.
    async fn lookup(&self, topic: &str, idempotency_key: &str)
        -> Result<Option<u64>, ServiceError>;
}

/// Token minting service
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TokenService: Send + Sync {
    async fn mint(&self, drug_name: &str, batch_id: &str) -> Result<TokenId, ServiceError>;

    /// Token already minted for this batch, if any.
    async fn token_for_batch(&self, batch_id: &str) -> Result<Option<TokenId>, ServiceError>;
}

/// A stored document and its version
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub key: String,
    pub body: serde_json::Value,
    pub version: u64,
}

/// Write precondition for optimistic concurrency
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    /// Unconditional write
    Any,
    /// Create only
    Absent,
    /// Replace only if the stored version matches
    Version(u64),
}

/// Keyed document store with versioned writes.
///
/// Read-after-write is guaranteed for the same key.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, collection: &str, key: &str) -> Result<Option<Document>, StoreError>;

    /// Write a document, returning its new version.
    async fn put(
        &self,
        collection: &str,
        key: &str,
        body: serde_json::Value,
        precondition: Precondition,
    ) -> Result<u64, StoreError>;

    /// Documents whose top-level string `field` equals `value`.
    async fn find(
        &self,
        collection: &str,
        field: &str,
        value: &str,
    ) -> Result<Vec<Document>, StoreError>;
}

/// Collection names
pub mod collections {
    pub const MANUFACTURERS: &str = "manufacturers";
    pub const BATCHES: &str = "drug_batches";
    pub const EVENTS: &str = "provenance_events";
    pub const SUBJECTS: &str = "provenance_subjects";
}
