//! Batch upload coordination
//!
//! `upload` runs authorize, mint, persist and record for one batch while
//! holding the batch's subject key. A replayed upload returns the stored
//! record without touching the registry or the token service.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::domain::{validate_batch_id, BatchRecord, BatchStatus, NewBatch, UploadRequest};
use crate::infra::{
    collections, CoordinatorError, DocumentStore, Precondition, Result, StoreError,
};
use crate::metrics::{metric_names, MetricsRegistry};

use super::gateway::AuthorizationGateway;
use super::issuer::TokenIssuer;
use super::recorder::ProvenanceRecorder;

/// Conflicting writes tolerated per status transition
const TRANSITION_ATTEMPTS: usize = 5;

/// Versioned access to batch records
#[derive(Clone)]
pub struct BatchRepository {
    store: Arc<dyn DocumentStore>,
}

impl BatchRepository {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    pub async fn load(&self, batch_id: &str) -> Result<Option<(BatchRecord, u64)>> {
        match self.store.get(collections::BATCHES, batch_id).await? {
            Some(doc) => Ok(Some((serde_json::from_value(doc.body)?, doc.version))),
            None => Ok(None),
        }
    }

    /// Create a record that must not exist yet.
    pub async fn create(&self, record: &BatchRecord) -> Result<u64> {
        let version = self
            .store
            .put(
                collections::BATCHES,
                &record.batch_id,
                serde_json::to_value(record)?,
                Precondition::Absent,
            )
            .await?;
        Ok(version)
    }

    /// Move a record to `next` under optimistic concurrency.
    ///
    /// On a version conflict the record is re-read and the transition
    /// re-checked. A record already at `next`, or at `Recorded`, is returned
    /// as stored. `sequence_number` is kept when moving to `Recorded`.
    pub async fn advance(
        &self,
        record: BatchRecord,
        version: u64,
        next: BatchStatus,
        sequence_number: Option<u64>,
    ) -> Result<BatchRecord> {
        let mut current = record;
        let mut version = version;

        for _ in 0..TRANSITION_ATTEMPTS {
            if current.status == next || current.status == BatchStatus::Recorded {
                return Ok(current);
            }

            let mut updated = current.clone();
            if let Err((from, to)) = updated.transition(next, Utc::now()) {
                debug!(
                    batch_id = %current.batch_id,
                    from = %from,
                    to = %to,
                    "Skipping invalid batch transition"
                );
                return Ok(current);
            }
            if next == BatchStatus::Recorded {
                updated.audit_sequence_number = sequence_number;
            }

            match self
                .store
                .put(
                    collections::BATCHES,
                    &updated.batch_id,
                    serde_json::to_value(&updated)?,
                    Precondition::Version(version),
                )
                .await
            {
                Ok(_) => {
                    info!(
                        batch_id = %updated.batch_id,
                        from = %current.status,
                        to = %updated.status,
                        "Batch status changed"
                    );
                    return Ok(updated);
                }
                Err(e) if e.is_conflict() => {
                    let (reloaded, reloaded_version) =
                        self.load(&current.batch_id).await?.ok_or_else(|| {
                            CoordinatorError::Internal(format!(
                                "batch {} disappeared",
                                current.batch_id
                            ))
                        })?;
                    current = reloaded;
                    version = reloaded_version;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(CoordinatorError::Store(StoreError::Conflict {
            collection: collections::BATCHES.to_string(),
            key: current.batch_id,
        }))
    }

    pub async fn find_by_status(&self, status: BatchStatus) -> Result<Vec<(BatchRecord, u64)>> {
        let docs = self
            .store
            .find(collections::BATCHES, "status", status.as_str())
            .await?;
        docs.into_iter()
            .map(|doc| -> Result<(BatchRecord, u64)> {
                Ok((serde_json::from_value(doc.body)?, doc.version))
            })
            .collect()
    }
}

/// Response to an accepted upload
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadOutcome {
    pub record: BatchRecord,
    /// The BatchUploaded event is not yet acknowledged
    pub audit_pending: bool,
    /// Served from an existing record
    pub replayed: bool,
}

/// Consumer-facing verification state of a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationStatus {
    Verified,
    Pending,
    Invalid,
}

#[derive(Debug, Clone)]
pub struct BatchVerification {
    pub status: VerificationStatus,
    pub record: Option<BatchRecord>,
}

#[derive(Clone)]
pub struct BatchUploadCoordinator {
    gateway: AuthorizationGateway,
    issuer: TokenIssuer,
    recorder: ProvenanceRecorder,
    batches: BatchRepository,
    metrics: Arc<MetricsRegistry>,
}

impl BatchUploadCoordinator {
    pub fn new(
        gateway: AuthorizationGateway,
        issuer: TokenIssuer,
        recorder: ProvenanceRecorder,
        batches: BatchRepository,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            gateway,
            issuer,
            recorder,
            batches,
            metrics,
        }
    }

    /// Register a batch.
    ///
    /// Audit log trouble never fails an upload once the token is minted:
    /// the outcome carries `audit_pending` and reconciliation finishes the
    /// job.
    pub async fn upload(&self, request: UploadRequest) -> Result<UploadOutcome> {
        let batch = match NewBatch::validate(&request) {
            Ok(batch) => batch,
            Err(e) => {
                self.metrics
                    .inc_counter(metric_names::VALIDATION_ERRORS)
                    .await;
                return Err(e.into());
            }
        };

        // Detached so a dropped request cannot abort a dispatched mint or
        // log submission.
        let this = self.clone();
        tokio::spawn(async move { this.run(batch).await })
            .await
            .map_err(|e| CoordinatorError::Internal(format!("upload task failed: {}", e)))?
    }

    pub async fn batch(&self, batch_id: &str) -> Result<Option<BatchRecord>> {
        Ok(self.batches.load(batch_id).await?.map(|(record, _)| record))
    }

    /// Consumer verification: `verified` once Recorded, `pending` while the
    /// audit trail catches up, `invalid` otherwise.
    pub async fn verify_batch(&self, batch_id: &str) -> Result<BatchVerification> {
        if validate_batch_id(batch_id).is_err() {
            return Ok(BatchVerification {
                status: VerificationStatus::Invalid,
                record: None,
            });
        }

        let record = self.batch(batch_id).await?;
        let status = match record.as_ref().map(|r| r.status) {
            Some(BatchStatus::Recorded) => VerificationStatus::Verified,
            Some(status) if status.awaits_audit() => VerificationStatus::Pending,
            _ => VerificationStatus::Invalid,
        };
        Ok(BatchVerification { status, record })
    }

    async fn run(&self, batch: NewBatch) -> Result<UploadOutcome> {
        let start = Instant::now();
        let guard = self.recorder.queue().acquire(&batch.subject_key()).await;

        if let Some((record, _)) = self.batches.load(&batch.batch_id).await? {
            return self.replay(record, &batch).await;
        }

        if !self.gateway.is_authorized(&batch.sender_address).await? {
            self.metrics
                .inc_counter(metric_names::UPLOADS_UNAUTHORIZED)
                .await;
            warn!(
                batch_id = %batch.batch_id,
                sender = %batch.sender_address,
                "Upload from unverified manufacturer"
            );
            return Err(CoordinatorError::Authorization(format!(
                "{} is not a verified manufacturer",
                batch.sender_address
            )));
        }

        let token_id = self.issuer.mint(&batch.drug_name, &batch.batch_id).await?;

        let mut record = BatchRecord::minted(&batch, token_id, Utc::now());
        let draft = record.upload_event();
        record.audit_event_key = Some(draft.idempotency_key()?);
        let version = self.batches.create(&record).await?;
        info!(
            batch_id = %record.batch_id,
            token_id = ?record.token_id,
            sender = %record.sender_address,
            "Batch persisted"
        );

        let (record, audit_pending) = match self.recorder.record_locked(guard, draft).await {
            Ok(receipt) if receipt.is_acknowledged() => {
                let record = self
                    .batches
                    .advance(record, version, BatchStatus::Recorded, receipt.sequence_number)
                    .await?;
                let pending = record.status.awaits_audit();
                (record, pending)
            }
            Ok(_) => {
                let record = self
                    .batches
                    .advance(record, version, BatchStatus::PendingAudit, None)
                    .await?;
                let pending = record.status.awaits_audit();
                (record, pending)
            }
            Err(e) => {
                warn!(
                    batch_id = %record.batch_id,
                    error = %e,
                    "BatchUploaded event not journaled, leaving for reconciliation"
                );
                (record, true)
            }
        };

        self.metrics
            .inc_counter(metric_names::UPLOADS_ACCEPTED)
            .await;
        if audit_pending {
            self.metrics
                .inc_counter(metric_names::UPLOADS_AUDIT_PENDING)
                .await;
        }
        self.metrics
            .observe_histogram(metric_names::UPLOAD_LATENCY, start.elapsed().as_secs_f64())
            .await;

        Ok(UploadOutcome {
            record,
            audit_pending,
            replayed: false,
        })
    }

    async fn replay(&self, record: BatchRecord, batch: &NewBatch) -> Result<UploadOutcome> {
        if !record.status.is_minted() {
            return Err(CoordinatorError::Validation {
                field: Some("batchId"),
                message: format!("batch {} previously failed", record.batch_id),
            });
        }
        if !record.matches(batch) {
            return Err(CoordinatorError::Validation {
                field: Some("batchId"),
                message: format!(
                    "batch {} already registered with different contents",
                    record.batch_id
                ),
            });
        }

        self.metrics
            .inc_counter(metric_names::UPLOADS_REPLAYED)
            .await;
        debug!(batch_id = %record.batch_id, status = %record.status, "Upload replayed");

        let audit_pending = record.status.awaits_audit();
        Ok(UploadOutcome {
            record,
            audit_pending,
            replayed: true,
        })
    }
}
