//! Reconciliation worker
//!
//! Background service that finishes what the request path left behind:
//!
//! 1. Drives every subject with unresolved journal entries, one attempt per
//!    lock hold, until the subject drains or an attempt fails
//! 2. Promotes batches whose BatchUploaded event is acknowledged
//! 3. Re-records the BatchUploaded event of minted batches whose journal
//!    entry is missing
//! 4. Re-records the last ManufacturerVerified/Revoked event of cached
//!    manufacturers whose journal entry is missing
//!
//! It never mints.
//!
//! # Configuration
//!
//! - `RECONCILE_INTERVAL_SECS` - Pause between passes (default: 30)
//! - `RECONCILE_CONCURRENCY` - Subjects driven in parallel (default: 4)
//! - `RECONCILE_BATCH_LIMIT` - Unresolved entries read per pass (default: 100)

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::domain::{BatchRecord, BatchStatus, ManufacturerRecord};
use crate::infra::{CoordinatorError, Result};
use crate::metrics::{metric_names, MetricsRegistry};

use super::gateway::AuthorizationGateway;
use super::recorder::ProvenanceRecorder;
use super::upload::BatchRepository;

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub interval: Duration,
    /// Subjects driven concurrently
    pub concurrency: usize,
    /// Unresolved journal entries read per pass
    pub batch_limit: usize,
    /// Upper bound on attempts per subject per pass
    pub max_attempts_per_subject: u32,
    /// Age before a `TokenMinted` batch or a manufacturer mutation is
    /// treated as abandoned by its request
    pub audit_grace: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            concurrency: 4,
            batch_limit: 100,
            max_attempts_per_subject: 100,
            audit_grace: Duration::from_secs(60),
        }
    }
}

impl ReconcilerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let interval = std::env::var("RECONCILE_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.interval);

        let concurrency = std::env::var("RECONCILE_CONCURRENCY")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.concurrency);

        let batch_limit = std::env::var("RECONCILE_BATCH_LIMIT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.batch_limit);

        Self {
            interval,
            concurrency,
            batch_limit,
            ..defaults
        }
    }
}

/// Summary of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    /// Unresolved journal entries found
    pub unresolved: usize,
    /// Distinct subjects driven
    pub subjects: usize,
    /// Entries acknowledged during the pass
    pub acknowledged: u32,
    /// Subjects whose head failed again
    pub failed_subjects: usize,
    pub batches_promoted: usize,
    /// Batches whose missing BatchUploaded event was journaled again
    pub batches_rerecorded: usize,
    /// Manufacturers whose last verify/revoke event was journaled again
    pub manufacturers_rerecorded: usize,
    pub errors: usize,
}

/// What happened to one batch during the sweep
#[derive(Debug, PartialEq, Eq)]
enum Settled {
    Unchanged,
    Promoted,
    Deferred,
    Rerecorded { promoted: bool },
}

#[derive(Clone)]
pub struct Reconciler {
    config: Arc<ReconcilerConfig>,
    recorder: ProvenanceRecorder,
    gateway: AuthorizationGateway,
    batches: BatchRepository,
    metrics: Arc<MetricsRegistry>,
}

impl Reconciler {
    pub fn new(
        config: ReconcilerConfig,
        recorder: ProvenanceRecorder,
        gateway: AuthorizationGateway,
        batches: BatchRepository,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            recorder,
            gateway,
            batches,
            metrics,
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Run one full pass.
    pub async fn run_once(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        self.drive_subjects(&mut report).await?;
        self.settle_batches(&mut report).await?;
        self.settle_manufacturers(&mut report).await?;

        let remaining = self.recorder.unresolved(self.config.batch_limit).await?;
        self.metrics.inc_counter(metric_names::RECONCILE_PASSES).await;
        self.metrics
            .add_counter(metric_names::RECONCILE_RESOLVED, report.acknowledged as u64)
            .await;
        self.metrics
            .add_counter(
                metric_names::RECONCILE_PROMOTED,
                report.batches_promoted as u64,
            )
            .await;
        self.metrics
            .set_gauge(metric_names::RECONCILE_UNRESOLVED, remaining.len() as u64)
            .await;

        if report.unresolved > 0
            || report.batches_promoted > 0
            || report.manufacturers_rerecorded > 0
            || report.errors > 0
        {
            info!(
                unresolved = report.unresolved,
                subjects = report.subjects,
                acknowledged = report.acknowledged,
                failed_subjects = report.failed_subjects,
                promoted = report.batches_promoted,
                rerecorded = report.batches_rerecorded,
                manufacturers_rerecorded = report.manufacturers_rerecorded,
                errors = report.errors,
                "Reconciliation pass complete"
            );
        } else {
            debug!("Reconciliation pass found nothing to do");
        }

        Ok(report)
    }

    async fn drive_subjects(&self, report: &mut ReconcileReport) -> Result<()> {
        let unresolved = self.recorder.unresolved(self.config.batch_limit).await?;
        report.unresolved = unresolved.len();

        let subjects: BTreeSet<String> =
            unresolved.into_iter().map(|e| e.subject_key).collect();
        report.subjects = subjects.len();

        let permits = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut tasks = JoinSet::new();
        for subject in subjects {
            let permit = permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| CoordinatorError::Internal(format!("reconciler pool closed: {}", e)))?;
            let recorder = self.recorder.clone();
            let max_attempts = self.config.max_attempts_per_subject;
            tasks.spawn(async move {
                let _permit = permit;
                let result = recorder.drive(&subject, max_attempts).await;
                (subject, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(drive))) => {
                    report.acknowledged += drive.acknowledged;
                    if drive.failed {
                        report.failed_subjects += 1;
                    }
                }
                Ok((subject, Err(e))) => {
                    report.errors += 1;
                    warn!(subject = %subject, error = %e, "Failed to drive subject");
                }
                Err(e) => {
                    report.errors += 1;
                    error!(error = %e, "Reconciliation task panicked");
                }
            }
        }

        Ok(())
    }

    async fn settle_batches(&self, report: &mut ReconcileReport) -> Result<()> {
        for status in [BatchStatus::PendingAudit, BatchStatus::TokenMinted] {
            for (record, version) in self.batches.find_by_status(status).await? {
                let batch_id = record.batch_id.clone();
                match self.settle(record, version).await {
                    Ok(Settled::Promoted) => report.batches_promoted += 1,
                    Ok(Settled::Rerecorded { promoted }) => {
                        report.batches_rerecorded += 1;
                        if promoted {
                            report.batches_promoted += 1;
                        }
                    }
                    Ok(Settled::Deferred) | Ok(Settled::Unchanged) => {}
                    Err(e) => {
                        report.errors += 1;
                        warn!(batch_id = %batch_id, error = %e, "Failed to settle batch");
                    }
                }
            }
        }
        Ok(())
    }

    async fn settle(&self, record: BatchRecord, version: u64) -> Result<Settled> {
        let draft = record.upload_event();
        let key = match &record.audit_event_key {
            Some(key) => key.clone(),
            None => draft.idempotency_key()?,
        };
        if !record.status.awaits_audit() {
            return Ok(Settled::Unchanged);
        }
        let abandoned = self.abandoned(record.updated_at);
        let minted_only = record.status == BatchStatus::TokenMinted;

        match self.recorder.event(&key).await? {
            Some(event) if event.is_acknowledged() => {
                let updated = self
                    .batches
                    .advance(record, version, BatchStatus::Recorded, event.sequence_number)
                    .await?;
                Ok(if updated.status == BatchStatus::Recorded {
                    Settled::Promoted
                } else {
                    Settled::Unchanged
                })
            }
            Some(_) if minted_only && abandoned => {
                self.batches
                    .advance(record, version, BatchStatus::PendingAudit, None)
                    .await?;
                Ok(Settled::Deferred)
            }
            Some(_) => Ok(Settled::Unchanged),
            // The request may still be between persisting and journaling.
            None if minted_only && !abandoned => Ok(Settled::Unchanged),
            None => {
                warn!(
                    batch_id = %record.batch_id,
                    idempotency_key = %key,
                    "BatchUploaded event missing from journal, re-recording"
                );
                let subject = record.subject_key();
                self.recorder.enqueue(draft).await?;
                self.recorder
                    .drive(&subject, self.config.max_attempts_per_subject)
                    .await?;

                let acknowledged = self.recorder.event(&key).await?.filter(|e| e.is_acknowledged());
                let next = match &acknowledged {
                    Some(_) => BatchStatus::Recorded,
                    None => BatchStatus::PendingAudit,
                };
                let updated = self
                    .batches
                    .advance(
                        record,
                        version,
                        next,
                        acknowledged.and_then(|e| e.sequence_number),
                    )
                    .await?;
                Ok(Settled::Rerecorded {
                    promoted: updated.status == BatchStatus::Recorded,
                })
            }
        }
    }

    fn abandoned(&self, updated_at: chrono::DateTime<Utc>) -> bool {
        (Utc::now() - updated_at)
            .to_std()
            .map(|age| age >= self.config.audit_grace)
            .unwrap_or(false)
    }

    async fn settle_manufacturers(&self, report: &mut ReconcileReport) -> Result<()> {
        for record in self.gateway.mutated_manufacturers().await? {
            // A mutation younger than the grace period may still be journaling.
            if !self.abandoned(record.updated_at) {
                continue;
            }
            match self.restore_manufacturer(&record).await {
                Ok(true) => report.manufacturers_rerecorded += 1,
                Ok(false) => {}
                Err(e) => {
                    report.errors += 1;
                    warn!(address = %record.address, error = %e, "Failed to settle manufacturer");
                }
            }
        }
        Ok(())
    }

    async fn restore_manufacturer(&self, record: &ManufacturerRecord) -> Result<bool> {
        if !self.gateway.restore_last_event(&record.address).await? {
            return Ok(false);
        }
        let drive = self
            .recorder
            .drive(&record.address.subject_key(), self.config.max_attempts_per_subject)
            .await?;
        if drive.failed {
            debug!(address = %record.address, "Restored manufacturer event still unacknowledged");
        }
        Ok(true)
    }
}

/// Messages for controlling the worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcilerMessage {
    /// Run a pass immediately
    RunNow,
    /// Stop after the current pass
    Shutdown,
}

/// Periodic driver around a [`Reconciler`]
pub struct ReconciliationWorker {
    reconciler: Reconciler,
    control_tx: mpsc::Sender<ReconcilerMessage>,
    control_rx: mpsc::Receiver<ReconcilerMessage>,
}

impl ReconciliationWorker {
    pub fn new(reconciler: Reconciler) -> Self {
        let (control_tx, control_rx) = mpsc::channel(16);
        Self {
            reconciler,
            control_tx,
            control_rx,
        }
    }

    pub fn control_handle(&self) -> mpsc::Sender<ReconcilerMessage> {
        self.control_tx.clone()
    }

    pub async fn run(mut self) {
        let config = self.reconciler.config();
        info!(
            interval_ms = config.interval.as_millis() as u64,
            concurrency = config.concurrency,
            batch_limit = config.batch_limit,
            "Starting reconciliation worker"
        );

        let mut ticker = interval(config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.pass().await,
                msg = self.control_rx.recv() => {
                    match msg {
                        Some(ReconcilerMessage::RunNow) => self.pass().await,
                        Some(ReconcilerMessage::Shutdown) | None => {
                            info!("Reconciliation worker shutting down");
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn pass(&self) {
        if let Err(e) = self.reconciler.run_once().await {
            error!(error = %e, "Reconciliation pass failed");
        }
    }
}

/// Spawn the reconciliation worker as a background task
pub fn spawn_reconciliation_worker(
    reconciler: Reconciler,
) -> (
    tokio::task::JoinHandle<()>,
    mpsc::Sender<ReconcilerMessage>,
) {
    let worker = ReconciliationWorker::new(reconciler);
    let control_handle = worker.control_handle();
    let handle = tokio::spawn(worker.run());
    (handle, control_handle)
}
