//! Provenance recorder
//!
//! Journals events in the document store and delivers them to the audit
//! log. Per subject, only the journal head (lowest `subject_seq` not yet
//! acknowledged) is ever submitted, and only while holding the subject's
//! lock, one attempt per hold. Backoff sleeps happen with the lock
//! released.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::domain::{EventDraft, ProvenanceEvent, Receipt, ReceiptStatus};
use crate::infra::{
    collections, AppendLog, CircuitBreaker, CoordinatorError, DocumentStore, Precondition, Result,
    RetryConfig, Service, ServiceError,
};
use crate::metrics::{metric_names, MetricsRegistry};

use super::subject_queue::{SubjectGuard, SubjectQueue};

/// Audit topic used by the original deployment
pub const DEFAULT_AUDIT_TOPIC: &str = "0.0.6825354";

#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Audit log topic
    pub topic: String,
    /// In-request delivery budget and backoff
    pub retry: RetryConfig,
    /// Deadline for one submission, receipt wait included
    pub submit_timeout: Duration,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            topic: DEFAULT_AUDIT_TOPIC.to_string(),
            retry: RetryConfig::audit_log(),
            submit_timeout: Duration::from_secs(30),
        }
    }
}

impl RecorderConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let topic = std::env::var("AUDIT_TOPIC").unwrap_or(defaults.topic);

        let mut retry = defaults.retry;
        if let Some(attempts) = std::env::var("AUDIT_RETRY_MAX_ATTEMPTS")
            .ok()
            .and_then(|s| s.parse().ok())
        {
            retry = retry.with_max_attempts(attempts);
        }
        if let Some(ms) = std::env::var("AUDIT_RETRY_BASE_MS")
            .ok()
            .and_then(|s| s.parse().ok())
        {
            retry = retry.with_initial_delay(Duration::from_millis(ms));
        }
        if let Some(ms) = std::env::var("AUDIT_RETRY_MAX_MS")
            .ok()
            .and_then(|s| s.parse().ok())
        {
            retry = retry.with_max_delay(Duration::from_millis(ms));
        }

        let submit_timeout = std::env::var("AUDIT_SUBMIT_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.submit_timeout);

        Self {
            topic,
            retry,
            submit_timeout,
        }
    }
}

/// Result of one attempt on a subject's head
enum Attempt {
    /// No unresolved events on the subject
    Drained,
    Acknowledged(ProvenanceEvent),
    Failed(ProvenanceEvent, ServiceError),
}

/// Summary of driving one subject
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriveReport {
    pub acknowledged: u32,
    pub drained: bool,
    pub failed: bool,
}

#[derive(Clone)]
pub struct ProvenanceRecorder {
    config: Arc<RecorderConfig>,
    log: Arc<dyn AppendLog>,
    store: Arc<dyn DocumentStore>,
    queue: SubjectQueue,
    breaker: Arc<CircuitBreaker>,
    metrics: Arc<MetricsRegistry>,
}

impl ProvenanceRecorder {
    pub fn new(
        config: RecorderConfig,
        log: Arc<dyn AppendLog>,
        store: Arc<dyn DocumentStore>,
        queue: SubjectQueue,
        breaker: Arc<CircuitBreaker>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            log,
            store,
            queue,
            breaker,
            metrics,
        }
    }

    /// The subject queue shared with the other components
    pub fn queue(&self) -> &SubjectQueue {
        &self.queue
    }

    pub fn topic(&self) -> &str {
        &self.config.topic
    }

    /// Journal and deliver an event.
    ///
    /// Delivery failures do not error: the receipt comes back `Failed` and
    /// the event stays in the journal for reconciliation.
    pub async fn record(&self, draft: EventDraft) -> Result<Receipt> {
        let guard = self.queue.acquire(&draft.subject_key).await;
        self.record_locked(guard, draft).await
    }

    /// [`record`](Self::record) for callers already holding the subject.
    ///
    /// The guard is released after journaling; delivery re-acquires it per
    /// attempt.
    pub async fn record_locked(&self, guard: SubjectGuard, draft: EventDraft) -> Result<Receipt> {
        if guard.key() != draft.subject_key {
            return Err(CoordinatorError::Internal(format!(
                "guard for {} used to record on {}",
                guard.key(),
                draft.subject_key
            )));
        }

        let event = self.journal(&draft).await?;
        if event.is_acknowledged() {
            debug!(
                idempotency_key = %event.idempotency_key,
                "Event already acknowledged"
            );
            return Ok(event.receipt());
        }

        self.deliver(guard, &event.subject_key, &event.idempotency_key)
            .await
    }

    /// Journal without delivering. Returns the (possibly pre-existing) entry.
    pub async fn enqueue(&self, draft: EventDraft) -> Result<ProvenanceEvent> {
        let guard = self.queue.acquire(&draft.subject_key).await;
        self.enqueue_locked(&guard, draft).await
    }

    /// [`enqueue`](Self::enqueue) for callers already holding the subject.
    pub async fn enqueue_locked(
        &self,
        guard: &SubjectGuard,
        draft: EventDraft,
    ) -> Result<ProvenanceEvent> {
        if guard.key() != draft.subject_key {
            return Err(CoordinatorError::Internal(format!(
                "guard for {} used to journal on {}",
                guard.key(),
                draft.subject_key
            )));
        }
        self.journal(&draft).await
    }

    /// Attempt the subject's head until drained, failed, or `max_attempts`
    /// attempts were made.
    pub async fn drive(&self, subject: &str, max_attempts: u32) -> Result<DriveReport> {
        let mut report = DriveReport::default();

        for _ in 0..max_attempts {
            let guard = self.queue.acquire(subject).await;
            match self.attempt_head(&guard).await? {
                Attempt::Drained => {
                    report.drained = true;
                    break;
                }
                Attempt::Acknowledged(_) => report.acknowledged += 1,
                Attempt::Failed(..) => {
                    report.failed = true;
                    break;
                }
            }
        }

        Ok(report)
    }

    /// Journal entries not yet acknowledged, oldest first.
    pub async fn unresolved(&self, limit: usize) -> Result<Vec<ProvenanceEvent>> {
        let mut events = Vec::new();
        for status in ReceiptStatus::unresolved() {
            let docs = self
                .store
                .find(collections::EVENTS, "receiptStatus", status.as_str())
                .await?;
            for doc in docs {
                events.push(serde_json::from_value::<ProvenanceEvent>(doc.body)?);
            }
        }
        events.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then(a.subject_seq.cmp(&b.subject_seq))
        });
        events.truncate(limit);
        Ok(events)
    }

    /// A subject's journal in submission order.
    pub async fn events_for(&self, subject: &str) -> Result<Vec<ProvenanceEvent>> {
        let docs = self
            .store
            .find(collections::EVENTS, "subjectKey", subject)
            .await?;
        let mut events = docs
            .into_iter()
            .map(|doc| serde_json::from_value::<ProvenanceEvent>(doc.body))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        events.sort_by_key(|e| e.subject_seq);
        Ok(events)
    }

    pub async fn event(&self, idempotency_key: &str) -> Result<Option<ProvenanceEvent>> {
        Ok(self.load(idempotency_key).await?.map(|(event, _)| event))
    }

    /// Deliver attempts with backoff until our event is acknowledged or the
    /// budget runs out. A failed attempt on a predecessor counts against it.
    async fn deliver(&self, guard: SubjectGuard, subject: &str, key: &str) -> Result<Receipt> {
        let start = Instant::now();
        let max_failures = self.config.retry.max_attempts.max(1);
        let mut guard = Some(guard);
        let mut failures = 0u32;
        let mut last_error = None;

        while failures < max_failures {
            let held = match guard.take() {
                Some(g) => g,
                None => self.queue.acquire(subject).await,
            };

            match self.attempt_head(&held).await? {
                Attempt::Drained => {
                    drop(held);
                    return self.receipt_for(key).await;
                }
                Attempt::Acknowledged(head) if head.idempotency_key == key => {
                    self.metrics
                        .observe_histogram(
                            metric_names::AUDIT_SUBMIT_LATENCY,
                            start.elapsed().as_secs_f64(),
                        )
                        .await;
                    return Ok(head.receipt());
                }
                Attempt::Acknowledged(head) => {
                    debug!(
                        subject = subject,
                        predecessor = %head.idempotency_key,
                        "Predecessor acknowledged"
                    );
                }
                Attempt::Failed(head, err) => {
                    drop(held);
                    failures += 1;
                    warn!(
                        subject = subject,
                        idempotency_key = key,
                        head = %head.idempotency_key,
                        attempt = failures,
                        max_attempts = max_failures,
                        error = %err,
                        "Audit log attempt failed"
                    );
                    last_error = Some(err);
                    if failures < max_failures {
                        tokio::time::sleep(self.config.retry.delay_for_attempt(failures - 1)).await;
                    }
                }
            }
        }

        let reason = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "retry budget exhausted".to_string());
        self.give_up(subject, key, &reason).await
    }

    /// Mark our event Failed after the budget is spent and leave it for
    /// reconciliation.
    async fn give_up(&self, subject: &str, key: &str, reason: &str) -> Result<Receipt> {
        let _guard = self.queue.acquire(subject).await;
        let (mut event, version) = self.load(key).await?.ok_or_else(|| {
            CoordinatorError::Internal(format!("journal entry {} disappeared", key))
        })?;

        if event.is_acknowledged() {
            return Ok(event.receipt());
        }

        event.mark_failed(reason);
        self.save(&event, version).await?;
        self.metrics.inc_counter(metric_names::AUDIT_EXHAUSTED).await;
        error!(
            subject = subject,
            idempotency_key = key,
            attempts = event.attempts,
            error = reason,
            "Audit log delivery exhausted, left for reconciliation"
        );
        Ok(event.receipt())
    }

    async fn receipt_for(&self, key: &str) -> Result<Receipt> {
        self.load(key)
            .await?
            .map(|(event, _)| event.receipt())
            .ok_or_else(|| CoordinatorError::Internal(format!("journal entry {} disappeared", key)))
    }

    /// Journal an event under its subject lock, or return the existing entry.
    async fn journal(&self, draft: &EventDraft) -> Result<ProvenanceEvent> {
        let key = draft.idempotency_key()?;
        if let Some((existing, _)) = self.load(&key).await? {
            return Ok(existing);
        }

        let subject = &draft.subject_key;
        let (seq, precondition) = match self.store.get(collections::SUBJECTS, subject).await? {
            Some(doc) => (
                doc.body.get("nextSeq").and_then(|v| v.as_u64()).unwrap_or(1),
                Precondition::Version(doc.version),
            ),
            None => (1, Precondition::Absent),
        };
        self.store
            .put(
                collections::SUBJECTS,
                subject,
                json!({ "subjectKey": subject, "nextSeq": seq + 1 }),
                precondition,
            )
            .await?;

        let event = ProvenanceEvent::journal(draft, key, seq, Utc::now());
        self.store
            .put(
                collections::EVENTS,
                &event.idempotency_key,
                serde_json::to_value(&event)?,
                Precondition::Absent,
            )
            .await?;

        info!(
            subject = %subject,
            subject_seq = seq,
            event_type = %event.event_type,
            idempotency_key = %event.idempotency_key,
            "Provenance event journaled"
        );
        Ok(event)
    }

    /// One attempt on the head of the guarded subject.
    async fn attempt_head(&self, guard: &SubjectGuard) -> Result<Attempt> {
        let Some((mut head, version)) = self.head(guard.key()).await? else {
            return Ok(Attempt::Drained);
        };
        let topic = self.config.topic.as_str();
        let timeout = self.config.submit_timeout;

        if head.was_attempted() {
            let found = self
                .breaker
                .call_with_timeout(self.log.lookup(topic, &head.idempotency_key), timeout)
                .await;
            match found {
                Ok(Some(sequence_number)) => {
                    head.mark_acknowledged(Some(sequence_number), Utc::now());
                    self.save(&head, version).await?;
                    self.metrics.inc_counter(metric_names::AUDIT_DEDUPLICATED).await;
                    info!(
                        subject = %head.subject_key,
                        idempotency_key = %head.idempotency_key,
                        sequence_number,
                        "Audit entry found by idempotency key, not resubmitting"
                    );
                    return Ok(Attempt::Acknowledged(head));
                }
                Ok(None) => {}
                Err(err) => return self.fail(head, version, err).await,
            }
        }

        head.mark_sent(Utc::now());
        let version = self.save(&head, version).await?;
        self.metrics.inc_counter(metric_names::AUDIT_ATTEMPTS).await;

        let message = serde_json::to_string(&head.log_message())?;
        let submitted = self
            .breaker
            .call_with_timeout(
                self.log.submit(topic, &message, &head.idempotency_key),
                timeout,
            )
            .await;

        match submitted {
            Ok(receipt) if receipt.acknowledged => {
                head.mark_acknowledged(receipt.sequence_number, Utc::now());
                self.save(&head, version).await?;
                self.metrics.inc_counter(metric_names::AUDIT_ACKNOWLEDGED).await;
                info!(
                    subject = %head.subject_key,
                    subject_seq = head.subject_seq,
                    idempotency_key = %head.idempotency_key,
                    sequence_number = ?head.sequence_number,
                    attempts = head.attempts,
                    "Audit log acknowledged event"
                );
                Ok(Attempt::Acknowledged(head))
            }
            Ok(_) => {
                let err = ServiceError::Unavailable("audit log did not acknowledge".to_string());
                self.fail(head, version, err).await
            }
            Err(err) => self.fail(head, version, err).await,
        }
    }

    async fn fail(
        &self,
        mut head: ProvenanceEvent,
        version: u64,
        err: ServiceError,
    ) -> Result<Attempt> {
        head.mark_failed(format!("{}: {}", Service::AuditLog, err));
        self.save(&head, version).await?;
        self.metrics.inc_counter(metric_names::AUDIT_FAILURES).await;
        Ok(Attempt::Failed(head, err))
    }

    /// Lowest unacknowledged entry of a subject.
    async fn head(&self, subject: &str) -> Result<Option<(ProvenanceEvent, u64)>> {
        let docs = self
            .store
            .find(collections::EVENTS, "subjectKey", subject)
            .await?;

        let mut head: Option<(ProvenanceEvent, u64)> = None;
        for doc in docs {
            let event: ProvenanceEvent = serde_json::from_value(doc.body)?;
            if event.is_acknowledged() {
                continue;
            }
            if head
                .as_ref()
                .map_or(true, |(h, _)| event.subject_seq < h.subject_seq)
            {
                head = Some((event, doc.version));
            }
        }
        Ok(head)
    }

    async fn load(&self, key: &str) -> Result<Option<(ProvenanceEvent, u64)>> {
        match self.store.get(collections::EVENTS, key).await? {
            Some(doc) => Ok(Some((serde_json::from_value(doc.body)?, doc.version))),
            None => Ok(None),
        }
    }

    async fn save(&self, event: &ProvenanceEvent, version: u64) -> Result<u64> {
        let version = self
            .store
            .put(
                collections::EVENTS,
                &event.idempotency_key,
                serde_json::to_value(event)?,
                Precondition::Version(version),
            )
            .await?;
        Ok(version)
    }
}
