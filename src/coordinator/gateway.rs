//! Authorization gateway
//!
//! Reads and mutates manufacturer status in the external registry. Every
//! mutation is serialized on the manufacturer's subject key and followed by
//! a provenance event, so registry order and journal order agree.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::domain::{
    EventDraft, ManufacturerAddress, ManufacturerRecord, ManufacturerStatus, Receipt, TxHash,
};
use crate::infra::{
    collections, CircuitBreaker, CoordinatorError, DocumentStore, Precondition, Registry, Result,
    Retry, RetryConfig, Service, ServiceError,
};
use crate::metrics::{metric_names, MetricsRegistry};

use super::recorder::ProvenanceRecorder;
use super::subject_queue::SubjectGuard;

/// Conflicting writes to a manufacturer record before giving up on the cache
const RECORD_WRITE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Deadline for one registry call
    pub registry_timeout: Duration,
    /// Retry policy for `is_authorized` reads
    pub read_retry: RetryConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            registry_timeout: Duration::from_secs(10),
            read_retry: RetryConfig::registry(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mutation {
    Verify,
    Revoke,
}

impl Mutation {
    fn as_str(&self) -> &'static str {
        match self {
            Mutation::Verify => "verify",
            Mutation::Revoke => "revoke",
        }
    }
}

/// Result of a verify or revoke
#[derive(Debug, Clone)]
pub struct MutationOutcome {
    pub address: ManufacturerAddress,
    pub tx_hash: TxHash,
    /// The audit event is not yet acknowledged
    pub audit_pending: bool,
    /// Local record after the mutation, if the cache write went through
    pub record: Option<ManufacturerRecord>,
    /// Audit receipt, if the event was journaled
    pub receipt: Option<Receipt>,
}

#[derive(Clone)]
pub struct AuthorizationGateway {
    config: Arc<GatewayConfig>,
    registry: Arc<dyn Registry>,
    store: Arc<dyn DocumentStore>,
    recorder: ProvenanceRecorder,
    breaker: Arc<CircuitBreaker>,
    metrics: Arc<MetricsRegistry>,
}

impl AuthorizationGateway {
    pub fn new(
        config: GatewayConfig,
        registry: Arc<dyn Registry>,
        store: Arc<dyn DocumentStore>,
        recorder: ProvenanceRecorder,
        breaker: Arc<CircuitBreaker>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            registry,
            store,
            recorder,
            breaker,
            metrics,
        }
    }

    /// Ask the registry whether `address` is a verified manufacturer.
    ///
    /// Errors mean "unknown"; callers must fail closed.
    pub async fn is_authorized(&self, address: &ManufacturerAddress) -> Result<bool> {
        let timeout = self.config.registry_timeout;
        let retry = Retry::new(self.config.read_retry.clone());

        let result = retry
            .run_with_predicate(
                "registry.is_verified_manufacturer",
                || {
                    self.breaker
                        .call_with_timeout(self.registry.is_verified_manufacturer(address), timeout)
                },
                |e: &ServiceError| e.is_retryable(),
            )
            .await;

        self.read_result(address, result.into_result()).await
    }

    /// One registry read, no retries. Used while the subject is held.
    async fn is_authorized_once(&self, address: &ManufacturerAddress) -> Result<bool> {
        let result = self
            .breaker
            .call_with_timeout(
                self.registry.is_verified_manufacturer(address),
                self.config.registry_timeout,
            )
            .await;
        self.read_result(address, result).await
    }

    async fn read_result(
        &self,
        address: &ManufacturerAddress,
        result: std::result::Result<bool, ServiceError>,
    ) -> Result<bool> {
        match result {
            Ok(verified) => Ok(verified),
            Err(e) => {
                self.metrics
                    .inc_counter(metric_names::REGISTRY_READ_FAILURES)
                    .await;
                warn!(address = %address, error = %e, "Registry read failed");
                Err(CoordinatorError::external(Service::Registry, e))
            }
        }
    }

    /// Verify a manufacturer. Valid from any prior state.
    pub async fn verify(&self, address: ManufacturerAddress) -> Result<MutationOutcome> {
        self.spawn_mutation(address, Mutation::Verify).await
    }

    /// Revoke a verified manufacturer. Anything not currently verified in
    /// the registry is `NotVerified`. The check is a single registry read
    /// made while the subject is held.
    pub async fn revoke(&self, address: ManufacturerAddress) -> Result<MutationOutcome> {
        self.spawn_mutation(address, Mutation::Revoke).await
    }

    /// Locally cached record, if the gateway ever mutated this address.
    pub async fn manufacturer(
        &self,
        address: &ManufacturerAddress,
    ) -> Result<Option<ManufacturerRecord>> {
        Ok(self.load_record(address).await?.map(|(record, _)| record))
    }

    /// Cached records that went through at least one verify or revoke.
    pub async fn mutated_manufacturers(&self) -> Result<Vec<ManufacturerRecord>> {
        let mut records = Vec::new();
        for status in [ManufacturerStatus::Verified, ManufacturerStatus::Revoked] {
            let docs = self
                .store
                .find(collections::MANUFACTURERS, "status", status.as_str())
                .await?;
            for doc in docs {
                records.push(serde_json::from_value(doc.body)?);
            }
        }
        Ok(records)
    }

    /// Journal the event of the last cached mutation of `address` if the
    /// journal never received it. Returns whether an entry was written.
    pub async fn restore_last_event(&self, address: &ManufacturerAddress) -> Result<bool> {
        let guard = self.recorder.queue().acquire(&address.subject_key()).await;
        self.restore_locked(&guard, address).await
    }

    async fn restore_locked(
        &self,
        guard: &SubjectGuard,
        address: &ManufacturerAddress,
    ) -> Result<bool> {
        let Some((record, _)) = self.load_record(address).await? else {
            return Ok(false);
        };
        let Some(draft) = record.last_event() else {
            return Ok(false);
        };
        let key = draft.idempotency_key()?;
        if self.recorder.event(&key).await?.is_some() {
            return Ok(false);
        }

        warn!(
            address = %address,
            event_type = %draft.event_type,
            idempotency_key = %key,
            "Manufacturer event missing from journal, re-recording"
        );
        self.recorder.enqueue_locked(guard, draft).await?;
        self.metrics
            .inc_counter(metric_names::MANUFACTURER_EVENTS_RESTORED)
            .await;
        Ok(true)
    }

    /// Run the mutation on its own task so a dropped request cannot cut it
    /// off between the registry call and the audit event.
    async fn spawn_mutation(
        &self,
        address: ManufacturerAddress,
        mutation: Mutation,
    ) -> Result<MutationOutcome> {
        let this = self.clone();
        tokio::spawn(async move { this.mutate(address, mutation).await })
            .await
            .map_err(|e| {
                CoordinatorError::Internal(format!("{} task failed: {}", mutation.as_str(), e))
            })?
    }

    async fn mutate(
        &self,
        address: ManufacturerAddress,
        mutation: Mutation,
    ) -> Result<MutationOutcome> {
        let guard = self.recorder.queue().acquire(&address.subject_key()).await;

        // The previous mutation's event goes into the journal ahead of this one.
        self.restore_locked(&guard, &address).await?;

        if mutation == Mutation::Revoke && !self.is_authorized_once(&address).await? {
            return Err(CoordinatorError::NotVerified {
                address: address.to_string(),
            });
        }

        let call = match mutation {
            Mutation::Verify => self.registry.verify_manufacturer(&address),
            Mutation::Revoke => self.registry.revoke_manufacturer(&address),
        };
        let tx_hash = self
            .breaker
            .call_with_timeout(call, self.config.registry_timeout)
            .await
            .map_err(|e| {
                warn!(
                    address = %address,
                    mutation = mutation.as_str(),
                    error = %e,
                    "Registry mutation failed"
                );
                CoordinatorError::external(Service::Registry, e)
            })?;

        self.metrics
            .inc_counter(metric_names::REGISTRY_MUTATIONS)
            .await;
        info!(
            address = %address,
            mutation = mutation.as_str(),
            tx_hash = %tx_hash,
            "Registry mutation applied"
        );

        let record = match self.update_record(&address, mutation, &tx_hash).await {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(
                    address = %address,
                    error = %e,
                    "Manufacturer cache not updated"
                );
                None
            }
        };

        let draft = match mutation {
            Mutation::Verify => EventDraft::manufacturer_verified(&address, &tx_hash),
            Mutation::Revoke => EventDraft::manufacturer_revoked(&address, &tx_hash),
        };
        let receipt = match self.recorder.record_locked(guard, draft).await {
            Ok(receipt) => Some(receipt),
            Err(e) => {
                warn!(
                    address = %address,
                    tx_hash = %tx_hash,
                    error = %e,
                    "Provenance event not journaled"
                );
                None
            }
        };
        let audit_pending = !receipt.as_ref().is_some_and(Receipt::is_acknowledged);

        Ok(MutationOutcome {
            address,
            tx_hash,
            audit_pending,
            record,
            receipt,
        })
    }

    async fn update_record(
        &self,
        address: &ManufacturerAddress,
        mutation: Mutation,
        tx_hash: &TxHash,
    ) -> Result<ManufacturerRecord> {
        let key = address.to_string();
        let mut last_err = None;

        for _ in 0..RECORD_WRITE_ATTEMPTS {
            let (mut record, precondition) = match self.load_record(address).await? {
                Some((record, version)) => (record, Precondition::Version(version)),
                None => (ManufacturerRecord::new(*address), Precondition::Absent),
            };

            let now = Utc::now();
            match mutation {
                Mutation::Verify => record.apply_verified(tx_hash.clone(), now),
                Mutation::Revoke => record.apply_revoked(tx_hash.clone(), now),
            }

            match self
                .store
                .put(
                    collections::MANUFACTURERS,
                    &key,
                    serde_json::to_value(&record)?,
                    precondition,
                )
                .await
            {
                Ok(_) => return Ok(record),
                Err(e) if e.is_conflict() => last_err = Some(e),
                Err(e) => return Err(e.into()),
            }
        }

        Err(match last_err {
            Some(e) => e.into(),
            None => CoordinatorError::Internal("manufacturer record not written".to_string()),
        })
    }

    async fn load_record(
        &self,
        address: &ManufacturerAddress,
    ) -> Result<Option<(ManufacturerRecord, u64)>> {
        match self
            .store
            .get(collections::MANUFACTURERS, &address.to_string())
            .await?
        {
            Some(doc) => Ok(Some((serde_json::from_value(doc.body)?, doc.version))),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::testing::Harness;
    use crate::coordinator::{
        Collaborators, Coordinator, CoordinatorConfig,
    };
    use crate::domain::{ManufacturerStatus, ReceiptStatus};
    use crate::infra::{
        collections, Fault, InMemoryAppendLog, InMemoryDocumentStore, InMemoryTokenService,
        MockRegistry, RegistryCall,
    };

    fn addr(raw: &str) -> ManufacturerAddress {
        ManufacturerAddress::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn test_verify_updates_registry_cache_and_log() {
        let h = Harness::new();
        let gateway = &h.coordinator.gateway;
        let a = addr("0.0.111");

        let outcome = gateway.verify(a).await.unwrap();
        assert!(!outcome.audit_pending);
        assert!(h.registry.is_verified(&a).await);
        assert!(gateway.is_authorized(&a).await.unwrap());

        let record = gateway.manufacturer(&a).await.unwrap().unwrap();
        assert_eq!(record.status, ManufacturerStatus::Verified);
        assert_eq!(record.last_tx_hash, Some(outcome.tx_hash.clone()));

        let entries = h.log.entries(h.coordinator.recorder.topic()).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].message["event"], "ManufacturerVerified");
        assert_eq!(entries[0].message["txHash"], outcome.tx_hash.as_str());
    }

    #[tokio::test]
    async fn test_revoke_unknown_is_not_verified() {
        let h = Harness::new();
        let a = addr("0.0.222");

        let err = h.coordinator.gateway.revoke(a).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::NotVerified { .. }));
        assert!(err.is_validation());
        // No mutation reached the registry.
        assert_eq!(h.registry.calls().await, vec![RegistryCall::IsVerified(a)]);
        assert!(h.log.entries(h.coordinator.recorder.topic()).await.is_empty());
    }

    #[tokio::test]
    async fn test_revoke_twice_second_fails() {
        let h = Harness::new();
        let gateway = &h.coordinator.gateway;
        let a = addr("0.0.111");

        gateway.verify(a).await.unwrap();
        gateway.revoke(a).await.unwrap();
        let err = gateway.revoke(a).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::NotVerified { .. }));
    }

    #[tokio::test]
    async fn test_verify_revoke_verify_cycle() {
        let h = Harness::new();
        let gateway = &h.coordinator.gateway;
        let a = addr("0.0.111");

        gateway.verify(a).await.unwrap();
        gateway.revoke(a).await.unwrap();
        assert!(!gateway.is_authorized(&a).await.unwrap());
        gateway.verify(a).await.unwrap();
        assert!(gateway.is_authorized(&a).await.unwrap());

        let events = h
            .coordinator
            .recorder
            .events_for(&a.subject_key())
            .await
            .unwrap();
        let kinds: Vec<_> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(
            kinds,
            vec!["ManufacturerVerified", "ManufacturerRevoked", "ManufacturerVerified"]
        );
        assert!(events.iter().all(|e| e.is_acknowledged()));
    }

    #[tokio::test]
    async fn test_audit_failure_does_not_fail_verify() {
        let h = Harness::new();
        h.log.faults().fail_always(Fault::Unavailable).await;
        let a = addr("0.0.111");

        let outcome = h.coordinator.gateway.verify(a).await.unwrap();
        assert!(outcome.audit_pending);
        assert_eq!(
            outcome.receipt.map(|r| r.status),
            Some(ReceiptStatus::Failed)
        );
        assert!(h.registry.is_verified(&a).await);
    }

    #[tokio::test]
    async fn test_registry_outage_is_external_error() {
        let h = Harness::new();
        h.registry.faults().fail_always(Fault::Unavailable).await;
        let a = addr("0.0.111");

        let err = h.coordinator.gateway.is_authorized(&a).await.unwrap_err();
        assert!(matches!(
            err,
            CoordinatorError::ExternalService {
                service: Service::Registry,
                ..
            }
        ));
        assert!(err.is_retryable());

        let err = h.coordinator.gateway.verify(a).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::ExternalService { .. }));
        assert!(h.log.entries(h.coordinator.recorder.topic()).await.is_empty());
    }

    #[tokio::test]
    async fn test_is_authorized_retries_transient_reads() {
        let h = Harness::new();
        let a = addr("0.0.111");
        h.registry.set_verified(a, true).await;
        h.registry.faults().fail_next(2, Fault::Timeout).await;

        assert!(h.coordinator.gateway.is_authorized(&a).await.unwrap());
    }

    #[tokio::test]
    async fn test_mock_registry_rejected_read_not_retried() {
        let mut registry = MockRegistry::new();
        registry
            .expect_is_verified_manufacturer()
            .times(1)
            .returning(|_| Err(ServiceError::Rejected("bad address".to_string())));

        let collaborators = Collaborators {
            registry: Arc::new(registry),
            log: Arc::new(InMemoryAppendLog::new()),
            tokens: Arc::new(InMemoryTokenService::new()),
            store: Arc::new(InMemoryDocumentStore::new()),
        };
        let coordinator = Coordinator::new(
            collaborators,
            CoordinatorConfig::fast(),
            Arc::new(MetricsRegistry::new()),
        );

        let err = coordinator
            .gateway
            .is_authorized(&addr("0.0.5"))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(
            coordinator
                .metrics
                .get_counter(metric_names::REGISTRY_READ_FAILURES)
                .await,
            1
        );
    }

    #[tokio::test]
    async fn test_concurrent_mutations_journal_in_registry_order() {
        let h = Harness::new();
        let gateway = h.coordinator.gateway.clone();
        let a = addr("0.0.111");
        gateway.verify(a).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..6 {
            let gateway = gateway.clone();
            handles.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    gateway.revoke(a).await.map(|o| o.tx_hash)
                } else {
                    gateway.verify(a).await.map(|o| o.tx_hash)
                }
            }));
        }
        for handle in handles {
            let _ = handle.await.unwrap();
        }

        // Registry call order, mutations only
        let mutations: Vec<_> = h
            .registry
            .calls()
            .await
            .into_iter()
            .filter(|c| !matches!(c, RegistryCall::IsVerified(_)))
            .collect();
        let events = h
            .coordinator
            .recorder
            .events_for(&a.subject_key())
            .await
            .unwrap();
        assert_eq!(mutations.len(), events.len());
        for (call, event) in mutations.iter().zip(events.iter()) {
            let expected = match call {
                RegistryCall::Verify(_) => "ManufacturerVerified",
                RegistryCall::Revoke(_) => "ManufacturerRevoked",
                RegistryCall::IsVerified(_) => unreachable!(),
            };
            assert_eq!(event.event_type.as_str(), expected);
        }

        let logged: Vec<_> = h
            .log
            .entries(h.coordinator.recorder.topic())
            .await
            .into_iter()
            .map(|e| e.message["idempotencyKey"].as_str().unwrap_or_default().to_string())
            .collect();
        let journaled: Vec<_> = events.iter().map(|e| e.idempotency_key.clone()).collect();
        assert_eq!(logged, journaled);
    }

    #[tokio::test]
    async fn test_revoke_precheck_is_one_read() {
        let h = Harness::new();
        let a = addr("0.0.111");
        h.registry.set_verified(a, true).await;
        h.registry.faults().fail_always(Fault::Unavailable).await;

        let err = h.coordinator.gateway.revoke(a).await.unwrap_err();
        assert!(matches!(
            err,
            CoordinatorError::ExternalService {
                service: Service::Registry,
                ..
            }
        ));
        // is_authorized would have retried three times.
        assert_eq!(h.registry.calls().await, vec![RegistryCall::IsVerified(a)]);
        assert!(h.registry.is_verified(&a).await);
    }

    #[tokio::test]
    async fn test_unjournaled_mutation_is_journaled_before_the_next() {
        let h = Harness::new();
        let gateway = &h.coordinator.gateway;
        let a = addr("0.0.111");

        h.store.fail_writes_to(collections::EVENTS, true);
        h.store.fail_writes_to(collections::SUBJECTS, true);
        let verified = gateway.verify(a).await.unwrap();
        assert!(verified.audit_pending);
        assert!(verified.receipt.is_none());
        assert!(h.coordinator.recorder.events_for(&a.subject_key()).await.unwrap().is_empty());

        h.store.fail_writes_to(collections::EVENTS, false);
        h.store.fail_writes_to(collections::SUBJECTS, false);
        let revoked = gateway.revoke(a).await.unwrap();
        assert!(!revoked.audit_pending);

        let entries = h.log.entries(h.coordinator.recorder.topic()).await;
        let kinds: Vec<_> = entries.iter().map(|e| e.message["event"].clone()).collect();
        assert_eq!(kinds, vec!["ManufacturerVerified", "ManufacturerRevoked"]);
        assert_eq!(entries[0].message["txHash"], verified.tx_hash.as_str());
        assert_eq!(
            h.coordinator
                .metrics
                .get_counter(metric_names::MANUFACTURER_EVENTS_RESTORED)
                .await,
            1
        );
    }

    #[tokio::test]
    async fn test_restore_is_noop_when_journaled() {
        let h = Harness::new();
        let a = addr("0.0.111");
        assert!(!h.coordinator.gateway.restore_last_event(&a).await.unwrap());

        h.coordinator.gateway.verify(a).await.unwrap();
        assert!(!h.coordinator.gateway.restore_last_event(&a).await.unwrap());
        assert_eq!(h.log.entries(h.coordinator.recorder.topic()).await.len(), 1);
    }
}
