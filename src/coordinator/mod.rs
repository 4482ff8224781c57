//! Provenance coordinator
//!
//! Keeps the manufacturer registry, the token service and the audit log
//! consistent for each authorization change and batch upload:
//!
//! - [`AuthorizationGateway`] reads and mutates manufacturer status
//! - [`TokenIssuer`] mints at most one token per batch
//! - [`ProvenanceRecorder`] delivers events to the audit log in per-subject order
//! - [`BatchUploadCoordinator`] runs authorize, mint, persist, record
//! - [`Reconciler`] retries whatever the request path left unresolved
//!
//! All components share one [`SubjectQueue`], so work on the same
//! manufacturer or batch is serialized across requests and the worker.

mod gateway;
mod issuer;
mod reconciler;
mod recorder;
mod subject_queue;
mod upload;

pub use gateway::{AuthorizationGateway, GatewayConfig, MutationOutcome};
pub use issuer::{IssuerConfig, TokenIssuer};
pub use reconciler::{
    spawn_reconciliation_worker, ReconcileReport, Reconciler, ReconcilerConfig,
    ReconcilerMessage, ReconciliationWorker,
};
pub use recorder::{DriveReport, ProvenanceRecorder, RecorderConfig};
pub use subject_queue::{SubjectGuard, SubjectQueue};
pub use upload::{
    BatchRepository, BatchUploadCoordinator, BatchVerification, UploadOutcome, VerificationStatus,
};

use std::sync::Arc;
use std::time::Duration;

use crate::infra::{
    AppendLog, Breakers, CircuitBreakerConfig, DocumentStore, Registry, RetryConfig,
    TokenService,
};
use crate::metrics::MetricsRegistry;

/// External systems the coordinator talks to
#[derive(Clone)]
pub struct Collaborators {
    pub registry: Arc<dyn Registry>,
    pub log: Arc<dyn AppendLog>,
    pub tokens: Arc<dyn TokenService>,
    pub store: Arc<dyn DocumentStore>,
}

/// Configuration for every coordinator component
#[derive(Debug, Clone, Default)]
pub struct CoordinatorConfig {
    pub gateway: GatewayConfig,
    pub issuer: IssuerConfig,
    pub recorder: RecorderConfig,
    pub reconciler: ReconcilerConfig,
    pub breaker: CircuitBreakerConfig,
}

impl CoordinatorConfig {
    pub fn from_env() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            issuer: IssuerConfig::default(),
            recorder: RecorderConfig::from_env(),
            reconciler: ReconcilerConfig::from_env(),
            breaker: CircuitBreakerConfig::default(),
        }
    }

    /// Millisecond backoff and short deadlines for in-process runs.
    pub fn fast() -> Self {
        Self {
            gateway: GatewayConfig {
                registry_timeout: Duration::from_secs(1),
                read_retry: RetryConfig::fast(),
            },
            issuer: IssuerConfig {
                timeout: Duration::from_secs(1),
                retry: RetryConfig::fast(),
            },
            recorder: RecorderConfig {
                retry: RetryConfig::fast().with_max_attempts(5),
                submit_timeout: Duration::from_secs(1),
                ..RecorderConfig::default()
            },
            reconciler: ReconcilerConfig {
                interval: Duration::from_millis(50),
                audit_grace: Duration::ZERO,
                ..ReconcilerConfig::default()
            },
            breaker: CircuitBreakerConfig::lenient(),
        }
    }
}

/// The wired coordinator components
#[derive(Clone)]
pub struct Coordinator {
    pub gateway: AuthorizationGateway,
    pub issuer: TokenIssuer,
    pub recorder: ProvenanceRecorder,
    pub uploads: BatchUploadCoordinator,
    pub reconciler: Reconciler,
    pub breakers: Breakers,
    pub metrics: Arc<MetricsRegistry>,
}

impl Coordinator {
    pub fn new(
        collaborators: Collaborators,
        config: CoordinatorConfig,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        let breakers = Breakers::new(config.breaker.clone());
        let queue = SubjectQueue::new();

        let recorder = ProvenanceRecorder::new(
            config.recorder,
            collaborators.log.clone(),
            collaborators.store.clone(),
            queue,
            breakers.audit_log.clone(),
            metrics.clone(),
        );
        let gateway = AuthorizationGateway::new(
            config.gateway,
            collaborators.registry.clone(),
            collaborators.store.clone(),
            recorder.clone(),
            breakers.registry.clone(),
            metrics.clone(),
        );
        let issuer = TokenIssuer::new(
            config.issuer,
            collaborators.tokens.clone(),
            breakers.token_service.clone(),
            metrics.clone(),
        );
        let batches = BatchRepository::new(collaborators.store.clone());
        let uploads = BatchUploadCoordinator::new(
            gateway.clone(),
            issuer.clone(),
            recorder.clone(),
            batches.clone(),
            metrics.clone(),
        );
        let reconciler = Reconciler::new(
            config.reconciler,
            recorder.clone(),
            gateway.clone(),
            batches,
            metrics.clone(),
        );

        Self {
            gateway,
            issuer,
            recorder,
            uploads,
            reconciler,
            breakers,
            metrics,
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::infra::{
        InMemoryAppendLog, InMemoryDocumentStore, InMemoryRegistry, InMemoryTokenService,
    };

    /// A coordinator over in-memory collaborators, with handles to the fakes.
    pub(crate) struct Harness {
        pub coordinator: Coordinator,
        pub registry: Arc<InMemoryRegistry>,
        pub log: Arc<InMemoryAppendLog>,
        pub tokens: Arc<InMemoryTokenService>,
        pub store: Arc<InMemoryDocumentStore>,
    }

    impl Harness {
        pub fn new() -> Self {
            Self::with_config(CoordinatorConfig::fast())
        }

        pub fn with_config(config: CoordinatorConfig) -> Self {
            let registry = Arc::new(InMemoryRegistry::new());
            let log = Arc::new(InMemoryAppendLog::new());
            let tokens = Arc::new(InMemoryTokenService::new());
            let store = Arc::new(InMemoryDocumentStore::new());
            let collaborators = Collaborators {
                registry: registry.clone(),
                log: log.clone(),
                tokens: tokens.clone(),
                store: store.clone(),
            };
            Self {
                coordinator: Coordinator::new(
                    collaborators,
                    config,
                    Arc::new(MetricsRegistry::new()),
                ),
                registry,
                log,
                tokens,
                store,
            }
        }
    }
}
