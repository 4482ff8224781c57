//! Common test utilities and fixtures for integration tests

#![allow(dead_code)]

use std::sync::Arc;

use tracerx_coordinator::auth::{
    ApiKeyRecord, ApiKeyValidator, AuthMiddlewareState, Authenticator, Role,
};
use tracerx_coordinator::coordinator::{Collaborators, Coordinator, CoordinatorConfig};
use tracerx_coordinator::domain::{ManufacturerAddress, UploadRequest};
use tracerx_coordinator::infra::{
    InMemoryAppendLog, InMemoryDocumentStore, InMemoryRegistry, InMemoryTokenService,
};
use tracerx_coordinator::metrics::MetricsRegistry;
use tracerx_coordinator::server::{build_router, AppState, Backend};

/// Audit topic the coordinator writes to by default
pub const TOPIC: &str = "0.0.6825354";

pub const REGULATOR_KEY: &str = "trx_test_regulator_key";
pub const MANUFACTURER_KEY: &str = "trx_test_manufacturer_key";

/// Coordinator over in-memory collaborators, with handles to every fake
pub struct TestApp {
    pub coordinator: Coordinator,
    pub registry: Arc<InMemoryRegistry>,
    pub log: Arc<InMemoryAppendLog>,
    pub tokens: Arc<InMemoryTokenService>,
    pub store: Arc<InMemoryDocumentStore>,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_config(CoordinatorConfig::fast())
    }

    /// In-request audit budget of `attempts`.
    pub fn with_audit_attempts(attempts: u32) -> Self {
        let mut config = CoordinatorConfig::fast();
        config.recorder.retry = config.recorder.retry.with_max_attempts(attempts);
        Self::with_config(config)
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
            coordinator: Coordinator::new(collaborators, config, Arc::new(MetricsRegistry::new())),
            registry,
            log,
            tokens,
            store,
        }
    }

    /// Router with API key auth, one regulator and one manufacturer key.
    pub fn router(&self) -> axum::Router {
        let validator = Arc::new(ApiKeyValidator::new());
        validator.register_key(ApiKeyRecord::new(REGULATOR_KEY, Role::Regulator));
        validator.register_key(ApiKeyRecord::new(MANUFACTURER_KEY, Role::Manufacturer));

        let auth_state = AuthMiddlewareState {
            authenticator: Arc::new(Authenticator::new(validator)),
            require_auth: true,
            rate_limiter: None,
        };

        let state = AppState::new(self.coordinator.clone(), self.store.clone(), Backend::Memory);
        build_router(auth_state)
            .expect("router")
            .with_state(state)
    }

    /// Audit log messages of one event type, in log order.
    pub async fn log_events(&self, event: &str) -> Vec<serde_json::Value> {
        self.log
            .entries(TOPIC)
            .await
            .into_iter()
            .map(|e| e.message)
            .filter(|m| m["event"] == event)
            .collect()
    }
}

pub fn address(raw: &str) -> ManufacturerAddress {
    ManufacturerAddress::parse(raw).expect("valid address")
}

/// Upload request for `batch_id` sent by `sender`.
pub fn upload_request(batch_id: &str, sender: &str) -> UploadRequest {
    UploadRequest {
        drug_name: "Amoxicillin 500mg".to_string(),
        manufacturer: "Acme Pharma".to_string(),
        batch_id: batch_id.to_string(),
        expiry: "2027-06-30".to_string(),
        sender_address: sender.to_string(),
    }
}
