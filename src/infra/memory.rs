//! In-memory collaborators
//!
//! Used by `BACKEND=memory` and by the test suites. Each fake carries a
//! [`FaultInjector`] so tests can script outages, timeouts, unacknowledged
//! receipts and writes that land but report an error.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{ManufacturerAddress, TokenId, TxHash};

use super::traits::{AppendLog, Document, DocumentStore, LogReceipt, Precondition, Registry, TokenService};
use super::{ServiceError, StoreError};

/// A scripted failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Call fails without side effects
    Unavailable,
    /// Call fails as if its deadline elapsed
    Timeout,
    /// Append log answers with `acknowledged = false`
    Unacknowledged,
    /// The write is applied, then the call reports failure
    AcceptThenError,
    /// Service refuses the request
    Rejected,
}

#[derive(Debug, Default)]
struct FaultPlan {
    queued: VecDeque<Fault>,
    always: Option<Fault>,
    latency: Duration,
}

/// Fault script shared by one fake
#[derive(Debug, Default)]
pub struct FaultInjector {
    plan: Mutex<FaultPlan>,
}

impl FaultInjector {
    /// Fail the next `n` calls with `fault`.
    pub async fn fail_next(&self, n: usize, fault: Fault) {
        let mut plan = self.plan.lock().await;
        plan.queued.extend(std::iter::repeat(fault).take(n));
    }

    /// Fail every call until cleared.
    pub async fn fail_always(&self, fault: Fault) {
        self.plan.lock().await.always = Some(fault);
    }

    pub async fn clear_faults(&self) {
        let mut plan = self.plan.lock().await;
        plan.queued.clear();
        plan.always = None;
    }

    /// Delay every call by `latency`.
    pub async fn set_latency(&self, latency: Duration) {
        self.plan.lock().await.latency = latency;
    }

    /// Apply latency, then pop the fault for a mutating call.
    async fn next(&self) -> Option<Fault> {
        let (latency, fault) = {
            let mut plan = self.plan.lock().await;
            let fault = plan.queued.pop_front().or_else(|| plan.always.clone());
            (plan.latency, fault)
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        fault
    }

    /// Apply latency and report the standing fault only. Queued faults are
    /// reserved for mutating calls.
    async fn standing(&self) -> Option<Fault> {
        let (latency, fault) = {
            let plan = self.plan.lock().await;
            (plan.latency, plan.always.clone())
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        fault
    }
}

fn fault_error(fault: &Fault) -> ServiceError {
    match fault {
        Fault::Timeout => ServiceError::Timeout(Duration::ZERO),
        Fault::Rejected => ServiceError::Rejected("rejected by fault injection".to_string()),
        _ => ServiceError::Unavailable("injected fault".to_string()),
    }
}

fn next_tx_hash(counter: &AtomicU64) -> TxHash {
    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
    TxHash::from_bytes(&crate::crypto::sha256(&n.to_be_bytes()))
}

// ============================================================================
// Registry
// ============================================================================

/// Registry call, as recorded by [`InMemoryRegistry`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryCall {
    IsVerified(ManufacturerAddress),
    Verify(ManufacturerAddress),
    Revoke(ManufacturerAddress),
}

#[derive(Default)]
pub struct InMemoryRegistry {
    /// Keyed by EVM form, as the contract sees it
    verified: Mutex<HashMap<[u8; 20], bool>>,
    calls: Mutex<Vec<RegistryCall>>,
    tx_counter: AtomicU64,
    faults: FaultInjector,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    /// Seed registry state without recording a call.
    pub async fn set_verified(&self, address: ManufacturerAddress, verified: bool) {
        self.verified.lock().await.insert(address.to_evm_bytes(), verified);
    }

    pub async fn is_verified(&self, address: &ManufacturerAddress) -> bool {
        self.verified
            .lock()
            .await
            .get(&address.to_evm_bytes())
            .copied()
            .unwrap_or(false)
    }

    pub async fn calls(&self) -> Vec<RegistryCall> {
        self.calls.lock().await.clone()
    }

    async fn mutate(&self, address: &ManufacturerAddress, verified: bool) -> Result<TxHash, ServiceError> {
        let fault = self.faults.next().await;
        if let Some(f) = &fault {
            if *f != Fault::AcceptThenError {
                return Err(fault_error(f));
            }
        }

        let mut state = self.verified.lock().await;
        let key = address.to_evm_bytes();
        if !verified && !state.get(&key).copied().unwrap_or(false) {
            return Err(ServiceError::Rejected(format!("{} is not verified", address)));
        }
        state.insert(key, verified);
        drop(state);

        let tx_hash = next_tx_hash(&self.tx_counter);
        match fault {
            Some(_) => Err(ServiceError::Unavailable("connection reset after send".to_string())),
            None => Ok(tx_hash),
        }
    }
}

#[async_trait]
impl Registry for InMemoryRegistry {
    async fn is_verified_manufacturer(
        &self,
        address: &ManufacturerAddress,
    ) -> Result<bool, ServiceError> {
        self.calls.lock().await.push(RegistryCall::IsVerified(*address));
        if let Some(fault) = self.faults.next().await {
            return Err(fault_error(&fault));
        }
        Ok(self.is_verified(address).await)
    }

    async fn verify_manufacturer(
        &self,
        address: &ManufacturerAddress,
    ) -> Result<TxHash, ServiceError> {
        self.calls.lock().await.push(RegistryCall::Verify(*address));
        self.mutate(address, true).await
    }

    async fn revoke_manufacturer(
        &self,
        address: &ManufacturerAddress,
    ) -> Result<TxHash, ServiceError> {
        self.calls.lock().await.push(RegistryCall::Revoke(*address));
        self.mutate(address, false).await
    }
}

// ============================================================================
// Append log
// ============================================================================

/// One accepted audit log entry
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub sequence_number: u64,
    pub idempotency_key: String,
    pub message: serde_json::Value,
}

#[derive(Default)]
struct LogState {
    topics: HashMap<String, Vec<LogEntry>>,
    submissions: u64,
}

/// Append-only log that deduplicates by idempotency key per topic
#[derive(Default)]
pub struct InMemoryAppendLog {
    state: Mutex<LogState>,
    faults: FaultInjector,
}

impl InMemoryAppendLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    pub async fn entries(&self, topic: &str) -> Vec<LogEntry> {
        self.state
            .lock()
            .await
            .topics
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    /// Submit calls received, faulted ones included.
    pub async fn submission_count(&self) -> u64 {
        self.state.lock().await.submissions
    }

    fn append(state: &mut LogState, topic: &str, message: &str, key: &str) -> u64 {
        let entries = state.topics.entry(topic.to_string()).or_default();
        if let Some(existing) = entries.iter().find(|e| e.idempotency_key == key) {
            return existing.sequence_number;
        }
        let sequence_number = entries.len() as u64 + 1;
        let message = serde_json::from_str(message)
            .unwrap_or_else(|_| serde_json::Value::String(message.to_string()));
        entries.push(LogEntry {
            sequence_number,
            idempotency_key: key.to_string(),
            message,
        });
        sequence_number
    }
}

#[async_trait]
impl AppendLog for InMemoryAppendLog {
    async fn submit(
        &self,
        topic: &str,
        message: &str,
        idempotency_key: &str,
    ) -> Result<LogReceipt, ServiceError> {
        self.state.lock().await.submissions += 1;
        let fault = self.faults.next().await;

        match fault {
            None => {
                let mut state = self.state.lock().await;
                let seq = Self::append(&mut state, topic, message, idempotency_key);
                Ok(LogReceipt {
                    acknowledged: true,
                    sequence_number: Some(seq),
                })
            }
            Some(Fault::Unacknowledged) => Ok(LogReceipt {
                acknowledged: false,
                sequence_number: None,
            }),
            Some(Fault::AcceptThenError) => {
                let mut state = self.state.lock().await;
                Self::append(&mut state, topic, message, idempotency_key);
                Err(ServiceError::Unavailable("connection reset after send".to_string()))
            }
            Some(f) => Err(fault_error(&f)),
        }
    }

    async fn lookup(
        &self,
        topic: &str,
        idempotency_key: &str,
    ) -> Result<Option<u64>, ServiceError> {
        if let Some(fault) = self.faults.standing().await {
            if fault != Fault::Unacknowledged {
                return Err(fault_error(&fault));
            }
        }
        let state = self.state.lock().await;
        Ok(state.topics.get(topic).and_then(|entries| {
            entries
                .iter()
                .find(|e| e.idempotency_key == idempotency_key)
                .map(|e| e.sequence_number)
        }))
    }
}

// ============================================================================
// Token service
// ============================================================================

/// Token service that mints sequential ids, one per batch
#[derive(Default)]
pub struct InMemoryTokenService {
    tokens: Mutex<HashMap<String, TokenId>>,
    next_id: AtomicU64,
    faults: FaultInjector,
}

impl InMemoryTokenService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    /// Tokens minted so far.
    pub async fn mint_count(&self) -> usize {
        self.tokens.lock().await.len()
    }
}

#[async_trait]
impl TokenService for InMemoryTokenService {
    async fn mint(&self, drug_name: &str, batch_id: &str) -> Result<TokenId, ServiceError> {
        let fault = self.faults.next().await;
        if let Some(f) = &fault {
            if *f != Fault::AcceptThenError {
                return Err(fault_error(f));
            }
        }
        if drug_name.is_empty() {
            return Err(ServiceError::Rejected("drug name is empty".to_string()));
        }

        let mut tokens = self.tokens.lock().await;
        if tokens.contains_key(batch_id) {
            return Err(ServiceError::Rejected(format!(
                "token already minted for batch {}",
                batch_id
            )));
        }
        let id = TokenId::new((self.next_id.fetch_add(1, Ordering::SeqCst) + 1).to_string());
        tokens.insert(batch_id.to_string(), id.clone());
        drop(tokens);

        match fault {
            Some(_) => Err(ServiceError::Unavailable("connection reset after send".to_string())),
            None => Ok(id),
        }
    }

    async fn token_for_batch(&self, batch_id: &str) -> Result<Option<TokenId>, ServiceError> {
        if let Some(fault) = self.faults.standing().await {
            return Err(fault_error(&fault));
        }
        Ok(self.tokens.lock().await.get(batch_id).cloned())
    }
}

// ============================================================================
// Document store
// ============================================================================

/// Versioned document store over nested hash maps
#[derive(Default)]
pub struct InMemoryDocumentStore {
    collections: Mutex<HashMap<String, HashMap<String, (serde_json::Value, u64)>>>,
    unavailable: std::sync::atomic::AtomicBool,
    read_only: std::sync::Mutex<HashSet<String>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with `StoreError::Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make `put` into `collection` fail with `StoreError::Unavailable`
    /// while reads keep working.
    pub fn fail_writes_to(&self, collection: &str, failing: bool) {
        let mut read_only = self
            .read_only
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if failing {
            read_only.insert(collection.to_string());
        } else {
            read_only.remove(collection);
        }
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected fault".to_string()));
        }
        Ok(())
    }

    fn check_write(&self, collection: &str) -> Result<(), StoreError> {
        self.check()?;
        let read_only = self
            .read_only
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if read_only.contains(collection) {
            return Err(StoreError::Unavailable(format!(
                "injected write fault on {}",
                collection
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn get(&self, collection: &str, key: &str) -> Result<Option<Document>, StoreError> {
        self.check()?;
        let collections = self.collections.lock().await;
        Ok(collections
            .get(collection)
            .and_then(|docs| docs.get(key))
            .map(|(body, version)| Document {
                key: key.to_string(),
                body: body.clone(),
                version: *version,
            }))
    }

    async fn put(
        &self,
        collection: &str,
        key: &str,
        body: serde_json::Value,
        precondition: Precondition,
    ) -> Result<u64, StoreError> {
        self.check_write(collection)?;
        let mut collections = self.collections.lock().await;
        let docs = collections.entry(collection.to_string()).or_default();
        let current = docs.get(key).map(|(_, v)| *v);

        let ok = match precondition {
            Precondition::Any => true,
            Precondition::Absent => current.is_none(),
            Precondition::Version(v) => current == Some(v),
        };
        if !ok {
            return Err(StoreError::Conflict {
                collection: collection.to_string(),
                key: key.to_string(),
            });
        }

        let version = current.unwrap_or(0) + 1;
        docs.insert(key.to_string(), (body, version));
        Ok(version)
    }

    async fn find(
        &self,
        collection: &str,
        field: &str,
        value: &str,
    ) -> Result<Vec<Document>, StoreError> {
        self.check()?;
        let collections = self.collections.lock().await;
        let mut found: Vec<Document> = collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .filter(|(_, (body, _))| body.get(field).and_then(|v| v.as_str()) == Some(value))
                    .map(|(key, (body, version))| Document {
                        key: key.clone(),
                        body: body.clone(),
                        version: *version,
                    })
                    .collect()
            })
            .unwrap_or_default();
        found.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(found)
    }
}
