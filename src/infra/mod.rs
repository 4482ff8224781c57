//! Infrastructure layer for the provenance coordinator
//!
//! Contains the collaborator traits and their implementations:
//! - Registry and token service (EVM contracts over JSON-RPC)
//! - Audit log and document store (PostgreSQL)
//! - In-memory versions of all four, with fault injection
//! - Circuit breakers and retry policies guarding every external call

mod circuit_breaker;
mod error;
pub mod evm;
pub mod memory;
pub mod postgres;
mod retry;
mod traits;

pub use circuit_breaker::{
    Breakers, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState,
};
pub use error::*;
pub use evm::{ChainConfig, EvmRegistry, EvmTokenService};
pub use memory::{
    Fault, FaultInjector, InMemoryAppendLog, InMemoryDocumentStore, InMemoryRegistry,
    InMemoryTokenService, LogEntry, RegistryCall,
};
pub use postgres::{PgAppendLog, PgDocumentStore};
pub use retry::{Retry, RetryConfig, RetryResult};
pub use traits::*;
