//! TracerX Provenance Coordinator
//!
//! Keeps a manufacturer registry, a drug token service and an append-only
//! audit log consistent for every authorization change and batch upload.
//!
//! ## Modules
//!
//! - [`domain`] - Core domain types (addresses, batches, provenance events)
//! - [`coordinator`] - Gateway, issuer, recorder, upload flow, reconciliation
//! - [`infra`] - Collaborator traits and their EVM, PostgreSQL and in-memory implementations
//! - [`auth`] - API key authentication
//! - [`crypto`] - Canonical JSON and idempotency keys
//! - [`metrics`] - In-process metrics
//! - [`telemetry`] - Logging and OpenTelemetry integration
//! - [`api`] - REST API routes

pub mod api;
pub mod auth;
pub mod coordinator;
pub mod crypto;
pub mod domain;
pub mod infra;
pub mod metrics;
pub mod migrations;
pub mod server;
pub mod telemetry;

// Re-export commonly used types
pub use coordinator::{Collaborators, Coordinator, CoordinatorConfig};
pub use domain::{
    BatchRecord, BatchStatus, EventDraft, ManufacturerAddress, ProvenanceEvent, UploadRequest,
};
pub use infra::{CoordinatorError, Result};
