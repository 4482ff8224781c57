//! Domain models for the TracerX provenance coordinator
//!
//! Manufacturers, drug batches and the provenance events that tie them to
//! the audit log.

mod address;
mod batch;
mod manufacturer;
mod provenance;
mod types;

pub use address::*;
pub use batch::*;
pub use manufacturer::*;
pub use provenance::*;
pub use types::*;
