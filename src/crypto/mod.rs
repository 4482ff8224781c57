//! Hashing utilities
//!
//! Canonical JSON and the idempotency keys used to deduplicate audit-log
//! submissions.

mod hash;

pub use hash::*;
