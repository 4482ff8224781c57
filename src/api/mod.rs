//! API layer for the provenance coordinator
//!
//! REST endpoints for manufacturer authorization, batch registration and
//! the provenance journal.

pub mod auth_helpers;
pub mod error;
pub mod handlers;
mod rest;
pub mod types;

pub use error::{ApiError, ErrorCode};
pub use rest::*;
