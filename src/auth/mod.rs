//! Authentication and authorization
//!
//! # Authentication
//!
//! SHA-256 hashed API keys, each bound to a role:
//! - `regulator`: verifies and revokes manufacturers, triggers reconciliation
//! - `manufacturer`: uploads batches
//!
//! Every valid key may call the read endpoints.
//!
//! # Configuration
//!
//! - `AUTH_MODE`: `required` (default) or `disabled` for development
//! - `REGULATOR_API_KEY`: regulator key
//! - `MANUFACTURER_API_KEYS`: comma-separated manufacturer keys
//! - `RATE_LIMIT_PER_MINUTE`: per-key fixed-window limit (off when unset)

mod api_key;
mod middleware;

pub use api_key::*;
pub use middleware::*;

use std::fmt;

/// Role granted by an API key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Regulator,
    Manufacturer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Regulator => "regulator",
            Role::Manufacturer => "manufacturer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authentication context extracted from request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    /// Short, loggable key identifier (prefix of the key hash)
    pub key_id: String,
    pub role: Role,
}

impl AuthContext {
    /// Context used when `AUTH_MODE=disabled`.
    pub fn development() -> Self {
        Self {
            key_id: "dev".to_string(),
            role: Role::Regulator,
        }
    }

    pub fn is_regulator(&self) -> bool {
        self.role == Role::Regulator
    }

    /// Regulators and manufacturers may both register batches.
    pub fn can_upload(&self) -> bool {
        matches!(self.role, Role::Regulator | Role::Manufacturer)
    }
}

/// Authentication error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("missing authentication")]
    MissingAuth,

    #[error("invalid API key")]
    InvalidApiKey,

    #[error("insufficient permissions")]
    InsufficientPermissions,

    #[error("rate limit exceeded")]
    RateLimited,
}
