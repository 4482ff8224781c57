//! Error types for the provenance coordinator

use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::domain::FieldError;

/// External collaborators the coordinator talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    Registry,
    AuditLog,
    TokenService,
}

impl Service {
    pub fn as_str(&self) -> &'static str {
        match self {
            Service::Registry => "registry",
            Service::AuditLog => "audit_log",
            Service::TokenService => "token_service",
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure reported by an external collaborator call
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// Transport failure or unavailable service
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// No answer within the call budget
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Circuit breaker is failing fast
    #[error("circuit breaker open")]
    CircuitOpen,

    /// The service refused the request; retrying will not help
    #[error("rejected: {0}")]
    Rejected(String),
}

impl ServiceError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ServiceError::Rejected(_))
    }
}

/// Document store failures
#[derive(Error, Debug)]
pub enum StoreError {
    /// Optimistic precondition failed
    #[error("version conflict on {collection}/{key}")]
    Conflict { collection: String, key: String },

    /// Store unreachable
    #[error("document store unavailable: {0}")]
    Unavailable(String),

    /// Stored body does not match the expected shape
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Database error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// Errors surfaced by the coordinator components
#[derive(Error, Debug)]
pub enum CoordinatorError {
    /// Caller-fixable input problem. No external call was made.
    #[error("validation error: {message}")]
    Validation {
        field: Option<&'static str>,
        message: String,
    },

    /// Requested transition is not valid from the current state
    #[error("manufacturer {address} is not verified")]
    NotVerified { address: String },

    /// Sender is not an authorized manufacturer. Fail closed.
    #[error("authorization error: {0}")]
    Authorization(String),

    /// Registry, audit log or token service failed
    #[error("{service} error: {source}")]
    ExternalService {
        service: Service,
        #[source]
        source: ServiceError,
    },

    /// Document store failure
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoordinatorError {
    pub fn validation(message: impl Into<String>) -> Self {
        CoordinatorError::Validation {
            field: None,
            message: message.into(),
        }
    }

    pub fn external(service: Service, source: ServiceError) -> Self {
        CoordinatorError::ExternalService { service, source }
    }

    /// Whether the same request may succeed if retried later.
    pub fn is_retryable(&self) -> bool {
        match self {
            CoordinatorError::ExternalService { source, .. } => source.is_retryable(),
            CoordinatorError::Store(StoreError::Unavailable(_))
            | CoordinatorError::Store(StoreError::Conflict { .. }) => true,
            CoordinatorError::Store(StoreError::Database(e)) => is_retryable_db_error(e),
            _ => false,
        }
    }

    /// Validation-class failures never reach an external system.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            CoordinatorError::Validation { .. } | CoordinatorError::NotVerified { .. }
        )
    }
}

impl From<FieldError> for CoordinatorError {
    fn from(err: FieldError) -> Self {
        CoordinatorError::Validation {
            field: Some(err.field),
            message: err.message,
        }
    }
}

impl From<serde_json::Error> for CoordinatorError {
    fn from(err: serde_json::Error) -> Self {
        CoordinatorError::Store(StoreError::Serialization(err))
    }
}

/// Check if a database error is transient
pub fn is_retryable_db_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) => true,
        sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().unwrap_or_default();
            // serialization failure, deadlock, connection exceptions
            code == "40001" || code == "40P01" || code.starts_with("08")
        }
        _ => false,
    }
}

/// Result type for coordinator operations
pub type Result<T> = std::result::Result<T, CoordinatorError>;
