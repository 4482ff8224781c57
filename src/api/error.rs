//! Structured API error responses with error codes
//!
//! Every failure leaves the API as
//! `{ "error": { "code", "numericCode", "message", "retryable", ... } }`
//! with the code repeated in the `x-error-code` header.

use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::auth::AuthError;
use crate::infra::{CoordinatorError, ServiceError, StoreError};

// ============================================================================
// Error Codes
// ============================================================================

/// Error codes for API responses
///
/// These codes are stable and can be used by clients for programmatic error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Authentication errors (1xxx)
    /// No authentication credentials provided
    AuthRequired,
    /// Invalid API key format or value
    InvalidApiKey,
    /// Caller's role does not allow this operation
    InsufficientPermissions,
    /// Upload sender is not a verified manufacturer
    SenderNotAuthorized,

    // Rate limiting errors (2xxx)
    RateLimitExceeded,

    // Validation errors (3xxx)
    /// Request body is malformed
    InvalidRequestBody,
    /// Required field is missing
    MissingRequiredField,
    /// Field value is invalid
    InvalidFieldValue,

    // Resource errors (4xxx)
    ResourceNotFound,
    BatchNotFound,
    ManufacturerNotFound,

    // Conflict errors (5xxx)
    /// Version conflict during update
    VersionConflict,

    // State errors (7xxx)
    /// Revoke of an address that is not verified
    ManufacturerNotVerified,

    // Infrastructure errors (8xxx)
    /// Document store failed
    DatabaseError,
    /// External service or breaker unavailable
    ServiceUnavailable,
    /// External call timed out
    Timeout,
    /// Registry, token service or audit log returned an error
    UpstreamFailed,
    InternalError,
}

impl ErrorCode {
    /// Get the numeric code for this error
    pub fn numeric_code(&self) -> u32 {
        match self {
            ErrorCode::AuthRequired => 1001,
            ErrorCode::InvalidApiKey => 1002,
            ErrorCode::InsufficientPermissions => 1005,
            ErrorCode::SenderNotAuthorized => 1006,

            ErrorCode::RateLimitExceeded => 2001,

            ErrorCode::InvalidRequestBody => 3001,
            ErrorCode::MissingRequiredField => 3002,
            ErrorCode::InvalidFieldValue => 3003,

            ErrorCode::ResourceNotFound => 4001,
            ErrorCode::BatchNotFound => 4003,
            ErrorCode::ManufacturerNotFound => 4006,

            ErrorCode::VersionConflict => 5003,

            ErrorCode::ManufacturerNotVerified => 7004,

            ErrorCode::DatabaseError => 8001,
            ErrorCode::ServiceUnavailable => 8002,
            ErrorCode::Timeout => 8003,
            ErrorCode::UpstreamFailed => 8004,
            ErrorCode::InternalError => 8999,
        }
    }

    /// Get the HTTP status code for this error
    pub fn http_status(&self) -> StatusCode {
        match self {
            ErrorCode::AuthRequired => StatusCode::UNAUTHORIZED,
            ErrorCode::InvalidApiKey => StatusCode::UNAUTHORIZED,
            ErrorCode::InsufficientPermissions => StatusCode::FORBIDDEN,
            ErrorCode::SenderNotAuthorized => StatusCode::FORBIDDEN,

            ErrorCode::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,

            ErrorCode::InvalidRequestBody => StatusCode::BAD_REQUEST,
            ErrorCode::MissingRequiredField => StatusCode::BAD_REQUEST,
            ErrorCode::InvalidFieldValue => StatusCode::BAD_REQUEST,

            ErrorCode::ResourceNotFound => StatusCode::NOT_FOUND,
            ErrorCode::BatchNotFound => StatusCode::NOT_FOUND,
            ErrorCode::ManufacturerNotFound => StatusCode::NOT_FOUND,

            ErrorCode::VersionConflict => StatusCode::CONFLICT,

            ErrorCode::ManufacturerNotVerified => StatusCode::FORBIDDEN,

            ErrorCode::DatabaseError => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorCode::UpstreamFailed => StatusCode::BAD_GATEWAY,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let code_str = match self {
            ErrorCode::AuthRequired => "AUTH_REQUIRED",
            ErrorCode::InvalidApiKey => "INVALID_API_KEY",
            ErrorCode::InsufficientPermissions => "INSUFFICIENT_PERMISSIONS",
            ErrorCode::SenderNotAuthorized => "SENDER_NOT_AUTHORIZED",
            ErrorCode::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            ErrorCode::InvalidRequestBody => "INVALID_REQUEST_BODY",
            ErrorCode::MissingRequiredField => "MISSING_REQUIRED_FIELD",
            ErrorCode::InvalidFieldValue => "INVALID_FIELD_VALUE",
            ErrorCode::ResourceNotFound => "RESOURCE_NOT_FOUND",
            ErrorCode::BatchNotFound => "BATCH_NOT_FOUND",
            ErrorCode::ManufacturerNotFound => "MANUFACTURER_NOT_FOUND",
            ErrorCode::VersionConflict => "VERSION_CONFLICT",
            ErrorCode::ManufacturerNotVerified => "MANUFACTURER_NOT_VERIFIED",
            ErrorCode::DatabaseError => "DATABASE_ERROR",
            ErrorCode::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::UpstreamFailed => "UPSTREAM_FAILED",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        };
        write!(f, "{}", code_str)
    }
}

// ============================================================================
// Structured Error Response
// ============================================================================

/// Structured error response for API endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub error: ErrorDetails,
}

/// Detailed error information
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetails {
    /// Machine-readable error code
    pub code: ErrorCode,

    /// Numeric error code for easy categorization
    pub numeric_code: u32,

    /// Human-readable error message
    pub message: String,

    /// Whether the same request may succeed later
    pub retryable: bool,

    /// Additional error details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,

    /// Retry information for rate limiting
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,

    /// Related resource ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetails {
                code,
                numeric_code: code.numeric_code(),
                message: message.into(),
                retryable: false,
                details: None,
                retry_after: None,
                resource_id: None,
            },
        }
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.error.retryable = retryable;
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.error.details = Some(details);
        self
    }

    /// Set retry-after seconds (for rate limiting)
    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.error.retry_after = Some(seconds);
        self
    }

    pub fn with_resource_id(mut self, id: impl Into<String>) -> Self {
        self.error.resource_id = Some(id.into());
        self
    }

    pub fn status(&self) -> StatusCode {
        self.error.code.http_status()
    }

    pub fn code(&self) -> ErrorCode {
        self.error.code
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code_str = self.error.code.to_string();
        let mut response = (status, Json(self)).into_response();

        if let Ok(code_value) = HeaderValue::from_str(&code_str) {
            response
                .headers_mut()
                .insert(HeaderName::from_static("x-error-code"), code_value);
        }

        response
    }
}

// ============================================================================
// Conversions
// ============================================================================

impl From<CoordinatorError> for ApiError {
    fn from(err: CoordinatorError) -> Self {
        let retryable = err.is_retryable();
        let message = err.to_string();

        let api_error = match err {
            CoordinatorError::Validation { field, message } => {
                let error = ApiError::new(ErrorCode::InvalidFieldValue, message);
                match field {
                    Some(field) => error.with_details(serde_json::json!({ "field": field })),
                    None => error,
                }
            }
            CoordinatorError::NotVerified { address } => {
                ApiError::new(ErrorCode::ManufacturerNotVerified, message)
                    .with_resource_id(address)
            }
            CoordinatorError::Authorization(reason) => {
                ApiError::new(ErrorCode::SenderNotAuthorized, reason)
            }
            CoordinatorError::ExternalService { service, source } => {
                let code = match source {
                    ServiceError::CircuitOpen => ErrorCode::ServiceUnavailable,
                    ServiceError::Timeout(_) => ErrorCode::Timeout,
                    ServiceError::Unavailable(_) | ServiceError::Rejected(_) => {
                        ErrorCode::UpstreamFailed
                    }
                };
                ApiError::new(code, message)
                    .with_details(serde_json::json!({ "service": service.as_str() }))
            }
            CoordinatorError::Store(StoreError::Conflict { collection, key }) => {
                ApiError::new(ErrorCode::VersionConflict, message)
                    .with_resource_id(format!("{}/{}", collection, key))
            }
            CoordinatorError::Store(_) => ApiError::new(ErrorCode::DatabaseError, message),
            CoordinatorError::Internal(_) => ApiError::new(ErrorCode::InternalError, message),
        };

        api_error.retryable(retryable)
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::MissingAuth => unauthorized("Missing authentication"),
            AuthError::InvalidApiKey => ApiError::new(ErrorCode::InvalidApiKey, "Invalid API key"),
            AuthError::InsufficientPermissions => forbidden("Insufficient permissions"),
            AuthError::RateLimited => rate_limited(60),
        }
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Create a not found error for a specific resource type
pub fn not_found(code: ErrorCode, resource_type: &str, id: impl std::fmt::Display) -> ApiError {
    ApiError::new(code, format!("{} not found: {}", resource_type, id))
        .with_resource_id(id.to_string())
}

/// Create a validation error with field details
pub fn validation_error(field: &str, message: impl Into<String>) -> ApiError {
    ApiError::new(ErrorCode::InvalidFieldValue, message.into())
        .with_details(serde_json::json!({ "field": field }))
}

/// Create a rate limit error with retry-after
pub fn rate_limited(retry_after_seconds: u64) -> ApiError {
    ApiError::new(ErrorCode::RateLimitExceeded, "Rate limit exceeded")
        .with_retry_after(retry_after_seconds)
        .retryable(true)
}

pub fn unauthorized(message: impl Into<String>) -> ApiError {
    ApiError::new(ErrorCode::AuthRequired, message.into())
}

pub fn forbidden(message: impl Into<String>) -> ApiError {
    ApiError::new(ErrorCode::InsufficientPermissions, message.into())
}

pub fn service_unavailable(message: impl Into<String>) -> ApiError {
    ApiError::new(ErrorCode::ServiceUnavailable, message.into()).retryable(true)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::Service;
    use std::time::Duration;

    #[test]
    fn test_error_code_numeric() {
        assert_eq!(ErrorCode::AuthRequired.numeric_code(), 1001);
        assert_eq!(ErrorCode::RateLimitExceeded.numeric_code(), 2001);
        assert_eq!(ErrorCode::InvalidRequestBody.numeric_code(), 3001);
        assert_eq!(ErrorCode::BatchNotFound.numeric_code(), 4003);
        assert_eq!(ErrorCode::VersionConflict.numeric_code(), 5003);
        assert_eq!(ErrorCode::DatabaseError.numeric_code(), 8001);
        assert_eq!(ErrorCode::InternalError.numeric_code(), 8999);
    }

    #[test]
    fn test_error_code_http_status() {
        assert_eq!(ErrorCode::AuthRequired.http_status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ErrorCode::SenderNotAuthorized.http_status(), StatusCode::FORBIDDEN);
        assert_eq!(ErrorCode::ManufacturerNotVerified.http_status(), StatusCode::FORBIDDEN);
        assert_eq!(ErrorCode::RateLimitExceeded.http_status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(ErrorCode::InvalidFieldValue.http_status(), StatusCode::BAD_REQUEST);
        assert_eq!(ErrorCode::UpstreamFailed.http_status(), StatusCode::BAD_GATEWAY);
        assert_eq!(ErrorCode::ServiceUnavailable.http_status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_validation_maps_to_400_with_field() {
        let error: ApiError = CoordinatorError::Validation {
            field: Some("batchId"),
            message: "All fields are required".into(),
        }
        .into();

        assert_eq!(error.status(), StatusCode::BAD_REQUEST);
        assert_eq!(error.error.message, "All fields are required");
        assert_eq!(error.error.details, Some(serde_json::json!({"field": "batchId"})));
        assert!(!error.error.retryable);
    }

    #[test]
    fn test_external_service_statuses() {
        let open: ApiError =
            CoordinatorError::external(Service::Registry, ServiceError::CircuitOpen).into();
        assert_eq!(open.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(open.error.retryable);

        let timeout: ApiError = CoordinatorError::external(
            Service::TokenService,
            ServiceError::Timeout(Duration::from_secs(15)),
        )
        .into();
        assert_eq!(timeout.status(), StatusCode::GATEWAY_TIMEOUT);

        let rejected: ApiError = CoordinatorError::external(
            Service::Registry,
            ServiceError::Rejected("execution reverted".into()),
        )
        .into();
        assert_eq!(rejected.status(), StatusCode::BAD_GATEWAY);
        assert!(!rejected.error.retryable);
        assert_eq!(
            rejected.error.details,
            Some(serde_json::json!({"service": "registry"}))
        );
    }

    #[test]
    fn test_authorization_errors() {
        let sender: ApiError =
            CoordinatorError::Authorization("sender 0.0.5 is not authorized".into()).into();
        assert_eq!(sender.code(), ErrorCode::SenderNotAuthorized);

        let not_verified: ApiError = CoordinatorError::NotVerified {
            address: "0.0.5".into(),
        }
        .into();
        assert_eq!(not_verified.code(), ErrorCode::ManufacturerNotVerified);
        assert_eq!(not_verified.error.resource_id.as_deref(), Some("0.0.5"));

        let limited: ApiError = AuthError::RateLimited.into();
        assert_eq!(limited.error.retry_after, Some(60));
    }

    #[test]
    fn test_error_serialization() {
        let error = ApiError::new(ErrorCode::BatchNotFound, "Batch not found: B1");
        let json = serde_json::to_value(&error).unwrap();

        assert_eq!(json["error"]["code"], "BATCH_NOT_FOUND");
        assert_eq!(json["error"]["numericCode"], 4003);
        assert_eq!(json["error"]["retryable"], false);
        assert!(json["error"].get("details").is_none());
    }

    #[test]
    fn test_response_carries_code_header() {
        let response = service_unavailable("reconciler not running").into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers().get("x-error-code").unwrap(),
            "SERVICE_UNAVAILABLE"
        );
    }

    #[test]
    fn test_error_display() {
        assert_eq!(ErrorCode::BatchNotFound.to_string(), "BATCH_NOT_FOUND");
        assert_eq!(ErrorCode::RateLimitExceeded.to_string(), "RATE_LIMIT_EXCEEDED");
    }
}
