//! Authentication middleware for Axum
//!
//! Extracts the API key from requests, attaches the caller's role, and
//! applies the per-key rate limit.

use axum::{
    body::Body,
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use super::{ApiKeyValidator, AuthContext, AuthError, API_KEY_PREFIX};
use crate::api::ApiError;

/// Header carrying a raw API key
pub const API_KEY_HEADER: &str = "x-api-key";

pub struct Authenticator {
    api_key_validator: Arc<ApiKeyValidator>,
}

impl Authenticator {
    pub fn new(api_key_validator: Arc<ApiKeyValidator>) -> Self {
        Self { api_key_validator }
    }

    /// Authenticate from the `Authorization` header value or `x-api-key`.
    ///
    /// Accepted forms: `ApiKey <key>`, `Bearer <key>`, or the raw key.
    pub fn authenticate(
        &self,
        auth_header: Option<&str>,
        api_key_header: Option<&str>,
    ) -> Result<AuthContext, AuthError> {
        if let Some(key) = api_key_header {
            return self.api_key_validator.validate(key.trim());
        }

        let header = auth_header.ok_or(AuthError::MissingAuth)?;

        if let Some(key) = header
            .strip_prefix("ApiKey ")
            .or_else(|| header.strip_prefix("Bearer "))
        {
            return self.api_key_validator.validate(key.trim());
        }

        if header.starts_with(API_KEY_PREFIX) {
            return self.api_key_validator.validate(header);
        }

        Err(AuthError::MissingAuth)
    }
}

/// Auth context extension for request
#[derive(Clone)]
pub struct AuthContextExt(pub AuthContext);

/// Authentication middleware configuration/state.
#[derive(Clone)]
pub struct AuthMiddlewareState {
    pub authenticator: Arc<Authenticator>,
    /// If false, unauthenticated requests run as a development regulator.
    pub require_auth: bool,
    pub rate_limiter: Option<Arc<RateLimiter>>,
}

pub async fn auth_middleware(
    State(state): State<AuthMiddlewareState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let headers = request.headers();
    let auth_header = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
    let api_key_header = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok());

    let context = match state.authenticator.authenticate(auth_header, api_key_header) {
        Ok(context) => context,
        Err(e) if state.require_auth => {
            tracing::debug!(error = %e, path = %request.uri().path(), "Rejected request");
            return ApiError::from(e).into_response();
        }
        Err(_) => AuthContext::development(),
    };

    if let Some(ref limiter) = state.rate_limiter {
        if let Err(e) = limiter.check(&format!("key:{}", context.key_id)) {
            return ApiError::from(e).into_response();
        }
    }

    request.extensions_mut().insert(AuthContextExt(context));
    next.run(request).await
}

/// Fixed-window rate limiter keyed by caller
pub struct RateLimiter {
    requests_per_minute: u32,
    window: Duration,
    counts: RwLock<HashMap<String, (u32, Instant)>>,
}

impl RateLimiter {
    pub fn new(requests_per_minute: u32) -> Self {
        Self {
            requests_per_minute,
            window: Duration::from_secs(60),
            counts: RwLock::new(HashMap::new()),
        }
    }

    /// Check if request is allowed
    pub fn check(&self, key: &str) -> Result<(), AuthError> {
        let mut counts = self.counts.write().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();

        let entry = counts.entry(key.to_string()).or_insert((0, now));

        if now.duration_since(entry.1) >= self.window {
            *entry = (0, now);
        }

        if entry.0 >= self.requests_per_minute {
            return Err(AuthError::RateLimited);
        }

        entry.0 += 1;

        Ok(())
    }

    /// Get remaining requests for a key
    pub fn remaining(&self, key: &str) -> u32 {
        let counts = self.counts.read().unwrap_or_else(PoisonError::into_inner);

        match counts.get(key) {
            Some((count, started)) if started.elapsed() < self.window => {
                self.requests_per_minute.saturating_sub(*count)
            }
            _ => self.requests_per_minute,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{ApiKeyRecord, Role};

    fn authenticator() -> (Authenticator, String) {
        let validator = Arc::new(ApiKeyValidator::new());
        let (key, _) = ApiKeyValidator::generate_key();
        validator.register_key(ApiKeyRecord::new(&key, Role::Regulator));
        (Authenticator::new(validator), key)
    }

    #[test]
    fn test_header_forms() {
        let (auth, key) = authenticator();

        assert!(auth.authenticate(Some(&format!("ApiKey {key}")), None).is_ok());
        assert!(auth.authenticate(Some(&format!("Bearer {key}")), None).is_ok());
        assert!(auth.authenticate(Some(&key), None).is_ok());
        assert!(auth.authenticate(None, Some(&key)).is_ok());
    }

    #[test]
    fn test_missing_and_invalid() {
        let (auth, _) = authenticator();

        assert_eq!(auth.authenticate(None, None), Err(AuthError::MissingAuth));
        assert_eq!(
            auth.authenticate(Some("Basic dXNlcjpwYXNz"), None),
            Err(AuthError::MissingAuth)
        );
        assert_eq!(
            auth.authenticate(Some("ApiKey trx_nope"), None),
            Err(AuthError::InvalidApiKey)
        );
    }

    #[test]
    fn test_rate_limiter() {
        let limiter = RateLimiter::new(5);
        let key = "test-key";

        for _ in 0..5 {
            assert!(limiter.check(key).is_ok());
        }

        assert!(matches!(limiter.check(key), Err(AuthError::RateLimited)));
        assert!(limiter.check("other-key").is_ok());
    }

    #[test]
    fn test_remaining_requests() {
        let limiter = RateLimiter::new(10);
        let key = "test-key";

        assert_eq!(limiter.remaining(key), 10);

        limiter.check(key).unwrap();
        assert_eq!(limiter.remaining(key), 9);

        for _ in 0..4 {
            limiter.check(key).unwrap();
        }
        assert_eq!(limiter.remaining(key), 5);
    }
}
