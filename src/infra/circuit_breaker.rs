//! Circuit breakers for the registry, audit log and token service
//!
//! # States
//!
//! - **Closed**: Normal operation, requests pass through
//! - **Open**: Service unavailable, requests fail fast
//! - **HalfOpen**: Testing if service recovered
//!
//! Only transient failures trip a breaker. A `Rejected` answer means the
//! service is healthy and said no.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::RwLock;

use super::ServiceError;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Configuration for circuit breaker
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening
    pub failure_threshold: u32,
    /// Successes in half-open state needed to close
    pub success_threshold: u32,
    /// Initial wait before an open circuit tries half-open
    pub open_timeout: Duration,
    /// Probe requests allowed while half-open
    pub half_open_max_requests: u32,
    /// Growth of the open timeout across consecutive opens
    pub backoff_multiplier: f64,
    /// Cap on the open timeout
    pub max_backoff: Duration,
    /// Jitter factor (0.0-1.0) added to the open timeout
    pub jitter_factor: f64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: Duration::from_secs(30),
            half_open_max_requests: 2,
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_secs(300),
            jitter_factor: 0.1,
        }
    }
}

impl CircuitBreakerConfig {
    /// Tolerant thresholds and short open periods for in-process tests
    pub fn lenient() -> Self {
        Self {
            failure_threshold: 1_000,
            open_timeout: Duration::from_millis(50),
            jitter_factor: 0.0,
            ..Default::default()
        }
    }
}

/// Circuit breaker statistics
#[derive(Debug, Default)]
pub struct CircuitBreakerStats {
    pub successes: AtomicU64,
    pub failures: AtomicU64,
    /// Calls rejected while open
    pub rejected: AtomicU64,
    pub timeouts: AtomicU64,
    pub times_opened: AtomicU64,
    pub times_closed: AtomicU64,
    total_duration_ms: AtomicU64,
    calls_with_duration: AtomicU64,
}

impl CircuitBreakerStats {
    pub fn to_json(&self) -> serde_json::Value {
        let calls_with_duration = self.calls_with_duration.load(Ordering::Relaxed);
        let avg_duration_ms = if calls_with_duration > 0 {
            self.total_duration_ms.load(Ordering::Relaxed) / calls_with_duration
        } else {
            0
        };

        serde_json::json!({
            "successes": self.successes.load(Ordering::Relaxed),
            "failures": self.failures.load(Ordering::Relaxed),
            "rejected": self.rejected.load(Ordering::Relaxed),
            "timeouts": self.timeouts.load(Ordering::Relaxed),
            "times_opened": self.times_opened.load(Ordering::Relaxed),
            "times_closed": self.times_closed.load(Ordering::Relaxed),
            "avg_duration_ms": avg_duration_ms,
        })
    }

    fn record_duration(&self, duration: Duration) {
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
        self.calls_with_duration.fetch_add(1, Ordering::Relaxed);
    }
}

struct InternalState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
    half_open_requests: u32,
    consecutive_opens: u32,
    current_backoff: Duration,
}

impl InternalState {
    fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            opened_at: None,
            half_open_requests: 0,
            consecutive_opens: 0,
            current_backoff: config.open_timeout,
        }
    }
}

/// Circuit breaker protecting one external collaborator
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: RwLock<InternalState>,
    stats: CircuitBreakerStats,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, CircuitBreakerConfig::default())
    }

    pub fn with_config(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            state: RwLock::new(InternalState::new(&config)),
            config,
            stats: CircuitBreakerStats::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn state(&self) -> CircuitState {
        let mut state = self.state.write().await;
        self.maybe_transition(&mut state);
        state.state
    }

    /// Check if the circuit allows a request
    pub async fn is_allowed(&self) -> bool {
        let mut state = self.state.write().await;
        self.maybe_transition(&mut state);

        match state.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                false
            }
            CircuitState::HalfOpen => {
                if state.half_open_requests < self.config.half_open_max_requests {
                    state.half_open_requests += 1;
                    true
                } else {
                    self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                    false
                }
            }
        }
    }

    pub async fn record_success(&self) {
        self.stats.successes.fetch_add(1, Ordering::Relaxed);

        let mut state = self.state.write().await;
        match state.state {
            CircuitState::Closed => state.failure_count = 0,
            CircuitState::HalfOpen => {
                state.success_count += 1;
                if state.success_count >= self.config.success_threshold {
                    self.transition_to_closed(&mut state);
                }
            }
            CircuitState::Open => {}
        }
    }

    pub async fn record_failure(&self) {
        self.stats.failures.fetch_add(1, Ordering::Relaxed);

        let mut state = self.state.write().await;
        match state.state {
            CircuitState::Closed => {
                state.failure_count += 1;
                if state.failure_count >= self.config.failure_threshold {
                    self.transition_to_open(&mut state);
                }
            }
            CircuitState::HalfOpen => self.transition_to_open(&mut state),
            CircuitState::Open => {}
        }
    }

    /// Run `f` under the breaker with a deadline.
    ///
    /// Fails fast with [`ServiceError::CircuitOpen`] while open and maps an
    /// elapsed deadline to [`ServiceError::Timeout`].
    pub async fn call_with_timeout<F, T>(&self, f: F, timeout: Duration) -> Result<T, ServiceError>
    where
        F: std::future::Future<Output = Result<T, ServiceError>>,
    {
        if !self.is_allowed().await {
            return Err(ServiceError::CircuitOpen);
        }

        let start = Instant::now();
        match tokio::time::timeout(timeout, f).await {
            Ok(result) => {
                self.stats.record_duration(start.elapsed());
                match result {
                    Ok(value) => {
                        self.record_success().await;
                        Ok(value)
                    }
                    Err(e) => {
                        if e.is_retryable() {
                            self.record_failure().await;
                        } else {
                            self.record_success().await;
                        }
                        Err(e)
                    }
                }
            }
            Err(_) => {
                self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                self.record_failure().await;
                Err(ServiceError::Timeout(timeout))
            }
        }
    }

    pub fn stats(&self) -> &CircuitBreakerStats {
        &self.stats
    }

    pub async fn force_open(&self) {
        let mut state = self.state.write().await;
        self.transition_to_open(&mut state);
    }

    pub async fn reset(&self) {
        let mut state = self.state.write().await;
        *state = InternalState::new(&self.config);
    }

    pub async fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "state": self.state().await.to_string(),
            "stats": self.stats.to_json(),
        })
    }

    fn maybe_transition(&self, state: &mut InternalState) {
        if state.state == CircuitState::Open {
            if let Some(opened_at) = state.opened_at {
                if opened_at.elapsed() >= state.current_backoff {
                    tracing::info!(
                        circuit = %self.name,
                        consecutive_opens = state.consecutive_opens,
                        "Circuit breaker transitioning to half-open"
                    );
                    state.state = CircuitState::HalfOpen;
                    state.success_count = 0;
                    state.half_open_requests = 0;
                }
            }
        }
    }

    fn transition_to_open(&self, state: &mut InternalState) {
        state.consecutive_opens += 1;

        let exponent = state.consecutive_opens.saturating_sub(1).min(32) as i32;
        let backoff = (self.config.open_timeout.as_secs_f64()
            * self.config.backoff_multiplier.powi(exponent))
        .min(self.config.max_backoff.as_secs_f64());
        let jitter = if self.config.jitter_factor > 0.0 && backoff > 0.0 {
            rand::thread_rng().gen_range(0.0..=backoff * self.config.jitter_factor)
        } else {
            0.0
        };
        state.current_backoff = Duration::from_secs_f64(backoff + jitter);

        tracing::warn!(
            circuit = %self.name,
            failures = state.failure_count,
            consecutive_opens = state.consecutive_opens,
            backoff_ms = state.current_backoff.as_millis() as u64,
            "Circuit breaker opened"
        );

        state.state = CircuitState::Open;
        state.opened_at = Some(Instant::now());
        state.success_count = 0;
        state.half_open_requests = 0;
        self.stats.times_opened.fetch_add(1, Ordering::Relaxed);
    }

    fn transition_to_closed(&self, state: &mut InternalState) {
        tracing::info!(circuit = %self.name, "Circuit breaker closed");

        state.state = CircuitState::Closed;
        state.failure_count = 0;
        state.success_count = 0;
        state.opened_at = None;
        state.half_open_requests = 0;
        state.consecutive_opens = 0;
        state.current_backoff = self.config.open_timeout;
        self.stats.times_closed.fetch_add(1, Ordering::Relaxed);
    }
}

/// One breaker per external collaborator
#[derive(Clone)]
pub struct Breakers {
    pub registry: Arc<CircuitBreaker>,
    pub audit_log: Arc<CircuitBreaker>,
    pub token_service: Arc<CircuitBreaker>,
}

impl Breakers {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            registry: Arc::new(CircuitBreaker::with_config("registry", config.clone())),
            audit_log: Arc::new(CircuitBreaker::with_config("audit_log", config.clone())),
            token_service: Arc::new(CircuitBreaker::with_config("token_service", config)),
        }
    }

    /// Breaker state and stats keyed by collaborator name
    pub async fn status(&self) -> serde_json::Value {
        let mut status = serde_json::Map::new();
        for cb in [&self.registry, &self.audit_log, &self.token_service] {
            status.insert(cb.name().to_string(), cb.to_json().await);
        }
        serde_json::Value::Object(status)
    }
}

impl Default for Breakers {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(failure_threshold: u32) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold,
            success_threshold: 2,
            open_timeout: Duration::from_millis(20),
            jitter_factor: 0.0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_opens_on_failures() {
        let cb = CircuitBreaker::with_config("test", config(3));

        cb.record_failure().await;
        cb.record_failure().await;
        assert_eq!(cb.state().await, CircuitState::Closed);

        cb.record_failure().await;
        assert_eq!(cb.state().await, CircuitState::Open);
        assert!(!cb.is_allowed().await);
    }

    #[tokio::test]
    async fn test_half_open_then_closed() {
        let cb = CircuitBreaker::with_config("test", config(1));
        cb.record_failure().await;
        assert_eq!(cb.state().await, CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cb.state().await, CircuitState::HalfOpen);

        cb.record_success().await;
        cb.record_success().await;
        assert_eq!(cb.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_open_circuit_fails_fast() {
        let cb = CircuitBreaker::with_config("test", config(1));
        cb.force_open().await;

        let result = cb
            .call_with_timeout(async { Ok::<_, ServiceError>(1) }, Duration::from_secs(1))
            .await;
        assert_eq!(result, Err(ServiceError::CircuitOpen));
        assert_eq!(cb.stats().rejected.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_timeout_maps_to_service_error() {
        let cb = CircuitBreaker::new("test");
        let result = cb
            .call_with_timeout(
                async {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok::<_, ServiceError>(())
                },
                Duration::from_millis(10),
            )
            .await;
        assert_eq!(result, Err(ServiceError::Timeout(Duration::from_millis(10))));
        assert_eq!(cb.stats().timeouts.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_rejection_does_not_trip() {
        let cb = CircuitBreaker::with_config("test", config(1));
        let result = cb
            .call_with_timeout(
                async { Err::<(), _>(ServiceError::Rejected("bad input".into())) },
                Duration::from_secs(1),
            )
            .await;
        assert!(matches!(result, Err(ServiceError::Rejected(_))));
        assert_eq!(cb.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_breakers_status() {
        let breakers = Breakers::default();
        let status = breakers.status().await;
        assert_eq!(status["registry"]["state"], "closed");
        assert!(status.get("audit_log").is_some());
        assert!(status.get("token_service").is_some());
    }
}
