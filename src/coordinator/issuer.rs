//! Token issuer
//!
//! Idempotent wrapper around the minting service: the service is asked for
//! an existing token before every mint, so a retried or replayed upload
//! never produces a second token for the same batch.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::domain::{validate_batch_id, TokenId};
use crate::infra::{
    CircuitBreaker, CoordinatorError, Result, Retry, RetryConfig, Service, ServiceError,
    TokenService,
};
use crate::metrics::{metric_names, MetricsRegistry};

#[derive(Debug, Clone)]
pub struct IssuerConfig {
    /// Deadline for one token service call
    pub timeout: Duration,
    pub retry: RetryConfig,
}

impl Default for IssuerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            retry: RetryConfig::token_service(),
        }
    }
}

#[derive(Clone)]
pub struct TokenIssuer {
    config: Arc<IssuerConfig>,
    tokens: Arc<dyn TokenService>,
    breaker: Arc<CircuitBreaker>,
    metrics: Arc<MetricsRegistry>,
}

impl TokenIssuer {
    pub fn new(
        config: IssuerConfig,
        tokens: Arc<dyn TokenService>,
        breaker: Arc<CircuitBreaker>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            tokens,
            breaker,
            metrics,
        }
    }

    /// Token for `batch_id`, minting one if the service has none.
    pub async fn mint(&self, drug_name: &str, batch_id: &str) -> Result<TokenId> {
        validate_batch_id(batch_id).map_err(|message| CoordinatorError::Validation {
            field: Some("batchId"),
            message,
        })?;
        if drug_name.trim().is_empty() {
            return Err(CoordinatorError::Validation {
                field: Some("drugName"),
                message: "drugName is required".to_string(),
            });
        }

        let retry = Retry::new(self.config.retry.clone());
        retry
            .run_with_predicate(
                "token_service.mint",
                || self.mint_once(drug_name, batch_id),
                |e: &ServiceError| e.is_retryable(),
            )
            .await
            .into_result()
            .map_err(|e| CoordinatorError::external(Service::TokenService, e))
    }

    async fn mint_once(
        &self,
        drug_name: &str,
        batch_id: &str,
    ) -> std::result::Result<TokenId, ServiceError> {
        let existing = self
            .breaker
            .call_with_timeout(self.tokens.token_for_batch(batch_id), self.config.timeout)
            .await?;
        if let Some(token_id) = existing {
            self.metrics.inc_counter(metric_names::TOKENS_REUSED).await;
            debug!(batch_id = batch_id, token_id = %token_id, "Reusing existing token");
            return Ok(token_id);
        }

        let token_id = self
            .breaker
            .call_with_timeout(self.tokens.mint(drug_name, batch_id), self.config.timeout)
            .await?;
        self.metrics.inc_counter(metric_names::TOKENS_MINTED).await;
        info!(batch_id = batch_id, token_id = %token_id, "Token minted");
        Ok(token_id)
    }
}
