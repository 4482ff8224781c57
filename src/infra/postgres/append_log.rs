//! PostgreSQL-backed audit log
//!
//! Stands in for a consensus topic in single-node deployments. Entries are
//! unique per `(topic, idempotency_key)`, so a resubmission returns the
//! original sequence number.

use async_trait::async_trait;
use sqlx::postgres::PgPool;

use crate::infra::traits::{AppendLog, LogReceipt};
use crate::infra::ServiceError;

pub struct PgAppendLog {
    pool: PgPool,
}

impl PgAppendLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn existing(&self, topic: &str, idempotency_key: &str) -> Result<Option<i64>, sqlx::Error> {
        sqlx::query_scalar(
            r#"
            SELECT sequence_number
            FROM audit_log
            WHERE topic = $1 AND idempotency_key = $2
            "#,
        )
        .bind(topic)
        .bind(idempotency_key)
        .fetch_optional(&self.pool)
        .await
    }
}

fn unavailable(err: sqlx::Error) -> ServiceError {
    ServiceError::Unavailable(err.to_string())
}

#[async_trait]
impl AppendLog for PgAppendLog {
    async fn submit(
        &self,
        topic: &str,
        message: &str,
        idempotency_key: &str,
    ) -> Result<LogReceipt, ServiceError> {
        let inserted: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO audit_log (topic, idempotency_key, message)
            VALUES ($1, $2, $3)
            ON CONFLICT (topic, idempotency_key) DO NOTHING
            RETURNING sequence_number
            "#,
        )
        .bind(topic)
        .bind(idempotency_key)
        .bind(message)
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;

        let sequence_number = match inserted {
            Some(seq) => Some(seq),
            None => self
                .existing(topic, idempotency_key)
                .await
                .map_err(unavailable)?,
        };

        Ok(LogReceipt {
            acknowledged: sequence_number.is_some(),
            sequence_number: sequence_number.map(|s| s as u64),
        })
    }

    async fn lookup(
        &self,
        topic: &str,
        idempotency_key: &str,
    ) -> Result<Option<u64>, ServiceError> {
        Ok(self
            .existing(topic, idempotency_key)
            .await
            .map_err(unavailable)?
            .map(|s| s as u64))
    }
}
