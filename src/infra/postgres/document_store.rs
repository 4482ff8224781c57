//! PostgreSQL document store
//!
//! All collections share one `documents` table keyed by
//! `(collection, key)`. Optimistic writes compare the `version` column.

use async_trait::async_trait;
use sqlx::{postgres::PgPool, FromRow};

use crate::infra::traits::{Document, DocumentStore, Precondition};
use crate::infra::StoreError;

pub struct PgDocumentStore {
    pool: PgPool,
}

impl PgDocumentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn from_url(url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(url).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn conflict(collection: &str, key: &str) -> StoreError {
        StoreError::Conflict {
            collection: collection.to_string(),
            key: key.to_string(),
        }
    }
}

#[derive(FromRow)]
struct DocumentRow {
    key: String,
    body: serde_json::Value,
    version: i64,
}

impl From<DocumentRow> for Document {
    fn from(row: DocumentRow) -> Self {
        Document {
            key: row.key,
            body: row.body,
            version: row.version as u64,
        }
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn get(&self, collection: &str, key: &str) -> Result<Option<Document>, StoreError> {
        let row = sqlx::query_as::<_, DocumentRow>(
            r#"
            SELECT key, body, version
            FROM documents
            WHERE collection = $1 AND key = $2
            "#,
        )
        .bind(collection)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Document::from))
    }

    async fn put(
        &self,
        collection: &str,
        key: &str,
        body: serde_json::Value,
        precondition: Precondition,
    ) -> Result<u64, StoreError> {
        let version: Option<i64> = match precondition {
            Precondition::Any => {
                sqlx::query_scalar(
                    r#"
                    INSERT INTO documents (collection, key, body, version, updated_at)
                    VALUES ($1, $2, $3, 1, now())
                    ON CONFLICT (collection, key) DO UPDATE
                        SET body = EXCLUDED.body,
                            version = documents.version + 1,
                            updated_at = now()
                    RETURNING version
                    "#,
                )
                .bind(collection)
                .bind(key)
                .bind(&body)
                .fetch_optional(&self.pool)
                .await?
            }
            Precondition::Absent => {
                sqlx::query_scalar(
                    r#"
                    INSERT INTO documents (collection, key, body, version, updated_at)
                    VALUES ($1, $2, $3, 1, now())
                    ON CONFLICT (collection, key) DO NOTHING
                    RETURNING version
                    "#,
                )
                .bind(collection)
                .bind(key)
                .bind(&body)
                .fetch_optional(&self.pool)
                .await?
            }
            Precondition::Version(expected) => {
                sqlx::query_scalar(
                    r#"
                    UPDATE documents
                    SET body = $3, version = version + 1, updated_at = now()
                    WHERE collection = $1 AND key = $2 AND version = $4
                    RETURNING version
                    "#,
                )
                .bind(collection)
                .bind(key)
                .bind(&body)
                .bind(expected as i64)
                .fetch_optional(&self.pool)
                .await?
            }
        };

        version
            .map(|v| v as u64)
            .ok_or_else(|| Self::conflict(collection, key))
    }

    async fn find(
        &self,
        collection: &str,
        field: &str,
        value: &str,
    ) -> Result<Vec<Document>, StoreError> {
        let rows = sqlx::query_as::<_, DocumentRow>(
            r#"
            SELECT key, body, version
            FROM documents
            WHERE collection = $1 AND body->>$2 = $3
            ORDER BY key ASC
            "#,
        )
        .bind(collection)
        .bind(field)
        .bind(value)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Document::from).collect())
    }
}
