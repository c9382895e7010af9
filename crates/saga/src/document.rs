//! Document-store saga repository.
//!
//! Instances are JSONB documents in `saga_documents`, keyed by saga id. Their
//! associations are mirrored into `saga_associations`, whose unique index on
//! `(saga_type, assoc_key, assoc_value)` serves `find` and rejects ambiguous
//! routing at write time.

use std::collections::HashSet;
use std::future::Future;

use async_trait::async_trait;
use backon::Retryable;
use common::SagaId;
use event_store::retry::storage_backoff;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

use crate::instance::{Association, SagaInstance};
use crate::repository::{SagaRepository, check_revision};
use crate::{Result, SagaError};

/// Collections used by the document saga repository.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS saga_documents (
    saga_id UUID PRIMARY KEY,
    saga_type TEXT NOT NULL,
    revision BIGINT NOT NULL,
    document JSONB NOT NULL
);

CREATE TABLE IF NOT EXISTS saga_associations (
    saga_id UUID NOT NULL REFERENCES saga_documents (saga_id) ON DELETE CASCADE,
    saga_type TEXT NOT NULL,
    assoc_key TEXT NOT NULL,
    assoc_value TEXT NOT NULL,
    CONSTRAINT saga_associations_unique UNIQUE (saga_type, assoc_key, assoc_value)
);

CREATE INDEX IF NOT EXISTS saga_associations_saga_id ON saga_associations (saga_id);
"#;

const ASSOCIATION_CONSTRAINT: &str = "saga_associations_unique";

async fn with_retry<T, F, Fut>(operation: &'static str, op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    op.retry(storage_backoff())
        .when(SagaError::is_transient)
        .notify(|err, delay| {
            tracing::warn!(operation, error = %err, ?delay, "transient saga storage failure, retrying");
        })
        .await
}

/// Saga repository keeping instances as documents in PostgreSQL.
#[derive(Clone)]
pub struct DocumentSagaRepository {
    pool: PgPool,
}

impl DocumentSagaRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects to `url`, retrying while the database is unreachable.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = with_retry("connect", || async {
            Ok(PgPoolOptions::new().max_connections(10).connect(url).await?)
        })
        .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates the collections and the association index if they do not exist.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }
}

fn write_error(
    instance: &SagaInstance,
    association: Option<&Association>,
    err: sqlx::Error,
) -> SagaError {
    if let sqlx::Error::Database(ref db_err) = err
        && db_err.is_unique_violation()
    {
        return match (db_err.constraint(), association) {
            (Some(ASSOCIATION_CONSTRAINT), Some(association)) => SagaError::CorrelationConflict {
                saga_type: instance.saga_type.clone(),
                key: association.key.clone(),
                value: association.value.clone(),
            },
            // Another writer inserted the same new saga id first.
            _ => SagaError::ConcurrentModification {
                saga_id: instance.saga_id,
                expected: instance.revision,
                actual: Some(instance.revision + 1),
            },
        };
    }
    SagaError::Database(err)
}

#[async_trait]
impl SagaRepository for DocumentSagaRepository {
    async fn find(&self, saga_type: &str, key: &str, value: &str) -> Result<HashSet<SagaId>> {
        let ids: Vec<Uuid> = with_retry("find", || async {
            Ok(sqlx::query_scalar(
                r#"
                SELECT saga_id FROM saga_associations
                WHERE saga_type = $1 AND assoc_key = $2 AND assoc_value = $3
                "#,
            )
            .bind(saga_type)
            .bind(key)
            .bind(value)
            .fetch_all(&self.pool)
            .await?)
        })
        .await?;

        Ok(ids.into_iter().map(SagaId::from_uuid).collect())
    }

    async fn load(&self, saga_id: SagaId) -> Result<Option<SagaInstance>> {
        let document: Option<serde_json::Value> = with_retry("load", || async {
            Ok(
                sqlx::query_scalar("SELECT document FROM saga_documents WHERE saga_id = $1")
                    .bind(saga_id.as_uuid())
                    .fetch_optional(&self.pool)
                    .await?,
            )
        })
        .await?;

        Ok(document
            .map(serde_json::from_value::<SagaInstance>)
            .transpose()?)
    }

    #[tracing::instrument(skip(self, instance), fields(saga_id = %instance.saga_id, saga_type = %instance.saga_type))]
    async fn save(&self, instance: &mut SagaInstance) -> Result<()> {
        let mut tx = with_retry("begin", || async { Ok(self.pool.begin().await?) }).await?;
        let saga_id = instance.saga_id.as_uuid();

        let stored: Option<i64> =
            sqlx::query_scalar("SELECT revision FROM saga_documents WHERE saga_id = $1 FOR UPDATE")
                .bind(saga_id)
                .fetch_optional(&mut *tx)
                .await?;
        check_revision(instance, stored.map(|r| r as u64))?;

        if !instance.is_active() {
            sqlx::query("DELETE FROM saga_documents WHERE saga_id = $1")
                .bind(saga_id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            return Ok(());
        }

        let mut next = instance.clone();
        next.revision += 1;
        let document = serde_json::to_value(&next)?;

        let written = if stored.is_some() {
            sqlx::query("UPDATE saga_documents SET revision = $2, document = $3 WHERE saga_id = $1")
                .bind(saga_id)
                .bind(next.revision as i64)
                .bind(&document)
                .execute(&mut *tx)
                .await
        } else {
            sqlx::query(
                r#"
                INSERT INTO saga_documents (saga_id, saga_type, revision, document)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(saga_id)
            .bind(&next.saga_type)
            .bind(next.revision as i64)
            .bind(&document)
            .execute(&mut *tx)
            .await
        };
        written.map_err(|e| write_error(instance, None, e))?;

        sqlx::query("DELETE FROM saga_associations WHERE saga_id = $1")
            .bind(saga_id)
            .execute(&mut *tx)
            .await?;

        for association in &next.associations {
            sqlx::query(
                r#"
                INSERT INTO saga_associations (saga_id, saga_type, assoc_key, assoc_value)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(saga_id)
            .bind(&next.saga_type)
            .bind(&association.key)
            .bind(&association.value)
            .execute(&mut *tx)
            .await
            .map_err(|e| write_error(instance, Some(association), e))?;
        }

        tx.commit().await?;
        *instance = next;
        Ok(())
    }

    async fn delete(&self, saga_id: SagaId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM saga_documents WHERE saga_id = $1")
            .bind(saga_id.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
