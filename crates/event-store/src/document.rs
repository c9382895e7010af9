//! Document-store backend.
//!
//! PostgreSQL is used as a JSON document store: every event is one JSONB
//! document in the `event_documents` collection, keyed by
//! `(aggregate_id, sequence)` under a uniqueness constraint. That constraint
//! is what turns a lost race between two writers into a
//! `ConcurrencyConflict`. Snapshots live in `snapshot_documents` with the
//! same key.

use std::collections::VecDeque;

use async_trait::async_trait;
use futures_util::stream;
use serde::de::DeserializeOwned;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};

use crate::retry::with_retry;
use crate::store::{EventStore, EventStream, validate_batch, validate_snapshot};
use crate::{AggregateId, EventEnvelope, EventStoreError, Result, Sequence, Snapshot};

/// Collections used by the document event store.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS event_documents (
    aggregate_id TEXT NOT NULL,
    sequence BIGINT NOT NULL,
    event_type TEXT NOT NULL,
    document JSONB NOT NULL,
    CONSTRAINT event_documents_aggregate_sequence UNIQUE (aggregate_id, sequence)
);

CREATE TABLE IF NOT EXISTS snapshot_documents (
    aggregate_id TEXT NOT NULL,
    sequence BIGINT NOT NULL,
    document JSONB NOT NULL,
    PRIMARY KEY (aggregate_id, sequence)
);
"#;

const DEFAULT_PAGE_SIZE: i64 = 256;

/// Event store keeping events as documents in PostgreSQL.
#[derive(Clone)]
pub struct DocumentEventStore {
    pool: PgPool,
    page_size: i64,
}

impl DocumentEventStore {
    /// Creates a store over an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Connects to `url`, retrying while the database is unreachable.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = with_retry("connect", || async {
            Ok(PgPoolOptions::new().max_connections(10).connect(url).await?)
        })
        .await?;
        Ok(Self::new(pool))
    }

    /// Number of documents fetched per round trip while streaming.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1) as i64;
        self
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates the collections and their unique keys if they do not exist.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }
}

fn decode<T: DeserializeOwned>(row: &PgRow) -> Result<T> {
    let document: serde_json::Value = row.try_get("document")?;
    Ok(serde_json::from_value(document)?)
}

fn to_sequence(raw: Option<i64>) -> Option<Sequence> {
    raw.map(|s| Sequence::new(s as u64))
}

#[async_trait]
impl EventStore for DocumentEventStore {
    #[tracing::instrument(skip(self, events), fields(count = events.len()))]
    async fn append_events(
        &self,
        aggregate_id: &AggregateId,
        expected_last: Option<Sequence>,
        events: Vec<EventEnvelope>,
    ) -> Result<Sequence> {
        validate_batch(aggregate_id, expected_last, &events)?;

        let mut tx = with_retry("begin", || async { Ok(self.pool.begin().await?) }).await?;

        let actual: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(sequence) FROM event_documents WHERE aggregate_id = $1",
        )
        .bind(aggregate_id.as_str())
        .fetch_one(&mut *tx)
        .await?;
        let actual = to_sequence(actual);

        if actual != expected_last {
            metrics::counter!("event_store_conflicts_total").increment(1);
            return Err(EventStoreError::ConcurrencyConflict {
                aggregate_id: aggregate_id.clone(),
                expected: expected_last,
                actual,
            });
        }

        let mut last = Sequence::after(expected_last);
        for event in &events {
            sqlx::query(
                r#"
                INSERT INTO event_documents (aggregate_id, sequence, event_type, document)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(aggregate_id.as_str())
            .bind(event.sequence.as_i64())
            .bind(&event.event_type)
            .bind(serde_json::to_value(event)?)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                // A concurrent writer committed the same (aggregate_id, sequence) first.
                if let sqlx::Error::Database(ref db_err) = e
                    && db_err.is_unique_violation()
                {
                    metrics::counter!("event_store_conflicts_total").increment(1);
                    return EventStoreError::ConcurrencyConflict {
                        aggregate_id: aggregate_id.clone(),
                        expected: expected_last,
                        actual: Some(event.sequence),
                    };
                }
                EventStoreError::Database(e)
            })?;

            last = event.sequence;
        }

        tx.commit().await?;
        metrics::counter!("events_appended_total").increment(events.len() as u64);
        Ok(last)
    }

    async fn read_stream(
        &self,
        aggregate_id: &AggregateId,
        from: Sequence,
    ) -> Result<EventStream> {
        let last = match self.last_sequence(aggregate_id).await? {
            Some(last) if from <= last => last,
            _ => return Ok(Box::pin(stream::empty())),
        };

        let pager = Pager {
            pool: self.pool.clone(),
            aggregate_id: aggregate_id.clone(),
            next: from,
            last,
            page_size: self.page_size,
            buffer: VecDeque::new(),
        };

        let events = stream::try_unfold(pager, |mut pager| async move {
            if pager.buffer.is_empty() && pager.next <= pager.last {
                pager.fill().await?;
            }
            let next = pager.buffer.pop_front();
            Ok::<_, EventStoreError>(next.map(|event| (event, pager)))
        });

        Ok(Box::pin(events))
    }

    async fn last_sequence(&self, aggregate_id: &AggregateId) -> Result<Option<Sequence>> {
        let last: Option<i64> = with_retry("last_sequence", || async {
            Ok(sqlx::query_scalar(
                "SELECT MAX(sequence) FROM event_documents WHERE aggregate_id = $1",
            )
            .bind(aggregate_id.as_str())
            .fetch_one(&self.pool)
            .await?)
        })
        .await?;
        Ok(to_sequence(last))
    }

    #[tracing::instrument(skip(self, snapshot), fields(aggregate_id = %snapshot.aggregate_id, sequence = %snapshot.sequence))]
    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<()> {
        validate_snapshot(&snapshot, self.last_sequence(&snapshot.aggregate_id).await?)?;

        sqlx::query(
            r#"
            INSERT INTO snapshot_documents (aggregate_id, sequence, document)
            VALUES ($1, $2, $3)
            ON CONFLICT (aggregate_id, sequence) DO UPDATE SET document = EXCLUDED.document
            "#,
        )
        .bind(snapshot.aggregate_id.as_str())
        .bind(snapshot.sequence.as_i64())
        .bind(serde_json::to_value(&snapshot)?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn latest_snapshot(&self, aggregate_id: &AggregateId) -> Result<Option<Snapshot>> {
        let row = with_retry("latest_snapshot", || async {
            Ok(sqlx::query(
                r#"
                SELECT document FROM snapshot_documents
                WHERE aggregate_id = $1
                ORDER BY sequence DESC
                LIMIT 1
                "#,
            )
            .bind(aggregate_id.as_str())
            .fetch_optional(&self.pool)
            .await?)
        })
        .await?;

        row.as_ref().map(decode).transpose()
    }
}

/// Keyset pagination over one stream, bounded by the last sequence seen when
/// the read started.
struct Pager {
    pool: PgPool,
    aggregate_id: AggregateId,
    next: Sequence,
    last: Sequence,
    page_size: i64,
    buffer: VecDeque<EventEnvelope>,
}

impl Pager {
    async fn fill(&mut self) -> Result<()> {
        let (pool, aggregate_id) = (&self.pool, &self.aggregate_id);
        let (next, last, page_size) = (self.next.as_i64(), self.last.as_i64(), self.page_size);

        let rows = with_retry("read_stream", || async move {
            Ok(sqlx::query(
                r#"
                SELECT document FROM event_documents
                WHERE aggregate_id = $1 AND sequence >= $2 AND sequence <= $3
                ORDER BY sequence ASC
                LIMIT $4
                "#,
            )
            .bind(aggregate_id.as_str())
            .bind(next)
            .bind(last)
            .bind(page_size)
            .fetch_all(pool)
            .await?)
        })
        .await?;

        if rows.is_empty() {
            return Err(EventStoreError::Corrupted {
                location: format!("event_documents/{}", self.aggregate_id),
                reason: format!("sequence {} missing", self.next),
            });
        }

        for row in &rows {
            let event: EventEnvelope = decode(row)?;
            if event.sequence != self.next {
                return Err(EventStoreError::Corrupted {
                    location: format!("event_documents/{}", self.aggregate_id),
                    reason: format!("expected sequence {}, found {}", self.next, event.sequence),
                });
            }
            self.next = self.next.next();
            self.buffer.push_back(event);
        }

        Ok(())
    }
}
