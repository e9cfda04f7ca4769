//! Postgres-backed event log.
//!
//! Schema (see [`PostgresEventLog::create_schema`]):
//!
//! - `journal`: one row per event. `ordering` is a `BIGSERIAL` and doubles as
//!   the event's `Sequence` offset inside its tag. Per-tag offsets therefore
//!   increase strictly but are not dense.
//!
//! A sequence value is drawn at insert time, not at commit, so two appends to
//! the same tag could otherwise become visible out of `ordering` order and a
//! reader resuming after the higher one would never see the lower. `append`
//! takes a transaction-scoped advisory lock per tag before inserting: appends
//! sharing a tag commit one after another, in the order their values were
//! drawn.
//! - `snapshots`: latest snapshot per stream, upserted.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | EventLogError |
//! |------------|----------------------|---------------|
//! | Database (unique violation) | `23505` | `Concurrency` |
//! | Database (other) | Any other | `InvalidAppend` |
//! | PoolClosed / Io / Tls / timeouts | N/A | `Unavailable` |

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{Span, instrument};

use keel_core::{EntityId, EventId, ExpectedVersion};
use keel_events::{AggregateEventTag, Offset};

use super::r#trait::{EventLog, EventLogError, Snapshot, StoredEvent, UncommittedEvent, single_stream};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS journal (
        ordering BIGSERIAL PRIMARY KEY,
        event_id UUID NOT NULL UNIQUE,
        entity_type TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        sequence_nr BIGINT NOT NULL CHECK (sequence_nr > 0),
        tag TEXT NOT NULL,
        event_type TEXT NOT NULL,
        event_version INT NOT NULL,
        occurred_at TIMESTAMPTZ NOT NULL,
        payload JSONB NOT NULL,
        UNIQUE (entity_type, entity_id, sequence_nr)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS journal_tag_ordering ON journal (tag, ordering)",
    r#"
    CREATE TABLE IF NOT EXISTS snapshots (
        entity_type TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        sequence_nr BIGINT NOT NULL,
        state JSONB NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (entity_type, entity_id)
    )
    "#,
];

/// Postgres-backed append-only event log.
///
/// `append` runs in one transaction: it reads the stream's current sequence
/// number, checks it against the expectation and inserts the batch. A
/// concurrent writer that slips in between trips the unique constraint on
/// `(entity_type, entity_id, sequence_nr)` and surfaces as `Concurrency`.
#[derive(Debug, Clone)]
pub struct PostgresEventLog {
    pool: Arc<PgPool>,
}

impl PostgresEventLog {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the journal and snapshot tables if they do not exist.
    pub async fn create_schema(&self) -> Result<(), EventLogError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("create_schema", e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl EventLog for PostgresEventLog {
    #[instrument(
        skip(self, events),
        fields(event_count = events.len(), expected = ?expected, entity_id),
        err
    )]
    async fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventLogError> {
        if events.is_empty() {
            return Ok(vec![]);
        }
        let (entity_type, entity_id) = {
            let (t, id) = single_stream(&events)?;
            (t.to_string(), id.clone())
        };
        Span::current().record("entity_id", entity_id.as_str());

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let current = current_sequence_nr(&mut tx, &entity_type, &entity_id).await?;
        if !expected.matches(current) {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(EventLogError::Concurrency(format!(
                "expected {expected:?}, found {current}"
            )));
        }

        lock_tags(&mut tx, &events).await?;

        let mut stored_events = Vec::with_capacity(events.len());
        let mut next = current + 1;
        for event in events {
            let row = sqlx::query(
                r#"
                INSERT INTO journal (
                    event_id,
                    entity_type,
                    entity_id,
                    sequence_nr,
                    tag,
                    event_type,
                    event_version,
                    occurred_at,
                    payload
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                RETURNING ordering
                "#,
            )
            .bind(*event.event_id.as_uuid())
            .bind(&event.entity_type)
            .bind(event.entity_id.as_str())
            .bind(next as i64)
            .bind(event.tag.as_str())
            .bind(&event.event_type)
            .bind(event.event_version as i32)
            .bind(event.occurred_at)
            .bind(&event.payload)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    EventLogError::Concurrency(format!(
                        "concurrent append detected: sequence_nr {next} already exists"
                    ))
                } else {
                    map_sqlx_error("insert_event", e)
                }
            })?;

            let ordering: i64 = row
                .try_get("ordering")
                .map_err(|e| map_sqlx_error("insert_event", e))?;

            stored_events.push(StoredEvent {
                event_id: event.event_id,
                entity_type: event.entity_type,
                entity_id: event.entity_id,
                sequence_nr: next,
                tag: event.tag,
                offset: Offset::Sequence(ordering),
                event_type: event.event_type,
                event_version: event.event_version,
                occurred_at: event.occurred_at,
                payload: event.payload,
            });
            next += 1;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Ok(stored_events)
    }

    #[instrument(skip(self, entity_id), fields(entity_id = %entity_id), err)]
    async fn load(
        &self,
        entity_type: &str,
        entity_id: &EntityId,
        after_sequence_nr: u64,
    ) -> Result<Vec<StoredEvent>, EventLogError> {
        let rows = sqlx::query(
            r#"
            SELECT ordering, event_id, entity_type, entity_id, sequence_nr, tag,
                   event_type, event_version, occurred_at, payload
            FROM journal
            WHERE entity_type = $1 AND entity_id = $2 AND sequence_nr > $3
            ORDER BY sequence_nr ASC
            "#,
        )
        .bind(entity_type)
        .bind(entity_id.as_str())
        .bind(after_sequence_nr as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load", e))?;

        rows.iter().map(stored_event_from_row).collect()
    }

    #[instrument(skip(self, tag, after), fields(tag = %tag, after = %after), err)]
    async fn events_by_tag(
        &self,
        tag: &AggregateEventTag,
        after: Offset,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, EventLogError> {
        let after = match after {
            Offset::NoOffset => 0,
            Offset::Sequence(n) => n,
            Offset::TimeBasedUuid(_) => {
                return Err(EventLogError::InvalidAppend(format!(
                    "journal tags are sequence-ordered, got {after}"
                )));
            }
        };

        let rows = sqlx::query(
            r#"
            SELECT ordering, event_id, entity_type, entity_id, sequence_nr, tag,
                   event_type, event_version, occurred_at, payload
            FROM journal
            WHERE tag = $1 AND ordering > $2
            ORDER BY ordering ASC
            LIMIT $3
            "#,
        )
        .bind(tag.as_str())
        .bind(after)
        .bind(limit.min(i64::MAX as usize) as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("events_by_tag", e))?;

        rows.iter().map(stored_event_from_row).collect()
    }

    #[instrument(
        skip(self, snapshot),
        fields(entity_id = %snapshot.entity_id, sequence_nr = snapshot.sequence_nr),
        err
    )]
    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<(), EventLogError> {
        sqlx::query(
            r#"
            INSERT INTO snapshots (entity_type, entity_id, sequence_nr, state, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (entity_type, entity_id)
            DO UPDATE SET
                sequence_nr = EXCLUDED.sequence_nr,
                state = EXCLUDED.state,
                created_at = EXCLUDED.created_at
            WHERE snapshots.sequence_nr <= EXCLUDED.sequence_nr
            "#,
        )
        .bind(&snapshot.entity_type)
        .bind(snapshot.entity_id.as_str())
        .bind(snapshot.sequence_nr as i64)
        .bind(&snapshot.state)
        .bind(snapshot.created_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("save_snapshot", e))?;

        Ok(())
    }

    #[instrument(skip(self, entity_id), fields(entity_id = %entity_id, snapshot_found), err)]
    async fn load_snapshot(
        &self,
        entity_type: &str,
        entity_id: &EntityId,
    ) -> Result<Option<Snapshot>, EventLogError> {
        let row = sqlx::query(
            r#"
            SELECT entity_type, entity_id, sequence_nr, state, created_at
            FROM snapshots
            WHERE entity_type = $1 AND entity_id = $2
            "#,
        )
        .bind(entity_type)
        .bind(entity_id.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_snapshot", e))?;

        Span::current().record("snapshot_found", row.is_some());
        row.as_ref().map(snapshot_from_row).transpose()
    }
}

async fn current_sequence_nr(
    tx: &mut Transaction<'_, Postgres>,
    entity_type: &str,
    entity_id: &EntityId,
) -> Result<u64, EventLogError> {
    let row = sqlx::query(
        r#"
        SELECT COALESCE(MAX(sequence_nr), 0) AS current
        FROM journal
        WHERE entity_type = $1 AND entity_id = $2
        "#,
    )
    .bind(entity_type)
    .bind(entity_id.as_str())
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("current_sequence_nr", e))?;

    let current: i64 = row
        .try_get("current")
        .map_err(|e| map_sqlx_error("current_sequence_nr", e))?;
    Ok(current.max(0) as u64)
}

/// Serialize appends per tag until `tx` ends. Tags are locked in sorted order
/// so two multi-tag batches cannot deadlock.
async fn lock_tags(
    tx: &mut Transaction<'_, Postgres>,
    events: &[UncommittedEvent],
) -> Result<(), EventLogError> {
    let tags: BTreeSet<&str> = events.iter().map(|e| e.tag.as_str()).collect();
    for tag in tags {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(tag)
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("lock_tag", e))?;
    }
    Ok(())
}

fn stored_event_from_row(row: &sqlx::postgres::PgRow) -> Result<StoredEvent, EventLogError> {
    let read = |e: sqlx::Error| EventLogError::InvalidAppend(format!("failed to decode journal row: {e}"));

    let entity_id: String = row.try_get("entity_id").map_err(read)?;
    let entity_id = EntityId::new(entity_id)
        .map_err(|e| EventLogError::InvalidAppend(format!("journal row: {e}")))?;
    let tag: String = row.try_get("tag").map_err(read)?;
    let sequence_nr: i64 = row.try_get("sequence_nr").map_err(read)?;
    let ordering: i64 = row.try_get("ordering").map_err(read)?;
    let event_version: i32 = row.try_get("event_version").map_err(read)?;
    let occurred_at: DateTime<Utc> = row.try_get("occurred_at").map_err(read)?;

    Ok(StoredEvent {
        event_id: EventId::from_uuid(row.try_get("event_id").map_err(read)?),
        entity_type: row.try_get("entity_type").map_err(read)?,
        entity_id,
        sequence_nr: sequence_nr as u64,
        tag: AggregateEventTag::new(tag),
        offset: Offset::Sequence(ordering),
        event_type: row.try_get("event_type").map_err(read)?,
        event_version: event_version as u32,
        occurred_at,
        payload: row.try_get("payload").map_err(read)?,
    })
}

fn snapshot_from_row(row: &sqlx::postgres::PgRow) -> Result<Snapshot, EventLogError> {
    let read = |e: sqlx::Error| EventLogError::InvalidAppend(format!("failed to decode snapshot row: {e}"));

    let entity_id: String = row.try_get("entity_id").map_err(read)?;
    let sequence_nr: i64 = row.try_get("sequence_nr").map_err(read)?;
    Ok(Snapshot {
        entity_type: row.try_get("entity_type").map_err(read)?,
        entity_id: EntityId::new(entity_id)
            .map_err(|e| EventLogError::InvalidAppend(format!("snapshot row: {e}")))?,
        sequence_nr: sequence_nr as u64,
        state: row.try_get("state").map_err(read)?,
        created_at: row.try_get("created_at").map_err(read)?,
    })
}

/// Map SQLx errors to EventLogError.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> EventLogError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => EventLogError::Concurrency(msg),
                _ => EventLogError::InvalidAppend(msg),
            }
        }
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::Tls(_) => {
            EventLogError::Unavailable(format!("{operation}: {err}"))
        }
        _ => EventLogError::InvalidAppend(format!("sqlx error in {operation}: {err}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        return db_err.code().as_deref() == Some("23505");
    }
    false
}
