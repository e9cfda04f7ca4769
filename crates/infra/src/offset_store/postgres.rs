//! Postgres-backed offset store and read-side database.
//!
//! Offsets live in `read_side_offsets`, one row per (read side, tag). Either
//! offset column is set depending on the offset kind; both `NULL` means
//! nothing has been consumed.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use keel_events::Offset;

use super::r#trait::{OffsetKey, OffsetStore, OffsetStoreError, ReadSideDb};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS read_side_offsets (
        read_side_id TEXT NOT NULL,
        tag TEXT NOT NULL,
        sequence_offset BIGINT NULL,
        time_uuid_offset UUID NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (read_side_id, tag)
    )
"#;

const UPSERT: &str = r#"
    INSERT INTO read_side_offsets (read_side_id, tag, sequence_offset, time_uuid_offset)
    VALUES ($1, $2, $3, $4)
    ON CONFLICT (read_side_id, tag)
    DO UPDATE SET
        sequence_offset = EXCLUDED.sequence_offset,
        time_uuid_offset = EXCLUDED.time_uuid_offset,
        updated_at = NOW()
"#;

/// Postgres-backed offset store.
///
/// As a [`ReadSideDb`], handlers receive the open `sqlx` transaction and run
/// their own statements on it; the offset upsert is staged on the same
/// transaction.
#[derive(Debug, Clone)]
pub struct PostgresOffsetStore {
    pool: Arc<PgPool>,
}

impl PostgresOffsetStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn create_schema(&self) -> Result<(), OffsetStoreError> {
        sqlx::query(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("create_schema", e))?;
        Ok(())
    }
}

#[async_trait]
impl OffsetStore for PostgresOffsetStore {
    #[instrument(skip(self, key), fields(read_side_id = %key.read_side_id, tag = %key.tag), err)]
    async fn load_offset(&self, key: &OffsetKey) -> Result<Offset, OffsetStoreError> {
        let row = sqlx::query(
            r#"
            SELECT sequence_offset, time_uuid_offset
            FROM read_side_offsets
            WHERE read_side_id = $1 AND tag = $2
            "#,
        )
        .bind(&key.read_side_id)
        .bind(key.tag.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_offset", e))?;

        let Some(row) = row else {
            return Ok(Offset::NoOffset);
        };
        let sequence: Option<i64> = row
            .try_get("sequence_offset")
            .map_err(|e| OffsetStoreError::Corrupt(e.to_string()))?;
        let time_uuid: Option<uuid::Uuid> = row
            .try_get("time_uuid_offset")
            .map_err(|e| OffsetStoreError::Corrupt(e.to_string()))?;
        Ok(Offset::from_columns(sequence, time_uuid))
    }

    #[instrument(skip(self, key), fields(read_side_id = %key.read_side_id, tag = %key.tag, offset = %offset), err)]
    async fn upsert_offset(&self, key: &OffsetKey, offset: Offset) -> Result<(), OffsetStoreError> {
        let (sequence, time_uuid) = offset.to_columns();
        sqlx::query(UPSERT)
            .bind(&key.read_side_id)
            .bind(key.tag.as_str())
            .bind(sequence)
            .bind(time_uuid)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("upsert_offset", e))?;
        Ok(())
    }
}

#[async_trait]
impl ReadSideDb for PostgresOffsetStore {
    type Tx = Transaction<'static, Postgres>;

    async fn begin(&self) -> Result<Self::Tx, OffsetStoreError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))
    }

    async fn stage_offset(
        &self,
        tx: &mut Self::Tx,
        key: &OffsetKey,
        offset: Offset,
    ) -> Result<(), OffsetStoreError> {
        let (sequence, time_uuid) = offset.to_columns();
        sqlx::query(UPSERT)
            .bind(&key.read_side_id)
            .bind(key.tag.as_str())
            .bind(sequence)
            .bind(time_uuid)
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("stage_offset", e))?;
        Ok(())
    }

    async fn commit(&self, tx: Self::Tx) -> Result<(), OffsetStoreError> {
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }
}

/// Map SQLx errors to OffsetStoreError.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> OffsetStoreError {
    match &err {
        sqlx::Error::Database(db_err) => match db_err.code().as_deref() {
            // duplicate_table, duplicate_object, unique_violation
            Some("42P07") | Some("42710") | Some("23505") => {
                OffsetStoreError::AlreadyExists(format!("{operation}: {}", db_err.message()))
            }
            _ => OffsetStoreError::Unavailable(format!("database error in {operation}: {}", db_err.message())),
        },
        _ => OffsetStoreError::Unavailable(format!("sqlx error in {operation}: {err}")),
    }
}

/// Live-database tests; they return early when `DATABASE_URL` is unset.
#[cfg(test)]
mod tests {
    use super::*;
    use keel_events::AggregateEventTag;
    use sqlx::postgres::PgPoolOptions;
    use tokio::sync::OnceCell;
    use uuid::Uuid;

    // Concurrent CREATE TABLE IF NOT EXISTS can still collide in pg_type.
    static SCHEMA_READY: OnceCell<()> = OnceCell::const_new();

    async fn store() -> Option<PostgresOffsetStore> {
        let url = std::env::var("DATABASE_URL").ok()?;
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(&url)
            .await
            .unwrap();
        let store = PostgresOffsetStore::new(pool);
        SCHEMA_READY
            .get_or_init(|| async {
                store.create_schema().await.unwrap();
                sqlx::query(
                    "CREATE TABLE IF NOT EXISTS offset_store_rows (read_side_id TEXT NOT NULL, n BIGINT NOT NULL)",
                )
                .execute(store.pool())
                .await
                .unwrap();
            })
            .await;
        Some(store)
    }

    fn key() -> OffsetKey {
        OffsetKey::new(
            format!("read-side-{}", Uuid::new_v4().simple()),
            AggregateEventTag::new("CartEvent0"),
        )
    }

    async fn rows(store: &PostgresOffsetStore, key: &OffsetKey) -> i64 {
        sqlx::query("SELECT COUNT(*) AS n FROM offset_store_rows WHERE read_side_id = $1")
            .bind(&key.read_side_id)
            .fetch_one(store.pool())
            .await
            .unwrap()
            .get("n")
    }

    async fn write_row(tx: &mut Transaction<'static, Postgres>, key: &OffsetKey, n: i64) {
        sqlx::query("INSERT INTO offset_store_rows (read_side_id, n) VALUES ($1, $2)")
            .bind(&key.read_side_id)
            .bind(n)
            .execute(&mut **tx)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn upsert_overwrites_and_keeps_the_offset_kind() {
        let Some(store) = store().await else { return };
        let key = key();

        assert_eq!(store.load_offset(&key).await.unwrap(), Offset::NoOffset);
        store.upsert_offset(&key, Offset::Sequence(3)).await.unwrap();
        store.upsert_offset(&key, Offset::Sequence(9)).await.unwrap();
        assert_eq!(store.load_offset(&key).await.unwrap(), Offset::Sequence(9));

        let time = Offset::TimeBasedUuid(Uuid::now_v7());
        store.upsert_offset(&key, time).await.unwrap();
        assert_eq!(store.load_offset(&key).await.unwrap(), time);
    }

    #[tokio::test]
    async fn staged_offset_rolls_back_with_the_handler_rows() {
        let Some(store) = store().await else { return };
        let key = key();
        store.upsert_offset(&key, Offset::Sequence(1)).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        write_row(&mut tx, &key, 2).await;
        store.stage_offset(&mut tx, &key, Offset::Sequence(2)).await.unwrap();
        tx.rollback().await.unwrap();

        assert_eq!(store.load_offset(&key).await.unwrap(), Offset::Sequence(1));
        assert_eq!(rows(&store, &key).await, 0);
    }

    #[tokio::test]
    async fn dropped_transaction_commits_neither_offset_nor_rows() {
        let Some(store) = store().await else { return };
        let key = key();

        {
            let mut tx = store.begin().await.unwrap();
            write_row(&mut tx, &key, 1).await;
            store.stage_offset(&mut tx, &key, Offset::Sequence(1)).await.unwrap();
        }

        assert_eq!(store.load_offset(&key).await.unwrap(), Offset::NoOffset);
        assert_eq!(rows(&store, &key).await, 0);
    }

    #[tokio::test]
    async fn committed_offset_lands_with_the_handler_rows() {
        let Some(store) = store().await else { return };
        let key = key();

        let mut tx = store.begin().await.unwrap();
        write_row(&mut tx, &key, 1).await;
        store.stage_offset(&mut tx, &key, Offset::Sequence(1)).await.unwrap();
        store.commit(tx).await.unwrap();

        assert_eq!(store.load_offset(&key).await.unwrap(), Offset::Sequence(1));
        assert_eq!(rows(&store, &key).await, 1);
    }
}
