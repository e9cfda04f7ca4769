use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use keel_events::{AggregateEventTag, Offset};

/// Offset/read-side store error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OffsetStoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("corrupt offset row: {0}")]
    Corrupt(String),
}

/// Identifies one consumer's progress in one tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OffsetKey {
    pub read_side_id: String,
    pub tag: AggregateEventTag,
}

impl OffsetKey {
    pub fn new(read_side_id: impl Into<String>, tag: AggregateEventTag) -> Self {
        Self {
            read_side_id: read_side_id.into(),
            tag,
        }
    }
}

/// Key/value offset persistence.
#[async_trait]
pub trait OffsetStore: Send + Sync {
    /// Last committed offset, or `NoOffset`.
    async fn load_offset(&self, key: &OffsetKey) -> Result<Offset, OffsetStoreError>;

    /// Insert or overwrite the committed offset.
    async fn upsert_offset(&self, key: &OffsetKey, offset: Offset) -> Result<(), OffsetStoreError>;
}

#[async_trait]
impl<S> OffsetStore for Arc<S>
where
    S: OffsetStore + ?Sized,
{
    async fn load_offset(&self, key: &OffsetKey) -> Result<Offset, OffsetStoreError> {
        (**self).load_offset(key).await
    }

    async fn upsert_offset(&self, key: &OffsetKey, offset: Offset) -> Result<(), OffsetStoreError> {
        (**self).upsert_offset(key, offset).await
    }
}

/// Handle on one (read side, tag) offset, obtained with [`OffsetDao::prepare`].
#[derive(Clone)]
pub struct OffsetDao {
    store: Arc<dyn OffsetStore>,
    key: OffsetKey,
    loaded: Offset,
}

impl std::fmt::Debug for OffsetDao {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OffsetDao")
            .field("key", &self.key)
            .field("loaded", &self.loaded)
            .finish()
    }
}

impl OffsetDao {
    /// Load the committed offset of `read_side_id` in `tag`.
    pub async fn prepare(
        store: Arc<dyn OffsetStore>,
        read_side_id: &str,
        tag: &AggregateEventTag,
    ) -> Result<Self, OffsetStoreError> {
        let key = OffsetKey::new(read_side_id, tag.clone());
        let loaded = store.load_offset(&key).await?;
        Ok(Self { store, key, loaded })
    }

    pub fn key(&self) -> &OffsetKey {
        &self.key
    }

    /// Offset committed when the handle was prepared.
    pub fn loaded_offset(&self) -> Offset {
        self.loaded
    }

    pub async fn save(&self, offset: Offset) -> Result<(), OffsetStoreError> {
        self.store.upsert_offset(&self.key, offset).await
    }
}

/// Side-effect store for read-side handlers.
///
/// A handler's writes and the offset write are staged on the same
/// transaction; `commit` makes both visible or neither.
#[async_trait]
pub trait ReadSideDb: OffsetStore + 'static {
    type Tx: Send;

    async fn begin(&self) -> Result<Self::Tx, OffsetStoreError>;

    async fn stage_offset(
        &self,
        tx: &mut Self::Tx,
        key: &OffsetKey,
        offset: Offset,
    ) -> Result<(), OffsetStoreError>;

    async fn commit(&self, tx: Self::Tx) -> Result<(), OffsetStoreError>;
}
