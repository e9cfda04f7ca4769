use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use keel_events::Offset;

use super::r#trait::{OffsetKey, OffsetStore, OffsetStoreError, ReadSideDb};

type Table = BTreeMap<String, JsonValue>;

#[derive(Debug, Default)]
struct Tables {
    rows: HashMap<String, Table>,
    offsets: HashMap<OffsetKey, Offset>,
}

/// In-memory read-side database: named tables of JSON rows plus offsets.
///
/// Intended for tests/dev. `set_unavailable(true)` makes every operation
/// fail until switched back, to exercise restart paths.
#[derive(Debug, Clone, Default)]
pub struct InMemoryReadSide {
    tables: Arc<RwLock<Tables>>,
    unavailable: Arc<AtomicBool>,
}

enum Write {
    Upsert {
        table: String,
        key: String,
        value: JsonValue,
    },
    Delete {
        table: String,
        key: String,
    },
}

/// Staged writes; nothing is visible to readers until committed.
pub struct InMemoryTx {
    tables: Arc<RwLock<Tables>>,
    writes: Vec<Write>,
    offsets: Vec<(OffsetKey, Offset)>,
}

impl InMemoryReadSide {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), OffsetStoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(OffsetStoreError::Unavailable("read side switched off".to_string()));
        }
        Ok(())
    }

    /// Create an empty table; fails with `AlreadyExists` if present.
    pub fn create_table(&self, table: &str) -> Result<(), OffsetStoreError> {
        self.check_available()?;
        let mut tables = self.tables.write().map_err(|_| poisoned())?;
        if tables.rows.contains_key(table) {
            return Err(OffsetStoreError::AlreadyExists(format!("table '{table}'")));
        }
        tables.rows.insert(table.to_string(), Table::new());
        Ok(())
    }

    pub fn has_table(&self, table: &str) -> bool {
        self.tables
            .read()
            .map(|t| t.rows.contains_key(table))
            .unwrap_or(false)
    }

    /// Committed row, if any.
    pub fn get(&self, table: &str, key: &str) -> Option<JsonValue> {
        self.tables
            .read()
            .ok()?
            .rows
            .get(table)?
            .get(key)
            .cloned()
    }

    /// Committed rows of `table`, ordered by key.
    pub fn rows(&self, table: &str) -> Vec<(String, JsonValue)> {
        self.tables
            .read()
            .ok()
            .and_then(|t| {
                t.rows
                    .get(table)
                    .map(|rows| rows.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            })
            .unwrap_or_default()
    }

    /// Committed offset of `key`, if any.
    pub fn offset(&self, key: &OffsetKey) -> Option<Offset> {
        self.tables.read().ok()?.offsets.get(key).copied()
    }
}

impl InMemoryTx {
    /// Row as this transaction sees it: staged writes win over committed rows.
    pub fn get(&self, table: &str, key: &str) -> Result<Option<JsonValue>, OffsetStoreError> {
        for write in self.writes.iter().rev() {
            match write {
                Write::Upsert { table: t, key: k, value } if t == table && k == key => {
                    return Ok(Some(value.clone()));
                }
                Write::Delete { table: t, key: k } if t == table && k == key => return Ok(None),
                _ => {}
            }
        }
        let tables = self.tables.read().map_err(|_| poisoned())?;
        let Some(rows) = tables.rows.get(table) else {
            return Err(OffsetStoreError::Unavailable(format!("no table '{table}'")));
        };
        Ok(rows.get(key).cloned())
    }

    pub fn upsert(&mut self, table: &str, key: &str, value: JsonValue) {
        self.writes.push(Write::Upsert {
            table: table.to_string(),
            key: key.to_string(),
            value,
        });
    }

    pub fn delete(&mut self, table: &str, key: &str) {
        self.writes.push(Write::Delete {
            table: table.to_string(),
            key: key.to_string(),
        });
    }
}

fn poisoned() -> OffsetStoreError {
    OffsetStoreError::Unavailable("lock poisoned".to_string())
}

#[async_trait]
impl OffsetStore for InMemoryReadSide {
    async fn load_offset(&self, key: &OffsetKey) -> Result<Offset, OffsetStoreError> {
        self.check_available()?;
        let tables = self.tables.read().map_err(|_| poisoned())?;
        Ok(tables.offsets.get(key).copied().unwrap_or_default())
    }

    async fn upsert_offset(&self, key: &OffsetKey, offset: Offset) -> Result<(), OffsetStoreError> {
        self.check_available()?;
        let mut tables = self.tables.write().map_err(|_| poisoned())?;
        tables.offsets.insert(key.clone(), offset);
        Ok(())
    }
}

#[async_trait]
impl ReadSideDb for InMemoryReadSide {
    type Tx = InMemoryTx;

    async fn begin(&self) -> Result<InMemoryTx, OffsetStoreError> {
        self.check_available()?;
        Ok(InMemoryTx {
            tables: self.tables.clone(),
            writes: Vec::new(),
            offsets: Vec::new(),
        })
    }

    async fn stage_offset(
        &self,
        tx: &mut InMemoryTx,
        key: &OffsetKey,
        offset: Offset,
    ) -> Result<(), OffsetStoreError> {
        tx.offsets.push((key.clone(), offset));
        Ok(())
    }

    async fn commit(&self, tx: InMemoryTx) -> Result<(), OffsetStoreError> {
        self.check_available()?;
        let mut tables = self.tables.write().map_err(|_| poisoned())?;

        for write in &tx.writes {
            let table = match write {
                Write::Upsert { table, .. } | Write::Delete { table, .. } => table,
            };
            if !tables.rows.contains_key(table) {
                return Err(OffsetStoreError::Unavailable(format!("no table '{table}'")));
            }
        }

        for write in tx.writes {
            match write {
                Write::Upsert { table, key, value } => {
                    tables.rows.entry(table).or_default().insert(key, value);
                }
                Write::Delete { table, key } => {
                    if let Some(rows) = tables.rows.get_mut(&table) {
                        rows.remove(&key);
                    }
                }
            }
        }
        for (key, offset) in tx.offsets {
            tables.offsets.insert(key, offset);
        }
        Ok(())
    }
}
