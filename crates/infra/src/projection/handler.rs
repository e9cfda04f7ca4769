use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;

use keel_events::{AggregateEventTag, Event, EventEnvelope};

use super::error::HandlerError;
use crate::offset_store::ReadSideDb;

/// Side-effect logic of one read side.
///
/// `handle` runs inside the transaction `Db` opened for the event; in
/// synchronous mode the offset write is staged on the same transaction.
/// Handlers must be idempotent: after a crash the last events of a tag are
/// delivered again.
#[async_trait]
pub trait ReadSideHandler<Ev: Event, Db: ReadSideDb>: Send + Sync + 'static {
    /// Once per processor, before any tag starts (schema creation etc.).
    /// `HandlerError::AlreadyExists` is treated as success.
    async fn global_prepare(&self, _db: &Db) -> Result<(), HandlerError> {
        Ok(())
    }

    /// Once per tag, each time the tag's stream (re)starts.
    async fn prepare(&self, _db: &Db, _tag: &AggregateEventTag) -> Result<(), HandlerError> {
        Ok(())
    }

    /// Whether events of this type are of interest; others are skipped.
    fn handles(&self, event_type: &str) -> bool;

    async fn handle(&self, tx: &mut Db::Tx, envelope: &EventEnvelope<Ev>) -> Result<(), HandlerError>;
}

type GlobalPrepareFn<Db> = Arc<dyn for<'a> Fn(&'a Db) -> BoxFuture<'a, Result<(), HandlerError>> + Send + Sync>;

type PrepareFn<Db> = Arc<
    dyn for<'a> Fn(&'a Db, &'a AggregateEventTag) -> BoxFuture<'a, Result<(), HandlerError>> + Send + Sync,
>;

type EventFn<Ev, Db> = Arc<
    dyn for<'a> Fn(&'a mut <Db as ReadSideDb>::Tx, &'a EventEnvelope<Ev>) -> BoxFuture<'a, Result<(), HandlerError>>
        + Send
        + Sync,
>;

/// A [`ReadSideHandler`] assembled from closures, one per event type.
///
/// ```ignore
/// let handler = HandlerTable::<CartEvent, InMemoryReadSide>::new()
///     .with_global_prepare(|db| async move { db.create_table("carts").map_err(HandlerError::from) }.boxed())
///     .on_event_sync("CheckedOut", |tx, env| { /* ... */ Ok(()) });
/// ```
pub struct HandlerTable<Ev, Db: ReadSideDb> {
    global_prepare: Option<GlobalPrepareFn<Db>>,
    prepare: Option<PrepareFn<Db>>,
    handlers: HashMap<&'static str, EventFn<Ev, Db>>,
    _event: PhantomData<fn(Ev)>,
}

impl<Ev, Db: ReadSideDb> Default for HandlerTable<Ev, Db> {
    fn default() -> Self {
        Self {
            global_prepare: None,
            prepare: None,
            handlers: HashMap::new(),
            _event: PhantomData,
        }
    }
}

impl<Ev, Db: ReadSideDb> std::fmt::Debug for HandlerTable<Ev, Db> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.handlers.keys().collect();
        kinds.sort();
        f.debug_struct("HandlerTable")
            .field("global_prepare", &self.global_prepare.is_some())
            .field("prepare", &self.prepare.is_some())
            .field("events", &kinds)
            .finish()
    }
}

impl<Ev: Event, Db: ReadSideDb> HandlerTable<Ev, Db> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_global_prepare<F>(mut self, f: F) -> Self
    where
        F: for<'a> Fn(&'a Db) -> BoxFuture<'a, Result<(), HandlerError>> + Send + Sync + 'static,
    {
        self.global_prepare = Some(Arc::new(f));
        self
    }

    pub fn with_prepare<F>(mut self, f: F) -> Self
    where
        F: for<'a> Fn(&'a Db, &'a AggregateEventTag) -> BoxFuture<'a, Result<(), HandlerError>>
            + Send
            + Sync
            + 'static,
    {
        self.prepare = Some(Arc::new(f));
        self
    }

    /// Register the handler for one event type (its `Kind`).
    pub fn on_event<F>(mut self, event_type: &'static str, f: F) -> Self
    where
        F: for<'a> Fn(&'a mut Db::Tx, &'a EventEnvelope<Ev>) -> BoxFuture<'a, Result<(), HandlerError>>
            + Send
            + Sync
            + 'static,
    {
        self.handlers.insert(event_type, Arc::new(f));
        self
    }

    /// Like [`on_event`](Self::on_event) for handlers that never await.
    pub fn on_event_sync<F>(self, event_type: &'static str, f: F) -> Self
    where
        F: Fn(&mut Db::Tx, &EventEnvelope<Ev>) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.on_event(event_type, move |tx, envelope| {
            let result = f(tx, envelope);
            async move { result }.boxed()
        })
    }

    pub fn event_types(&self) -> Vec<&'static str> {
        let mut kinds: Vec<_> = self.handlers.keys().copied().collect();
        kinds.sort_unstable();
        kinds
    }
}

#[async_trait]
impl<Ev: Event, Db: ReadSideDb> ReadSideHandler<Ev, Db> for HandlerTable<Ev, Db> {
    async fn global_prepare(&self, db: &Db) -> Result<(), HandlerError> {
        match &self.global_prepare {
            Some(f) => f(db).await,
            None => Ok(()),
        }
    }

    async fn prepare(&self, db: &Db, tag: &AggregateEventTag) -> Result<(), HandlerError> {
        match &self.prepare {
            Some(f) => f(db, tag).await,
            None => Ok(()),
        }
    }

    fn handles(&self, event_type: &str) -> bool {
        self.handlers.contains_key(event_type)
    }

    async fn handle(&self, tx: &mut Db::Tx, envelope: &EventEnvelope<Ev>) -> Result<(), HandlerError> {
        match self.handlers.get(envelope.payload().kind()) {
            Some(f) => f(tx, envelope).await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offset_store::{InMemoryReadSide, InMemoryTx};
    use crate::test_entity::TestEvent;
    use chrono::Utc;
    use keel_core::{EntityId, EventId};
    use keel_events::Offset;
    use serde_json::json;

    fn envelope(event: TestEvent) -> EventEnvelope<TestEvent> {
        EventEnvelope::new(
            EventId::new(),
            "test",
            EntityId::new("1").unwrap(),
            1,
            AggregateEventTag::new("TestEvent1"),
            Offset::Sequence(1),
            Utc::now(),
            event,
        )
    }

    fn table() -> HandlerTable<TestEvent, InMemoryReadSide> {
        HandlerTable::new()
            .with_global_prepare(|db: &InMemoryReadSide| async move { db.create_table("elements").map_err(HandlerError::from) }.boxed())
            .on_event_sync("Appended", |tx: &mut InMemoryTx, env: &EventEnvelope<TestEvent>| {
                if let TestEvent::Appended(e) = env.payload() {
                    tx.upsert("elements", env.entity_id().as_str(), json!(e));
                }
                Ok(())
            })
    }

    #[tokio::test]
    async fn dispatches_by_event_kind() {
        let db = InMemoryReadSide::new();
        let handler = table();
        handler.global_prepare(&db).await.unwrap();

        assert!(handler.handles("Appended"));
        assert!(!handler.handles("Prepended"));

        let mut tx = db.begin().await.unwrap();
        handler.handle(&mut tx, &envelope(TestEvent::Appended("A".into()))).await.unwrap();
        handler.handle(&mut tx, &envelope(TestEvent::InPrependMode)).await.unwrap();
        db.commit(tx).await.unwrap();

        assert_eq!(db.get("elements", "1"), Some(json!("A")));
    }

    #[tokio::test]
    async fn second_global_prepare_reports_already_exists() {
        let db = InMemoryReadSide::new();
        let handler = table();
        handler.global_prepare(&db).await.unwrap();
        let err = handler.global_prepare(&db).await.unwrap_err();
        assert!(err.is_already_exists());
    }
}
