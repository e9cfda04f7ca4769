//! Test helpers for code built on the runtime.

use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use keel_core::{EntityId, EventId, ExpectedVersion, Kind};
use keel_events::{AggregateEventTag, Event, EventEnvelope, Offset};

use crate::event_log::{EventLog, EventLogError, Snapshot, StoredEvent, UncommittedEvent};
use crate::offset_store::{OffsetKey, ReadSideDb};
use crate::projection::{ProjectionError, ReadSideHandler};

/// Wraps an event log and fails or slows operations on demand.
#[derive(Debug, Default)]
pub struct FailingEventLog<L> {
    inner: L,
    fail_appends: AtomicBool,
    fail_reads: AtomicBool,
    fail_snapshots: AtomicBool,
    lose_append_ack: AtomicBool,
    append_delay: Mutex<Duration>,
}

impl<L: EventLog> FailingEventLog<L> {
    pub fn new(inner: L) -> Self {
        Self {
            inner,
            fail_appends: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
            fail_snapshots: AtomicBool::new(false),
            lose_append_ack: AtomicBool::new(false),
            append_delay: Mutex::new(Duration::ZERO),
        }
    }

    pub fn inner(&self) -> &L {
        &self.inner
    }

    pub fn fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    /// Fails `load`, `load_snapshot` and `events_by_tag`.
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_snapshots(&self, fail: bool) {
        self.fail_snapshots.store(fail, Ordering::SeqCst);
    }

    /// The next append is committed to the wrapped log but reported as failed.
    pub fn lose_next_append_ack(&self) {
        self.lose_append_ack.store(true, Ordering::SeqCst);
    }

    /// Every append sleeps this long before reaching the wrapped log.
    pub fn set_append_delay(&self, delay: Duration) {
        *self
            .append_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = delay;
    }

    fn check(flag: &AtomicBool, operation: &str) -> Result<(), EventLogError> {
        if flag.load(Ordering::SeqCst) {
            return Err(EventLogError::Unavailable(format!("{operation} switched off")));
        }
        Ok(())
    }
}

#[async_trait]
impl<L: EventLog> EventLog for FailingEventLog<L> {
    async fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventLogError> {
        let delay = *self
            .append_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Self::check(&self.fail_appends, "append")?;
        let stored = self.inner.append(events, expected).await?;
        if self.lose_append_ack.swap(false, Ordering::SeqCst) {
            return Err(EventLogError::Unavailable(format!(
                "append of {} events committed, acknowledgement lost",
                stored.len()
            )));
        }
        Ok(stored)
    }

    async fn load(
        &self,
        entity_type: &str,
        entity_id: &EntityId,
        after_sequence_nr: u64,
    ) -> Result<Vec<StoredEvent>, EventLogError> {
        Self::check(&self.fail_reads, "load")?;
        self.inner.load(entity_type, entity_id, after_sequence_nr).await
    }

    async fn events_by_tag(
        &self,
        tag: &AggregateEventTag,
        after: Offset,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, EventLogError> {
        Self::check(&self.fail_reads, "events_by_tag")?;
        self.inner.events_by_tag(tag, after, limit).await
    }

    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<(), EventLogError> {
        Self::check(&self.fail_snapshots, "save_snapshot")?;
        self.inner.save_snapshot(snapshot).await
    }

    async fn load_snapshot(
        &self,
        entity_type: &str,
        entity_id: &EntityId,
    ) -> Result<Option<Snapshot>, EventLogError> {
        Self::check(&self.fail_reads, "load_snapshot")?;
        self.inner.load_snapshot(entity_type, entity_id).await
    }
}

/// Feeds events with explicit offsets straight into a read-side handler,
/// without an event log or a running processor.
///
/// Global prepare runs once in [`new`](Self::new); each tag is prepared on
/// the first event fed to it. Every event is handled and committed together
/// with its offset, as in synchronous mode.
pub struct ReadSideTestDriver<Ev, Db, H> {
    read_side_id: String,
    entity_type: String,
    handler: H,
    db: Arc<Db>,
    prepared: Mutex<HashSet<AggregateEventTag>>,
    sequence_nrs: Mutex<HashMap<EntityId, SequenceNrs>>,
    _event: PhantomData<fn(Ev)>,
}

#[derive(Default)]
struct SequenceNrs {
    last: u64,
    by_offset: HashMap<Offset, u64>,
}

impl<Ev, Db, H> ReadSideTestDriver<Ev, Db, H>
where
    Ev: Event,
    Db: ReadSideDb,
    H: ReadSideHandler<Ev, Db>,
{
    pub async fn new(read_side_id: impl Into<String>, handler: H, db: Arc<Db>) -> Result<Self, ProjectionError> {
        let read_side_id = read_side_id.into();
        match handler.global_prepare(&db).await {
            Err(err) if !err.is_already_exists() => {
                return Err(ProjectionError::GlobalPrepare {
                    projection: read_side_id,
                    source: err,
                });
            }
            _ => {}
        }
        Ok(Self {
            read_side_id,
            entity_type: "test".to_string(),
            handler,
            db,
            prepared: Mutex::new(HashSet::new()),
            sequence_nrs: Mutex::new(HashMap::new()),
            _event: PhantomData,
        })
    }

    /// Entity type recorded on the envelopes handed to the handler.
    pub fn with_entity_type(mut self, entity_type: impl Into<String>) -> Self {
        self.entity_type = entity_type.into();
        self
    }

    pub fn db(&self) -> &Arc<Db> {
        &self.db
    }

    /// Handle `event` of `entity_id` at `offset`. Each new offset gets the
    /// entity's next sequence number; feeding an offset again reuses it,
    /// which is what a redelivery after a crash looks like.
    pub async fn feed(&self, entity_id: &EntityId, event: Ev, offset: Offset) -> Result<(), ProjectionError> {
        let tag = Ev::aggregate_tagger().tag_for(entity_id);
        let needs_prepare = !self
            .prepared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&tag);
        if needs_prepare {
            self.handler
                .prepare(&self.db, &tag)
                .await
                .map_err(|source| ProjectionError::Prepare {
                    projection: self.read_side_id.clone(),
                    tag: tag.clone(),
                    source,
                })?;
            self.prepared
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(tag.clone());
        }

        let sequence_nr = {
            let mut sequence_nrs = self.sequence_nrs.lock().unwrap_or_else(PoisonError::into_inner);
            let SequenceNrs { last, by_offset } = sequence_nrs.entry(entity_id.clone()).or_default();
            *by_offset.entry(offset).or_insert_with(|| {
                *last += 1;
                *last
            })
        };
        let event_type = event.kind().to_string();
        let envelope = EventEnvelope::new(
            EventId::new(),
            self.entity_type.clone(),
            entity_id.clone(),
            sequence_nr,
            tag.clone(),
            offset,
            Utc::now(),
            event,
        );

        let key = OffsetKey::new(self.read_side_id.clone(), tag.clone());
        let mut tx = self.db.begin().await?;
        if self.handler.handles(&event_type) {
            self.handler
                .handle(&mut tx, &envelope)
                .await
                .map_err(|source| ProjectionError::Handler {
                    projection: self.read_side_id.clone(),
                    tag,
                    offset,
                    event_type,
                    source,
                })?;
        }
        self.db.stage_offset(&mut tx, &key, offset).await?;
        self.db.commit(tx).await?;
        Ok(())
    }
}
