//! Runs one read side over its tags.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::{OnceCell, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use keel_events::{AggregateEventTag, Event, Offset, OffsetTracker};

use super::error::ProjectionError;
use super::handler::ReadSideHandler;
use super::supervisor::{TagProcessor, shutdown_requested};
use crate::config::{ProjectionConfig, UnhandledEventLog};
use crate::event_log::{EventLog, StoredEvent, event_stream};
use crate::offset_store::{OffsetDao, OffsetStore, ReadSideDb};
use crate::restart::RestartBackoff;

/// When the offset is written relative to the handler's side effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitMode {
    /// Side effects and offset commit in one transaction per event.
    Synchronous,
    /// Side effects commit per event; the offset is written once `threshold`
    /// events are unflushed or `flush_interval` passes with one pending.
    /// More events are redelivered after a crash, so handlers must be
    /// idempotent.
    Batched {
        threshold: usize,
        flush_interval: Duration,
    },
}

impl CommitMode {
    pub fn batched(config: &ProjectionConfig) -> Self {
        Self::Batched {
            threshold: config.batch_threshold.max(1),
            flush_interval: config.flush_interval,
        }
    }
}

/// A read side: handler plus the tags it consumes, committing offsets
/// under `read_side_id`.
pub struct ReadSideProcessor<Ev, Db, H> {
    read_side_id: String,
    tags: Vec<AggregateEventTag>,
    handler: H,
    db: Arc<Db>,
    log: Arc<dyn EventLog>,
    mode: CommitMode,
    poll_interval: Duration,
    page_size: usize,
    backoff: RestartBackoff,
    unhandled: UnhandledEventLog,
    global_prepare: OnceCell<()>,
    _event: PhantomData<fn() -> Ev>,
}

impl<Ev, Db, H> std::fmt::Debug for ReadSideProcessor<Ev, Db, H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadSideProcessor")
            .field("read_side_id", &self.read_side_id)
            .field("tags", &self.tags)
            .field("mode", &self.mode)
            .finish()
    }
}

struct Progress {
    tracker: OffsetTracker,
    pending: Option<Offset>,
    unflushed: usize,
}

impl<Ev, Db, H> ReadSideProcessor<Ev, Db, H>
where
    Ev: Event,
    Db: ReadSideDb,
    H: ReadSideHandler<Ev, Db>,
{
    pub fn new(
        read_side_id: impl Into<String>,
        tags: Vec<AggregateEventTag>,
        handler: H,
        db: Arc<Db>,
        log: Arc<dyn EventLog>,
        config: &ProjectionConfig,
    ) -> Self {
        Self {
            read_side_id: read_side_id.into(),
            tags,
            handler,
            db,
            log,
            mode: CommitMode::Synchronous,
            poll_interval: config.poll_interval,
            page_size: config.page_size,
            backoff: config.backoff,
            unhandled: config.unhandled_event_log,
            global_prepare: OnceCell::new(),
            _event: PhantomData,
        }
    }

    pub fn with_commit_mode(mut self, mode: CommitMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn read_side_id(&self) -> &str {
        &self.read_side_id
    }

    pub fn commit_mode(&self) -> CommitMode {
        self.mode
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Runs the handler's global prepare at most once per processor, however
    /// many tags start concurrently. Failure leaves it to be retried.
    async fn ensure_global_prepare(&self) -> Result<(), ProjectionError> {
        self.global_prepare
            .get_or_try_init(|| async {
                match self.handler.global_prepare(&self.db).await {
                    Ok(()) => Ok(()),
                    Err(err) if err.is_already_exists() => {
                        debug!(projection = %self.read_side_id, error = %err, "global prepare already done");
                        Ok(())
                    }
                    Err(source) => Err(ProjectionError::GlobalPrepare {
                        projection: self.read_side_id.clone(),
                        source,
                    }),
                }
            })
            .await
            .map(|_| ())
    }

    /// Consume `tag` from its committed offset until `shutdown` flips or an
    /// error ends the stream.
    pub async fn run(
        &self,
        tag: &AggregateEventTag,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ProjectionError> {
        self.ensure_global_prepare().await?;
        self.handler
            .prepare(&self.db, tag)
            .await
            .map_err(|source| ProjectionError::Prepare {
                projection: self.read_side_id.clone(),
                tag: tag.clone(),
                source,
            })?;

        let store: Arc<dyn OffsetStore> = self.db.clone();
        let dao = OffsetDao::prepare(store, &self.read_side_id, tag).await?;
        let start = dao.loaded_offset();
        info!(projection = %self.read_side_id, tag = %tag, offset = %start, "read side started");

        let mut progress = Progress {
            tracker: OffsetTracker::new(tag.clone(), start),
            pending: None,
            unflushed: 0,
        };
        let mut events = event_stream(self.log.clone(), tag.clone(), start, self.poll_interval, self.page_size);
        let flush_every = match self.mode {
            CommitMode::Batched { flush_interval, .. } => flush_interval,
            CommitMode::Synchronous => Duration::from_secs(3600),
        };
        let mut flush_timer = tokio::time::interval_at(Instant::now() + flush_every, flush_every);
        flush_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome = loop {
            tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => break Ok(()),
                _ = flush_timer.tick(), if progress.pending.is_some() => {
                    if let Err(err) = self.flush(&dao, &mut progress).await {
                        break Err(err);
                    }
                }
                next = events.next() => match next {
                    Some(Ok(stored)) => {
                        if let Err(err) = self.process(&dao, &mut progress, &stored).await {
                            break Err(err);
                        }
                    }
                    Some(Err(err)) => break Err(err.into()),
                    None => break Ok(()),
                },
            }
        };

        // Side effects up to `pending` are committed; record them on the way out.
        if let Err(err) = self.flush(&dao, &mut progress).await {
            warn!(projection = %self.read_side_id, tag = %tag, error = %err, "final offset flush failed");
            return outcome.and(Err(err));
        }
        info!(projection = %self.read_side_id, tag = %tag, offset = %progress.tracker.last(), "read side stopped");
        outcome
    }

    async fn process(
        &self,
        dao: &OffsetDao,
        progress: &mut Progress,
        stored: &StoredEvent,
    ) -> Result<(), ProjectionError> {
        progress.tracker.check(&stored.tag, &stored.offset)?;
        let offset = stored.offset;

        if self.handler.handles(&stored.event_type) {
            let envelope = stored.decode::<Ev>().map_err(|err| ProjectionError::Decode {
                event_type: stored.event_type.clone(),
                offset,
                reason: err.to_string(),
            })?;

            let mut tx = self.db.begin().await?;
            self.handler
                .handle(&mut tx, &envelope)
                .await
                .map_err(|source| ProjectionError::Handler {
                    projection: self.read_side_id.clone(),
                    tag: stored.tag.clone(),
                    offset,
                    event_type: stored.event_type.clone(),
                    source,
                })?;
            match self.mode {
                CommitMode::Synchronous => {
                    self.db.stage_offset(&mut tx, dao.key(), offset).await?;
                    self.db.commit(tx).await?;
                }
                CommitMode::Batched { .. } => {
                    self.db.commit(tx).await?;
                    progress.pending = Some(offset);
                    progress.unflushed += 1;
                }
            }
            trace!(projection = %self.read_side_id, tag = %stored.tag, offset = %offset, event_type = %stored.event_type, "event handled");
        } else {
            self.unhandled.emit(
                &self.read_side_id,
                stored.tag.as_str(),
                &stored.event_type,
                &offset.to_string(),
            );
            match self.mode {
                CommitMode::Synchronous => dao.save(offset).await?,
                CommitMode::Batched { .. } => {
                    progress.pending = Some(offset);
                    progress.unflushed += 1;
                }
            }
        }

        progress.tracker.observe(&stored.tag, offset)?;
        if let CommitMode::Batched { threshold, .. } = self.mode {
            if progress.unflushed >= threshold {
                self.flush(dao, progress).await?;
            }
        }
        Ok(())
    }

    async fn flush(&self, dao: &OffsetDao, progress: &mut Progress) -> Result<(), ProjectionError> {
        if let Some(offset) = progress.pending {
            dao.save(offset).await?;
            debug!(projection = %self.read_side_id, tag = %dao.key().tag, offset = %offset, events = progress.unflushed, "offset flushed");
            progress.pending = None;
            progress.unflushed = 0;
        }
        Ok(())
    }
}

#[async_trait]
impl<Ev, Db, H> TagProcessor for ReadSideProcessor<Ev, Db, H>
where
    Ev: Event,
    Db: ReadSideDb,
    H: ReadSideHandler<Ev, Db>,
{
    fn name(&self) -> &str {
        &self.read_side_id
    }

    fn tags(&self) -> &[AggregateEventTag] {
        &self.tags
    }

    fn backoff(&self) -> RestartBackoff {
        self.backoff
    }

    async fn run_tag(
        &self,
        tag: &AggregateEventTag,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), ProjectionError> {
        self.run(tag, shutdown).await
    }
}
