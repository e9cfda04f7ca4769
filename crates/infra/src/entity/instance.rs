//! A single live entity instance.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{Instrument, debug, info, info_span, warn};

use keel_core::{Behavior, DomainError, Effect, EntityId, ExpectedVersion, Kind, PersistentEntity};

use super::EventSourcedEntity;
use super::error::AskError;
use crate::config::EntityConfig;
use crate::event_log::{EventLog, EventLogError, Snapshot, UncommittedEvent};

#[derive(Debug, Clone)]
pub(crate) struct InstanceConfig {
    /// `None` keeps the instance alive until stopped or dropped.
    pub passivate_after: Option<Duration>,
    pub snapshot_after: u64,
    pub mailbox_capacity: usize,
}

impl From<&EntityConfig> for InstanceConfig {
    fn from(config: &EntityConfig) -> Self {
        Self {
            passivate_after: Some(config.passivate_after),
            snapshot_after: config.snapshot_after,
            mailbox_capacity: config.mailbox_capacity,
        }
    }
}

pub(crate) enum InstanceMessage<E: PersistentEntity> {
    Ask {
        command: E::Command,
        reply: oneshot::Sender<Result<E::Reply, AskError>>,
    },
    Stop,
}

/// Mailbox handle of a running instance.
pub struct EntityHandle<E: PersistentEntity> {
    entity_id: EntityId,
    sender: mpsc::Sender<InstanceMessage<E>>,
    terminated: watch::Receiver<bool>,
}

impl<E: PersistentEntity> Clone for EntityHandle<E> {
    fn clone(&self) -> Self {
        Self {
            entity_id: self.entity_id.clone(),
            sender: self.sender.clone(),
            terminated: self.terminated.clone(),
        }
    }
}

impl<E: PersistentEntity> std::fmt::Debug for EntityHandle<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityHandle")
            .field("entity_type", &E::ENTITY_TYPE)
            .field("entity_id", &self.entity_id)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl<E: PersistentEntity> EntityHandle<E> {
    pub fn entity_id(&self) -> &EntityId {
        &self.entity_id
    }

    /// Enqueue a command and wait for its reply, without a deadline.
    pub async fn ask(&self, command: E::Command) -> Result<E::Reply, AskError> {
        match self.enqueue(command).await {
            Ok(pending) => pending.wait().await,
            Err(_command) => Err(self.stopped("mailbox closed")),
        }
    }

    /// Enqueue without waiting for the reply. A closed mailbox hands the
    /// command back: it was never accepted and may be sent elsewhere.
    pub(crate) async fn enqueue(&self, command: E::Command) -> Result<PendingReply<E>, E::Command> {
        let (tx, rx) = oneshot::channel();
        match self.sender.send(InstanceMessage::Ask { command, reply: tx }).await {
            Ok(()) => Ok(PendingReply {
                entity_id: self.entity_id.clone(),
                rx,
            }),
            Err(mpsc::error::SendError(InstanceMessage::Ask { command, .. })) => Err(command),
            Err(mpsc::error::SendError(InstanceMessage::Stop)) => {
                unreachable!("an Ask message was sent")
            }
        }
    }

    pub fn is_alive(&self) -> bool {
        !self.sender.is_closed() && !*self.terminated.borrow()
    }

    /// Ask the instance to stop after the commands already queued, and wait
    /// until it has.
    pub async fn stop(&self) {
        let _ = self.sender.send(InstanceMessage::Stop).await;
        self.wait_terminated().await;
    }

    pub async fn wait_terminated(&self) {
        wait_for_termination(self.terminated.clone()).await
    }

    /// Termination signal that does not hold the mailbox open.
    pub(crate) fn termination(&self) -> watch::Receiver<bool> {
        self.terminated.clone()
    }

    fn stopped(&self, reason: &str) -> AskError {
        AskError::EntityStopped {
            entity_type: E::ENTITY_TYPE.to_string(),
            entity_id: self.entity_id.clone(),
            reason: reason.to_string(),
        }
    }
}

pub(crate) async fn wait_for_termination(mut terminated: watch::Receiver<bool>) {
    while !*terminated.borrow_and_update() {
        if terminated.changed().await.is_err() {
            break;
        }
    }
}

/// Reply to a command the instance has accepted.
pub(crate) struct PendingReply<E: PersistentEntity> {
    entity_id: EntityId,
    rx: oneshot::Receiver<Result<E::Reply, AskError>>,
}

impl<E: PersistentEntity> PendingReply<E> {
    pub(crate) async fn wait(self) -> Result<E::Reply, AskError> {
        let entity_id = self.entity_id;
        self.rx.await.map_err(|_| AskError::EntityStopped {
            entity_type: E::ENTITY_TYPE.to_string(),
            entity_id,
            reason: "reply dropped".to_string(),
        })?
    }
}

pub(crate) fn spawn_instance<E: EventSourcedEntity>(
    entity_id: EntityId,
    log: Arc<dyn EventLog>,
    config: InstanceConfig,
) -> EntityHandle<E> {
    let (sender, rx) = mpsc::channel(config.mailbox_capacity.max(1));
    let (done_tx, terminated) = watch::channel(false);
    let span = info_span!("entity", entity_type = E::ENTITY_TYPE, entity_id = %entity_id);

    let id = entity_id.clone();
    tokio::spawn(
        async move {
            run_instance::<E>(id, log, rx, config).await;
            let _ = done_tx.send(true);
        }
        .instrument(span),
    );

    EntityHandle {
        entity_id,
        sender,
        terminated,
    }
}

async fn run_instance<E: EventSourcedEntity>(
    entity_id: EntityId,
    log: Arc<dyn EventLog>,
    mut rx: mpsc::Receiver<InstanceMessage<E>>,
    config: InstanceConfig,
) {
    let mut instance = match Instance::<E>::recover(entity_id.clone(), log, &config).await {
        Ok(instance) => instance,
        Err(err) => {
            warn!(error = %err, "recovery failed, stopping instance");
            rx.close();
            while let Some(message) = rx.recv().await {
                if let InstanceMessage::Ask { reply, .. } = message {
                    let _ = reply.send(Err(AskError::EntityStopped {
                        entity_type: E::ENTITY_TYPE.to_string(),
                        entity_id: entity_id.clone(),
                        reason: format!("recovery failed: {err}"),
                    }));
                }
            }
            return;
        }
    };

    loop {
        let next = match config.passivate_after {
            Some(idle) => match tokio::time::timeout(idle, rx.recv()).await {
                Ok(next) => next,
                Err(_elapsed) => {
                    info!("entity idle, passivating");
                    break;
                }
            },
            None => rx.recv().await,
        };

        match next {
            Some(InstanceMessage::Ask { command, reply }) => {
                let result = instance.handle(command).await;
                if instance.persist_failed {
                    // Closed before replying, so a retry reaches a fresh instance.
                    rx.close();
                    let _ = reply.send(result);
                    warn!("stopping after persistence failure; the next command recovers from the log");
                    break;
                }
                let _ = reply.send(result);
            }
            Some(InstanceMessage::Stop) => {
                debug!("stop requested");
                break;
            }
            None => break,
        }
    }

    // Refuse new commands, but answer those already accepted. After a failed
    // persist the in-memory state may lag the log, so nothing more is handled.
    rx.close();
    while let Some(message) = rx.recv().await {
        if let InstanceMessage::Ask { command, reply } = message {
            let result = if instance.persist_failed {
                Err(AskError::EntityStopped {
                    entity_type: E::ENTITY_TYPE.to_string(),
                    entity_id: entity_id.clone(),
                    reason: "stopped after persistence failure".to_string(),
                })
            } else {
                instance.handle(command).await
            };
            let _ = reply.send(result);
        }
    }
    debug!(sequence_nr = instance.sequence_nr, "entity stopped");
}

struct Instance<E: PersistentEntity> {
    entity_id: EntityId,
    log: Arc<dyn EventLog>,
    behavior: Behavior<E>,
    sequence_nr: u64,
    events_since_snapshot: u64,
    snapshot_after: u64,
    /// Set when an append failed: the store may hold events this instance
    /// never applied.
    persist_failed: bool,
}

impl<E: EventSourcedEntity> Instance<E> {
    async fn recover(
        entity_id: EntityId,
        log: Arc<dyn EventLog>,
        config: &InstanceConfig,
    ) -> Result<Self, EventLogError> {
        let snapshot = log.load_snapshot(E::ENTITY_TYPE, &entity_id).await?;
        let (state, from) = match snapshot {
            Some(snapshot) => {
                let state: E::State = serde_json::from_value(snapshot.state).map_err(|e| {
                    EventLogError::Serialization(format!("snapshot of {}/{entity_id}: {e}", E::ENTITY_TYPE))
                })?;
                (Some(state), snapshot.sequence_nr)
            }
            None => (None, 0),
        };

        let mut behavior = E::initial_behavior(state);
        let events = log.load(E::ENTITY_TYPE, &entity_id, from).await?;
        let mut sequence_nr = from;
        for stored in &events {
            let event: E::Event = stored.decode_payload()?;
            behavior = behavior.apply_event(&event);
            sequence_nr = stored.sequence_nr;
        }
        let behavior = E::recovery_completed(behavior, &entity_id);

        info!(sequence_nr, replayed = events.len(), "entity recovered");

        Ok(Self {
            entity_id,
            log,
            behavior,
            sequence_nr,
            events_since_snapshot: events.len() as u64,
            snapshot_after: config.snapshot_after,
            persist_failed: false,
        })
    }

    async fn handle(&mut self, command: E::Command) -> Result<E::Reply, AskError> {
        let kind = command.kind();
        let decided = catch_unwind(AssertUnwindSafe(|| {
            self.behavior.handle_command(&self.entity_id, &command)
        }));
        let effect = match decided {
            Ok(effect) => effect,
            Err(panic) => {
                let msg = panic_message(panic.as_ref());
                warn!(command = kind, error = %msg, "command handler panicked");
                return Err(AskError::Domain(DomainError::HandlerFailed(msg)));
            }
        };

        match effect {
            Effect::Reply(reply) => Ok(reply),
            Effect::Reject(msg) => {
                debug!(command = kind, reason = %msg, "command rejected");
                Err(AskError::InvalidCommand(msg))
            }
            Effect::Fail(err) => Err(AskError::from(err)),
            Effect::Persist { events, after } => self.persist(kind, events, after).await,
        }
    }

    async fn persist<F>(&mut self, kind: &str, events: Vec<E::Event>, after: F) -> Result<E::Reply, AskError>
    where
        F: FnOnce(&E::State) -> E::Reply,
    {
        if !events.is_empty() {
            let uncommitted = events
                .iter()
                .map(|event| UncommittedEvent::from_typed(E::ENTITY_TYPE, &self.entity_id, event))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| AskError::PersistenceFailure(e.to_string()))?;

            let stored = match self
                .log
                .append(uncommitted, ExpectedVersion::Exact(self.sequence_nr))
                .await
            {
                Ok(stored) => stored,
                Err(err) => {
                    warn!(command = kind, error = %err, "persist failed");
                    self.persist_failed = true;
                    return Err(AskError::PersistenceFailure(err.to_string()));
                }
            };

            // Durable: now fold the events in.
            self.behavior = self.behavior.clone().replay(&events);
            if let Some(last) = stored.last() {
                self.sequence_nr = last.sequence_nr;
            }
            self.events_since_snapshot += stored.len() as u64;
            debug!(command = kind, persisted = stored.len(), sequence_nr = self.sequence_nr, "events persisted");

            self.maybe_snapshot().await;
        }

        let state = self.behavior.state();
        catch_unwind(AssertUnwindSafe(|| after(state))).map_err(|panic| {
            let msg = panic_message(panic.as_ref());
            warn!(command = kind, error = %msg, "reply callback panicked after persist");
            AskError::Domain(DomainError::HandlerFailed(msg))
        })
    }

    async fn maybe_snapshot(&mut self) {
        if self.snapshot_after == 0 || self.events_since_snapshot < self.snapshot_after {
            return;
        }
        let snapshot = match Snapshot::of(
            E::ENTITY_TYPE,
            &self.entity_id,
            self.sequence_nr,
            self.behavior.state(),
        ) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(error = %err, "snapshot serialization failed");
                return;
            }
        };
        match self.log.save_snapshot(snapshot).await {
            Ok(()) => {
                debug!(sequence_nr = self.sequence_nr, "snapshot saved");
                self.events_since_snapshot = 0;
            }
            Err(err) => warn!(error = %err, "snapshot write failed"),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}
