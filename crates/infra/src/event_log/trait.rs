use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use keel_core::{EntityId, EventId, ExpectedVersion, Kind};
use keel_events::{AggregateEventTag, Event, EventEnvelope, Offset};

/// An event ready to be appended to an entity stream (no sequence number yet).
///
/// Build it with [`UncommittedEvent::from_typed`], which serializes the
/// payload and assigns the event's tag from its tagger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UncommittedEvent {
    pub event_id: EventId,
    pub entity_type: String,
    pub entity_id: EntityId,
    pub tag: AggregateEventTag,

    pub event_type: String,
    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,

    pub payload: JsonValue,
}

impl UncommittedEvent {
    pub fn from_typed<E: Event>(
        entity_type: &str,
        entity_id: &EntityId,
        event: &E,
    ) -> Result<Self, EventLogError> {
        let payload = serde_json::to_value(event)
            .map_err(|e| EventLogError::Serialization(format!("{}: {e}", event.kind())))?;

        Ok(Self {
            event_id: EventId::new(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.clone(),
            tag: E::aggregate_tagger().tag_for(entity_id),
            event_type: event.kind().to_string(),
            event_version: event.version(),
            occurred_at: Utc::now(),
            payload,
        })
    }
}

/// A persisted event.
///
/// - `sequence_nr` is the 1-based position in the entity's own stream.
/// - `offset` is the position in `tag`, strictly increasing within that tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event_id: EventId,
    pub entity_type: String,
    pub entity_id: EntityId,
    pub sequence_nr: u64,
    pub tag: AggregateEventTag,
    pub offset: Offset,

    pub event_type: String,
    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,

    pub payload: JsonValue,
}

impl StoredEvent {
    /// Envelope with the raw JSON payload.
    pub fn to_envelope(&self) -> EventEnvelope<JsonValue> {
        EventEnvelope::new(
            self.event_id,
            self.entity_type.clone(),
            self.entity_id.clone(),
            self.sequence_nr,
            self.tag.clone(),
            self.offset,
            self.occurred_at,
            self.payload.clone(),
        )
    }

    /// Envelope with the payload decoded into the entity's event type.
    pub fn decode<E: DeserializeOwned>(&self) -> Result<EventEnvelope<E>, EventLogError> {
        let payload = self.decode_payload()?;
        Ok(EventEnvelope::new(
            self.event_id,
            self.entity_type.clone(),
            self.entity_id.clone(),
            self.sequence_nr,
            self.tag.clone(),
            self.offset,
            self.occurred_at,
            payload,
        ))
    }

    pub fn decode_payload<E: DeserializeOwned>(&self) -> Result<E, EventLogError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            EventLogError::Serialization(format!(
                "{} #{} of {}/{}: {e}",
                self.event_type, self.sequence_nr, self.entity_type, self.entity_id
            ))
        })
    }
}

/// Serialized entity state at a given stream position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub entity_type: String,
    pub entity_id: EntityId,
    /// Last sequence number folded into `state`.
    pub sequence_nr: u64,
    pub state: JsonValue,
    pub created_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn of<S: Serialize>(
        entity_type: &str,
        entity_id: &EntityId,
        sequence_nr: u64,
        state: &S,
    ) -> Result<Self, EventLogError> {
        let state = serde_json::to_value(state)
            .map_err(|e| EventLogError::Serialization(format!("snapshot of {entity_type}/{entity_id}: {e}")))?;
        Ok(Self {
            entity_type: entity_type.to_string(),
            entity_id: entity_id.clone(),
            sequence_nr,
            state,
            created_at: Utc::now(),
        })
    }
}

/// Event log operation error.
///
/// Storage failures only; domain failures never reach the log.
#[derive(Debug, Error)]
pub enum EventLogError {
    #[error("optimistic concurrency check failed: {0}")]
    Concurrency(String),

    #[error("invalid append: {0}")]
    InvalidAppend(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("event log unavailable: {0}")]
    Unavailable(String),
}

/// Append-only event log.
///
/// Guarantees:
/// - `append` is all-or-nothing and checks `expected` against the stream's
///   current sequence number.
/// - `load` returns one stream in sequence order.
/// - `events_by_tag` returns events strictly after `after`, in offset order.
#[async_trait]
pub trait EventLog: Send + Sync {
    async fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventLogError>;

    async fn load(
        &self,
        entity_type: &str,
        entity_id: &EntityId,
        after_sequence_nr: u64,
    ) -> Result<Vec<StoredEvent>, EventLogError>;

    async fn events_by_tag(
        &self,
        tag: &AggregateEventTag,
        after: Offset,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, EventLogError>;

    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<(), EventLogError>;

    async fn load_snapshot(
        &self,
        entity_type: &str,
        entity_id: &EntityId,
    ) -> Result<Option<Snapshot>, EventLogError>;
}

#[async_trait]
impl<S> EventLog for Arc<S>
where
    S: EventLog + ?Sized,
{
    async fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventLogError> {
        (**self).append(events, expected).await
    }

    async fn load(
        &self,
        entity_type: &str,
        entity_id: &EntityId,
        after_sequence_nr: u64,
    ) -> Result<Vec<StoredEvent>, EventLogError> {
        (**self).load(entity_type, entity_id, after_sequence_nr).await
    }

    async fn events_by_tag(
        &self,
        tag: &AggregateEventTag,
        after: Offset,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, EventLogError> {
        (**self).events_by_tag(tag, after, limit).await
    }

    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<(), EventLogError> {
        (**self).save_snapshot(snapshot).await
    }

    async fn load_snapshot(
        &self,
        entity_type: &str,
        entity_id: &EntityId,
    ) -> Result<Option<Snapshot>, EventLogError> {
        (**self).load_snapshot(entity_type, entity_id).await
    }
}

/// Check that a batch targets a single stream; returns that stream's key.
pub(crate) fn single_stream(events: &[UncommittedEvent]) -> Result<(&str, &EntityId), EventLogError> {
    let Some(first) = events.first() else {
        return Err(EventLogError::InvalidAppend("empty batch".to_string()));
    };
    for (idx, e) in events.iter().enumerate() {
        if e.entity_type != first.entity_type || e.entity_id != first.entity_id {
            return Err(EventLogError::InvalidAppend(format!(
                "batch targets more than one stream (index {idx})"
            )));
        }
        if e.tag != first.tag {
            return Err(EventLogError::InvalidAppend(format!(
                "batch carries more than one tag (index {idx})"
            )));
        }
    }
    Ok((&first.entity_type, &first.entity_id))
}
