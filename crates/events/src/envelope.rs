use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use keel_core::{EntityId, EventId};

use crate::offset::Offset;
use crate::tag::AggregateEventTag;

/// A persisted event plus the metadata consumers need.
///
/// Notes:
/// - `sequence_nr` is the position in the entity's own stream (1-based).
/// - `offset` is the position in the event's `tag`; consumers checkpoint on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    event_id: EventId,
    entity_type: String,
    entity_id: EntityId,
    sequence_nr: u64,
    tag: AggregateEventTag,
    offset: Offset,
    timestamp: DateTime<Utc>,
    payload: E,
}

impl<E> EventEnvelope<E> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        event_id: EventId,
        entity_type: impl Into<String>,
        entity_id: EntityId,
        sequence_nr: u64,
        tag: AggregateEventTag,
        offset: Offset,
        timestamp: DateTime<Utc>,
        payload: E,
    ) -> Self {
        Self {
            event_id,
            entity_type: entity_type.into(),
            entity_id,
            sequence_nr,
            tag,
            offset,
            timestamp,
            payload,
        }
    }

    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    pub fn entity_id(&self) -> &EntityId {
        &self.entity_id
    }

    pub fn sequence_nr(&self) -> u64 {
        self.sequence_nr
    }

    pub fn tag(&self) -> &AggregateEventTag {
        &self.tag
    }

    pub fn offset(&self) -> Offset {
        self.offset
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }

    /// Same metadata, different payload.
    pub fn map_payload<U>(self, f: impl FnOnce(E) -> U) -> EventEnvelope<U> {
        EventEnvelope {
            event_id: self.event_id,
            entity_type: self.entity_type,
            entity_id: self.entity_id,
            sequence_nr: self.sequence_nr,
            tag: self.tag,
            offset: self.offset,
            timestamp: self.timestamp,
            payload: f(self.payload),
        }
    }

    pub fn try_map_payload<U, Err>(
        self,
        f: impl FnOnce(E) -> Result<U, Err>,
    ) -> Result<EventEnvelope<U>, Err> {
        let payload = f(self.payload)?;
        Ok(EventEnvelope {
            event_id: self.event_id,
            entity_type: self.entity_type,
            entity_id: self.entity_id,
            sequence_nr: self.sequence_nr,
            tag: self.tag,
            offset: self.offset,
            timestamp: self.timestamp,
            payload,
        })
    }
}
