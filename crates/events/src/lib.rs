//! Event metadata shared by the entity runtime and its consumers.
//!
//! - [`Event`]: what a persistent entity emits, including how it is tagged.
//! - [`tag`]: deterministic partitioning of an entity's events into tags.
//! - [`Offset`]: position of an event within one tag.
//! - [`TopicSink`]: publishing abstraction used to republish events.

pub mod envelope;
pub mod event;
pub mod in_memory_topic;
pub mod offset;
pub mod sink;
pub mod tag;
pub mod tracker;

pub use envelope::EventEnvelope;
pub use event::Event;
pub use in_memory_topic::{InMemoryTopic, PublishedMessage};
pub use offset::Offset;
pub use sink::{PublishError, TopicSink};
pub use tag::{AggregateEventShards, AggregateEventTag, AggregateEventTagger, polynomial_string_hash};
pub use tracker::{OffsetTracker, TrackerError};
