use serde::Serialize;
use serde::de::DeserializeOwned;

use keel_core::Kind;

use crate::tag::AggregateEventTagger;

/// An event emitted by a persistent entity.
///
/// Events are:
/// - **immutable** (treat them as facts)
/// - **versioned** (schema evolution)
/// - **tagged**: every event of an entity lands in the same tag, chosen by
///   [`Event::aggregate_tagger`] from the entity id
pub trait Event:
    Kind + Clone + core::fmt::Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
    /// How events of this type are partitioned into tags.
    fn aggregate_tagger() -> AggregateEventTagger;

    /// Schema version for this event type.
    fn version(&self) -> u32 {
        1
    }
}
