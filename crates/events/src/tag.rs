//! Tag partitioning.
//!
//! Every event carries the tag of the entity that emitted it. The tag is a
//! pure function of the entity id and the (fixed) number of shards, so all
//! events of one entity land in the same tag for the lifetime of the
//! deployment. Changing the shard count is a data migration.

use serde::{Deserialize, Serialize};

use keel_core::{DomainError, EntityId};

/// A partition label; consumers read one tag's events in offset order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AggregateEventTag(String);

impl AggregateEventTag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for AggregateEventTag {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A fixed set of `num_shards` tags named `"{name}{shard}"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AggregateEventShards {
    name: String,
    num_shards: u32,
}

impl AggregateEventShards {
    pub fn new(name: impl Into<String>, num_shards: u32) -> Result<Self, DomainError> {
        let name = name.into();
        if name.is_empty() {
            return Err(DomainError::validation("tag name must not be empty"));
        }
        if num_shards == 0 || num_shards > i32::MAX as u32 {
            return Err(DomainError::validation(format!(
                "number of shards must be in 1..={}, got {num_shards}",
                i32::MAX
            )));
        }
        Ok(Self { name, num_shards })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_shards(&self) -> u32 {
        self.num_shards
    }

    /// Shard number for an entity id: `abs(polynomial_string_hash(id) % n)`.
    pub fn shard_for(&self, entity_id: &EntityId) -> u32 {
        (polynomial_string_hash(entity_id.as_str()) % self.num_shards as i32).unsigned_abs()
    }

    pub fn tag_for(&self, entity_id: &EntityId) -> AggregateEventTag {
        self.tag_for_shard(self.shard_for(entity_id))
    }

    pub fn all_tags(&self) -> Vec<AggregateEventTag> {
        (0..self.num_shards).map(|shard| self.tag_for_shard(shard)).collect()
    }

    fn tag_for_shard(&self, shard: u32) -> AggregateEventTag {
        AggregateEventTag(format!("{}{}", self.name, shard))
    }
}

/// How an event type is tagged: one global tag, or sharded by entity id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AggregateEventTagger {
    Single(AggregateEventTag),
    Sharded(AggregateEventShards),
}

impl AggregateEventTagger {
    pub fn tag_for(&self, entity_id: &EntityId) -> AggregateEventTag {
        match self {
            Self::Single(tag) => tag.clone(),
            Self::Sharded(shards) => shards.tag_for(entity_id),
        }
    }

    pub fn all_tags(&self) -> Vec<AggregateEventTag> {
        match self {
            Self::Single(tag) => vec![tag.clone()],
            Self::Sharded(shards) => shards.all_tags(),
        }
    }
}

impl From<AggregateEventTag> for AggregateEventTagger {
    fn from(value: AggregateEventTag) -> Self {
        Self::Single(value)
    }
}

impl From<AggregateEventShards> for AggregateEventTagger {
    fn from(value: AggregateEventShards) -> Self {
        Self::Sharded(value)
    }
}

/// 32-bit polynomial string hash over UTF-16 code units (`h = 31*h + c`, wrapping).
///
/// Part of the persisted format: changing it reassigns tags.
pub fn polynomial_string_hash(s: &str) -> i32 {
    s.encode_utf16()
        .fold(0i32, |h, unit| h.wrapping_mul(31).wrapping_add(unit as i32))
}
