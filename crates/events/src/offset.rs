//! Offsets: positions within one tag.

use core::cmp::Ordering;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Position of an event within a tag.
///
/// Offsets are totally ordered **within one tag** only. `NoOffset` sorts
/// before everything; a `Sequence` and a `TimeBasedUuid` are never comparable.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Offset {
    /// Nothing consumed yet.
    #[default]
    NoOffset,
    /// Monotonically increasing integer position.
    Sequence(i64),
    /// Time-ordered identifier (UUIDv7, ordered by its timestamp prefix).
    TimeBasedUuid(Uuid),
}

impl Offset {
    pub fn is_none(&self) -> bool {
        matches!(self, Self::NoOffset)
    }

    pub fn sequence(&self) -> Option<i64> {
        match self {
            Self::Sequence(n) => Some(*n),
            _ => None,
        }
    }

    pub fn time_uuid(&self) -> Option<Uuid> {
        match self {
            Self::TimeBasedUuid(u) => Some(*u),
            _ => None,
        }
    }

    /// `(sequence_offset, time_uuid_offset)` column values; at most one is set.
    pub fn to_columns(&self) -> (Option<i64>, Option<Uuid>) {
        (self.sequence(), self.time_uuid())
    }

    /// Inverse of [`Offset::to_columns`]. A row with both columns set prefers
    /// the sequence value.
    pub fn from_columns(sequence: Option<i64>, time_uuid: Option<Uuid>) -> Self {
        match (sequence, time_uuid) {
            (Some(n), _) => Self::Sequence(n),
            (None, Some(u)) => Self::TimeBasedUuid(u),
            (None, None) => Self::NoOffset,
        }
    }

    /// `true` if `self` comes strictly after `other` in the same tag.
    pub fn is_after(&self, other: &Offset) -> bool {
        matches!(self.partial_cmp(other), Some(Ordering::Greater))
    }
}

impl PartialOrd for Offset {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::NoOffset, Self::NoOffset) => Some(Ordering::Equal),
            (Self::NoOffset, _) => Some(Ordering::Less),
            (_, Self::NoOffset) => Some(Ordering::Greater),
            (Self::Sequence(a), Self::Sequence(b)) => Some(a.cmp(b)),
            (Self::TimeBasedUuid(a), Self::TimeBasedUuid(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl core::fmt::Display for Offset {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NoOffset => f.write_str("none"),
            Self::Sequence(n) => write!(f, "seq:{n}"),
            Self::TimeBasedUuid(u) => write!(f, "uuid:{u}"),
        }
    }
}
