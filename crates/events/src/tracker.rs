//! Per-tag progress tracking.
//!
//! Consumers see each tag's events in offset order. The tracker enforces that
//! invariant without making storage assumptions: it remembers the last offset
//! seen for one tag and rejects anything that does not come strictly after it.

use thiserror::Error;

use crate::offset::Offset;
use crate::tag::AggregateEventTag;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrackerError {
    #[error("event from tag '{found}' delivered to tracker for '{expected}'")]
    TagMismatch {
        expected: AggregateEventTag,
        found: AggregateEventTag,
    },

    #[error("offset {found} does not follow {last}")]
    NonMonotonicOffset { last: Offset, found: Offset },
}

/// Tracks the last offset consumed from one tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetTracker {
    tag: AggregateEventTag,
    last: Offset,
}

impl OffsetTracker {
    pub fn new(tag: AggregateEventTag, start: Offset) -> Self {
        Self { tag, last: start }
    }

    pub fn tag(&self) -> &AggregateEventTag {
        &self.tag
    }

    pub fn last(&self) -> Offset {
        self.last
    }

    /// Check an incoming offset without recording it.
    pub fn check(&self, tag: &AggregateEventTag, offset: &Offset) -> Result<(), TrackerError> {
        if tag != &self.tag {
            return Err(TrackerError::TagMismatch {
                expected: self.tag.clone(),
                found: tag.clone(),
            });
        }
        if !offset.is_after(&self.last) {
            return Err(TrackerError::NonMonotonicOffset {
                last: self.last,
                found: *offset,
            });
        }
        Ok(())
    }

    /// Record an offset; it must come strictly after the last one.
    pub fn observe(&mut self, tag: &AggregateEventTag, offset: Offset) -> Result<(), TrackerError> {
        self.check(tag, &offset)?;
        self.last = offset;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag() -> AggregateEventTag {
        AggregateEventTag::new("T0")
    }

    #[test]
    fn accepts_strictly_increasing_offsets() {
        let mut t = OffsetTracker::new(tag(), Offset::NoOffset);
        t.observe(&tag(), Offset::Sequence(1)).unwrap();
        t.observe(&tag(), Offset::Sequence(2)).unwrap();
        assert_eq!(t.last(), Offset::Sequence(2));
    }

    #[test]
    fn rejects_replayed_or_foreign_offsets() {
        let mut t = OffsetTracker::new(tag(), Offset::Sequence(5));
        assert_eq!(
            t.observe(&tag(), Offset::Sequence(5)),
            Err(TrackerError::NonMonotonicOffset {
                last: Offset::Sequence(5),
                found: Offset::Sequence(5)
            })
        );
        assert!(matches!(
            t.observe(&AggregateEventTag::new("T1"), Offset::Sequence(6)),
            Err(TrackerError::TagMismatch { .. })
        ));
        assert_eq!(t.last(), Offset::Sequence(5));
    }
}
