use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use keel_core::{EntityId, ExpectedVersion};
use keel_events::{AggregateEventTag, Offset};

use super::r#trait::{EventLog, EventLogError, Snapshot, StoredEvent, UncommittedEvent, single_stream};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct StreamKey {
    entity_type: String,
    entity_id: EntityId,
}

impl StreamKey {
    fn new(entity_type: &str, entity_id: &EntityId) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            entity_id: entity_id.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct Journal {
    streams: HashMap<StreamKey, Vec<StoredEvent>>,
    tags: HashMap<AggregateEventTag, Vec<StoredEvent>>,
    snapshots: HashMap<StreamKey, Snapshot>,
}

/// In-memory append-only event log.
///
/// Intended for tests/dev. Each tag's offsets are `Sequence(1)`,
/// `Sequence(2)`, ... with no gaps.
#[derive(Debug, Default)]
pub struct InMemoryEventLog {
    journal: RwLock<Journal>,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of events appended so far, across all streams.
    pub fn len(&self) -> usize {
        self.journal
            .read()
            .map(|j| j.streams.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn current_version(stream: &[StoredEvent]) -> u64 {
        stream.last().map(|e| e.sequence_nr).unwrap_or(0)
    }
}

fn poisoned() -> EventLogError {
    EventLogError::Unavailable("lock poisoned".to_string())
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventLogError> {
        if events.is_empty() {
            return Ok(vec![]);
        }

        let key = {
            let (entity_type, entity_id) = single_stream(&events)?;
            StreamKey::new(entity_type, entity_id)
        };

        let mut journal = self.journal.write().map_err(|_| poisoned())?;
        let Journal { streams, tags, .. } = &mut *journal;

        let stream = streams.entry(key).or_default();
        let current = Self::current_version(stream);
        if !expected.matches(current) {
            return Err(EventLogError::Concurrency(format!(
                "expected {expected:?}, found {current}"
            )));
        }

        let tagged = tags.entry(events[0].tag.clone()).or_default();
        let mut next = current + 1;
        let mut next_offset = tagged.len() as i64 + 1;
        let mut committed = Vec::with_capacity(events.len());
        for e in events {
            let stored = StoredEvent {
                event_id: e.event_id,
                entity_type: e.entity_type,
                entity_id: e.entity_id,
                sequence_nr: next,
                tag: e.tag,
                offset: Offset::Sequence(next_offset),
                event_type: e.event_type,
                event_version: e.event_version,
                occurred_at: e.occurred_at,
                payload: e.payload,
            };
            next += 1;
            next_offset += 1;
            stream.push(stored.clone());
            tagged.push(stored.clone());
            committed.push(stored);
        }

        Ok(committed)
    }

    async fn load(
        &self,
        entity_type: &str,
        entity_id: &EntityId,
        after_sequence_nr: u64,
    ) -> Result<Vec<StoredEvent>, EventLogError> {
        let journal = self.journal.read().map_err(|_| poisoned())?;
        Ok(journal
            .streams
            .get(&StreamKey::new(entity_type, entity_id))
            .map(|stream| {
                stream
                    .iter()
                    .filter(|e| e.sequence_nr > after_sequence_nr)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn events_by_tag(
        &self,
        tag: &AggregateEventTag,
        after: Offset,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, EventLogError> {
        // Offsets are dense, so Sequence(n) sits at index n - 1.
        let start = match after {
            Offset::NoOffset => 0,
            Offset::Sequence(n) => n.max(0) as usize,
            Offset::TimeBasedUuid(_) => {
                return Err(EventLogError::InvalidAppend(format!(
                    "tag '{tag}' is sequence-ordered, got {after}"
                )));
            }
        };

        let journal = self.journal.read().map_err(|_| poisoned())?;
        let Some(tagged) = journal.tags.get(tag) else {
            return Ok(vec![]);
        };

        Ok(tagged.iter().skip(start).take(limit).cloned().collect())
    }

    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<(), EventLogError> {
        let mut journal = self.journal.write().map_err(|_| poisoned())?;
        let key = StreamKey::new(&snapshot.entity_type, &snapshot.entity_id);
        match journal.snapshots.get(&key) {
            Some(existing) if existing.sequence_nr > snapshot.sequence_nr => {}
            _ => {
                journal.snapshots.insert(key, snapshot);
            }
        }
        Ok(())
    }

    async fn load_snapshot(
        &self,
        entity_type: &str,
        entity_id: &EntityId,
    ) -> Result<Option<Snapshot>, EventLogError> {
        let journal = self.journal.read().map_err(|_| poisoned())?;
        Ok(journal
            .snapshots
            .get(&StreamKey::new(entity_type, entity_id))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use keel_core::EventId;
    use serde_json::json;

    fn event(entity_id: &str, tag: &str, n: u32) -> UncommittedEvent {
        UncommittedEvent {
            event_id: EventId::new(),
            entity_type: "Test".to_string(),
            entity_id: EntityId::new(entity_id).unwrap(),
            tag: AggregateEventTag::new(tag),
            event_type: "Appended".to_string(),
            event_version: 1,
            occurred_at: Utc::now(),
            payload: json!({ "n": n }),
        }
    }

    #[tokio::test]
    async fn append_assigns_sequence_numbers_and_dense_tag_offsets() {
        let log = InMemoryEventLog::new();

        let first = log
            .append(vec![event("a", "T", 1), event("a", "T", 2)], ExpectedVersion::Exact(0))
            .await
            .unwrap();
        let second = log
            .append(vec![event("b", "T", 3)], ExpectedVersion::Exact(0))
            .await
            .unwrap();

        assert_eq!(first[0].sequence_nr, 1);
        assert_eq!(first[1].sequence_nr, 2);
        assert_eq!(second[0].sequence_nr, 1);

        let offsets: Vec<Offset> = first.iter().chain(&second).map(|e| e.offset).collect();
        assert_eq!(
            offsets,
            vec![Offset::Sequence(1), Offset::Sequence(2), Offset::Sequence(3)]
        );
    }

    #[tokio::test]
    async fn version_conflict_appends_nothing() {
        let log = InMemoryEventLog::new();
        log.append(vec![event("a", "T", 1)], ExpectedVersion::Exact(0))
            .await
            .unwrap();

        let err = log
            .append(vec![event("a", "T", 2)], ExpectedVersion::Exact(0))
            .await
            .unwrap_err();
        assert!(matches!(err, EventLogError::Concurrency(_)));

        let id = EntityId::new("a").unwrap();
        assert_eq!(log.load("Test", &id, 0).await.unwrap().len(), 1);
        assert_eq!(
            log.events_by_tag(&AggregateEventTag::new("T"), Offset::NoOffset, 10)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn mixed_stream_batch_is_rejected() {
        let log = InMemoryEventLog::new();
        let err = log
            .append(vec![event("a", "T", 1), event("b", "T", 2)], ExpectedVersion::Any)
            .await
            .unwrap_err();
        assert!(matches!(err, EventLogError::InvalidAppend(_)));
        assert!(log.is_empty());
    }

    #[tokio::test]
    async fn events_by_tag_resumes_after_offset_and_honours_limit() {
        let log = InMemoryEventLog::new();
        for n in 0..5 {
            log.append(vec![event("a", "T", n)], ExpectedVersion::Any)
                .await
                .unwrap();
        }
        log.append(vec![event("z", "Other", 0)], ExpectedVersion::Any)
            .await
            .unwrap();

        let tag = AggregateEventTag::new("T");
        let page = log.events_by_tag(&tag, Offset::Sequence(2), 2).await.unwrap();
        let offsets: Vec<Offset> = page.iter().map(|e| e.offset).collect();
        assert_eq!(offsets, vec![Offset::Sequence(3), Offset::Sequence(4)]);

        let rest = log.events_by_tag(&tag, Offset::Sequence(5), 10).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn load_skips_events_covered_by_a_snapshot() {
        let log = InMemoryEventLog::new();
        for n in 0..3 {
            log.append(vec![event("a", "T", n)], ExpectedVersion::Any)
                .await
                .unwrap();
        }
        let id = EntityId::new("a").unwrap();
        log.save_snapshot(Snapshot::of("Test", &id, 2, &json!({"count": 2})).unwrap())
            .await
            .unwrap();

        let snapshot = log.load_snapshot("Test", &id).await.unwrap().unwrap();
        assert_eq!(snapshot.sequence_nr, 2);
        let tail = log.load("Test", &id, snapshot.sequence_nr).await.unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].sequence_nr, 3);
    }

    #[tokio::test]
    async fn older_snapshot_does_not_replace_newer() {
        let log = InMemoryEventLog::new();
        let id = EntityId::new("a").unwrap();
        log.save_snapshot(Snapshot::of("Test", &id, 5, &json!(5)).unwrap())
            .await
            .unwrap();
        log.save_snapshot(Snapshot::of("Test", &id, 3, &json!(3)).unwrap())
            .await
            .unwrap();
        let snapshot = log.load_snapshot("Test", &id).await.unwrap().unwrap();
        assert_eq!(snapshot.sequence_nr, 5);
    }
}
