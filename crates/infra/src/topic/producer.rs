use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use tokio::sync::watch;
use tracing::{debug, info};

use keel_events::{AggregateEventTag, Event, EventEnvelope, Offset, OffsetTracker, TopicSink};

use crate::config::ProjectionConfig;
use crate::event_log::{EventLog, event_stream};
use crate::offset_store::{OffsetDao, OffsetStore};
use crate::projection::supervisor::shutdown_requested;
use crate::projection::{ProjectionError, TagProcessor};
use crate::restart::RestartBackoff;

/// A message ready for the broker, correlated with the offset it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage<M> {
    /// Partition key; producers built from the event log use the entity id.
    pub key: String,
    pub message: M,
    pub offset: Offset,
}

pub type OutboundStream<M> = BoxStream<'static, Result<OutboundMessage<M>, ProjectionError>>;

/// Per-tag source: given the committed offset, the messages after it.
pub type SourceFn<M> = Arc<dyn Fn(&AggregateEventTag, Offset) -> OutboundStream<M> + Send + Sync>;

/// Republishes a tagged stream to a [`TopicSink`].
///
/// The offset of a message is committed only after the sink acknowledged
/// it. A failed publish fails the tag's stream, which restarts from the last
/// committed offset; messages may be published more than once.
pub struct TopicProducer<M> {
    topic_id: String,
    tags: Vec<AggregateEventTag>,
    source: SourceFn<M>,
    sink: Arc<dyn TopicSink<M>>,
    offsets: Arc<dyn OffsetStore>,
    backoff: RestartBackoff,
}

impl<M> std::fmt::Debug for TopicProducer<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicProducer")
            .field("topic_id", &self.topic_id)
            .field("tags", &self.tags)
            .finish()
    }
}

impl<M: Send + Sync + 'static> TopicProducer<M> {
    pub fn tagged_stream(
        topic_id: impl Into<String>,
        tags: Vec<AggregateEventTag>,
        source: SourceFn<M>,
        sink: Arc<dyn TopicSink<M>>,
        offsets: Arc<dyn OffsetStore>,
    ) -> Self {
        Self {
            topic_id: topic_id.into(),
            tags,
            source,
            sink,
            offsets,
            backoff: RestartBackoff::default(),
        }
    }

    /// Producer over the persisted events of `Ev`, one stream per tag.
    ///
    /// `translate` maps an internal event to the public message; `None`
    /// keeps the event off the topic.
    pub fn from_event_log<Ev, F>(
        topic_id: impl Into<String>,
        log: Arc<dyn EventLog>,
        translate: F,
        sink: Arc<dyn TopicSink<M>>,
        offsets: Arc<dyn OffsetStore>,
        config: &ProjectionConfig,
    ) -> Self
    where
        Ev: Event,
        F: Fn(&EventEnvelope<Ev>) -> Option<M> + Send + Sync + 'static,
    {
        let translate = Arc::new(translate);
        let poll_interval = config.poll_interval;
        let page_size = config.page_size;

        let source: SourceFn<M> = Arc::new(move |tag, from| {
            let translate = translate.clone();
            event_stream(log.clone(), tag.clone(), from, poll_interval, page_size)
                .filter_map(move |next| {
                    let item = match next {
                        Err(err) => Some(Err(ProjectionError::from(err))),
                        Ok(stored) => match stored.decode::<Ev>() {
                            Err(err) => Some(Err(ProjectionError::Decode {
                                event_type: stored.event_type.clone(),
                                offset: stored.offset,
                                reason: err.to_string(),
                            })),
                            Ok(envelope) => translate(&envelope).map(|message| {
                                Ok(OutboundMessage {
                                    key: envelope.entity_id().to_string(),
                                    message,
                                    offset: envelope.offset(),
                                })
                            }),
                        },
                    };
                    futures_util::future::ready(item)
                })
                .boxed()
        });

        Self::tagged_stream(topic_id, Ev::aggregate_tagger().all_tags(), source, sink, offsets)
            .with_backoff(config.backoff)
    }

    pub fn with_backoff(mut self, backoff: RestartBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn topic_id(&self) -> &str {
        &self.topic_id
    }

    pub async fn run(
        &self,
        tag: &AggregateEventTag,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ProjectionError> {
        let dao = OffsetDao::prepare(self.offsets.clone(), &self.topic_id, tag).await?;
        let start = dao.loaded_offset();
        info!(topic = %self.topic_id, tag = %tag, offset = %start, "topic producer started");

        let mut tracker = OffsetTracker::new(tag.clone(), start);
        let mut messages = (self.source)(tag, start);
        loop {
            tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => return Ok(()),
                next = messages.next() => match next {
                    Some(Ok(outbound)) => {
                        tracker.check(tag, &outbound.offset)?;
                        self.sink
                            .publish(&outbound.key, &outbound.message)
                            .await
                            .map_err(|source| ProjectionError::Publish {
                                tag: tag.clone(),
                                offset: outbound.offset,
                                source,
                            })?;
                        dao.save(outbound.offset).await?;
                        tracker.observe(tag, outbound.offset)?;
                        debug!(topic = %self.topic_id, tag = %tag, offset = %outbound.offset, key = %outbound.key, "published");
                    }
                    Some(Err(err)) => return Err(err),
                    None => return Ok(()),
                },
            }
        }
    }
}

#[async_trait]
impl<M: Send + Sync + 'static> TagProcessor for TopicProducer<M> {
    fn name(&self) -> &str {
        &self.topic_id
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use keel_core::{EntityId, ExpectedVersion};
    use keel_events::InMemoryTopic;

    use crate::event_log::{InMemoryEventLog, UncommittedEvent};
    use crate::offset_store::{InMemoryReadSide, OffsetKey};
    use crate::test_entity::TestEvent;

    fn id(s: &str) -> EntityId {
        EntityId::new(s).unwrap()
    }

    async fn append(log: &InMemoryEventLog, entity: &str, event: TestEvent) {
        let batch = vec![UncommittedEvent::from_typed("test", &id(entity), &event).unwrap()];
        log.append(batch, ExpectedVersion::Any).await.unwrap();
    }

    fn producer(
        log: Arc<InMemoryEventLog>,
        topic: Arc<InMemoryTopic<String>>,
        offsets: Arc<InMemoryReadSide>,
    ) -> TopicProducer<String> {
        let config = ProjectionConfig::default().with_poll_interval(Duration::from_millis(5));
        TopicProducer::from_event_log(
            "elements-topic",
            log,
            |env: &EventEnvelope<TestEvent>| match env.payload() {
                TestEvent::Appended(e) | TestEvent::Prepended(e) => Some(e.clone()),
                _ => None,
            },
            topic,
            offsets,
            &config,
        )
    }

    async fn wait_for(topic: &InMemoryTopic<String>, n: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while topic.len() < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn translated_events_are_published_keyed_by_entity() {
        let log = Arc::new(InMemoryEventLog::new());
        let topic = Arc::new(InMemoryTopic::new());
        let offsets = Arc::new(InMemoryReadSide::new());
        append(&log, "1", TestEvent::Appended("A".into())).await;
        append(&log, "1", TestEvent::InPrependMode).await;
        append(&log, "1", TestEvent::Prepended("b".into())).await;

        let producer = producer(log, topic.clone(), offsets.clone());
        let tag = TestEvent::aggregate_tagger().tag_for(&id("1"));
        let (stop, shutdown) = watch::channel(false);
        let t = tag.clone();
        let task = tokio::spawn(async move { producer.run(&t, shutdown).await });

        wait_for(&topic, 2).await;
        stop.send(true).unwrap();
        task.await.unwrap().unwrap();

        let published = topic.published();
        assert_eq!(published.iter().map(|p| p.message.as_str()).collect::<Vec<_>>(), vec!["A", "b"]);
        assert!(published.iter().all(|p| p.key == "1"));
        assert_eq!(
            offsets.offset(&OffsetKey::new("elements-topic", tag)),
            Some(Offset::Sequence(3))
        );
    }

    #[tokio::test]
    async fn failed_publish_keeps_the_offset_for_redelivery() {
        let log = Arc::new(InMemoryEventLog::new());
        let topic = Arc::new(InMemoryTopic::new());
        let offsets = Arc::new(InMemoryReadSide::new());
        let tag = TestEvent::aggregate_tagger().tag_for(&id("1"));
        append(&log, "1", TestEvent::Appended("A".into())).await;

        topic.set_failing(true);
        let producer = producer(log.clone(), topic.clone(), offsets.clone());
        let (_stop, shutdown) = watch::channel(false);
        let err = producer.run(&tag, shutdown).await.unwrap_err();
        assert!(matches!(err, ProjectionError::Publish { .. }));
        assert_eq!(offsets.offset(&OffsetKey::new("elements-topic", tag.clone())), None);

        topic.set_failing(false);
        let (stop, shutdown) = watch::channel(false);
        let t = tag.clone();
        let task = tokio::spawn(async move { producer.run(&t, shutdown).await });
        wait_for(&topic, 1).await;
        stop.send(true).unwrap();
        task.await.unwrap().unwrap();
        assert_eq!(topic.published()[0].message, "A");
    }
}
