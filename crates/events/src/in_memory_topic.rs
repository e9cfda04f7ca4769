//! In-memory topic for tests/dev.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::sink::{PublishError, TopicSink};

/// A message as it was handed to the topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage<M> {
    pub key: String,
    pub message: M,
}

/// In-memory topic.
///
/// - Records every acknowledged message in publish order
/// - Best-effort fan-out to subscribers
/// - Can be switched into a failing mode to simulate an unavailable broker
#[derive(Debug)]
pub struct InMemoryTopic<M> {
    published: Mutex<Vec<PublishedMessage<M>>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<PublishedMessage<M>>>>,
    failing: AtomicBool,
}

impl<M> Default for InMemoryTopic<M> {
    fn default() -> Self {
        Self {
            published: Mutex::new(Vec::new()),
            subscribers: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
        }
    }
}

impl<M: Clone> InMemoryTopic<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// While `true`, every publish fails with [`PublishError::Unavailable`].
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Snapshot of all acknowledged messages.
    pub fn published(&self) -> Vec<PublishedMessage<M>> {
        self.published
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.published.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Receive every message acknowledged after this call.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<PublishedMessage<M>> {
        let (tx, rx) = mpsc::unbounded_channel();

        // A poisoned lock still yields a receiver; it just never gets messages.
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }
        rx
    }
}

#[async_trait]
impl<M> TopicSink<M> for InMemoryTopic<M>
where
    M: Clone + Send + Sync + 'static,
{
    async fn publish(&self, key: &str, message: &M) -> Result<(), PublishError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PublishError::Unavailable("in-memory topic is failing".to_string()));
        }

        let record = PublishedMessage {
            key: key.to_string(),
            message: message.clone(),
        };

        self.published
            .lock()
            .map_err(|_| PublishError::Unavailable("lock poisoned".to_string()))?
            .push(record.clone());

        if let Ok(mut subs) = self.subscribers.lock() {
            // Drop any dead subscribers while publishing.
            subs.retain(|tx| tx.send(record.clone()).is_ok());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_and_fans_out_acknowledged_messages() {
        let topic = InMemoryTopic::<String>::new();
        let mut rx = topic.subscribe();

        topic.publish("k1", &"hello".to_string()).await.unwrap();

        assert_eq!(topic.len(), 1);
        let got = rx.recv().await.unwrap();
        assert_eq!(got.key, "k1");
        assert_eq!(got.message, "hello");
    }

    #[tokio::test]
    async fn failing_topic_rejects_without_recording() {
        let topic = InMemoryTopic::<u32>::new();
        topic.set_failing(true);
        assert!(matches!(
            topic.publish("k", &1).await,
            Err(PublishError::Unavailable(_))
        ));
        assert!(topic.is_empty());

        topic.set_failing(false);
        topic.publish("k", &2).await.unwrap();
        assert_eq!(topic.published()[0].message, 2);
    }
}
