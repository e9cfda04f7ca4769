//! Message publishing abstraction (mechanics only).
//!
//! A [`TopicSink`] is the outbound edge of the system: the topic producer
//! republishes persisted events through it. The contract is intentionally
//! small:
//!
//! - `publish` resolves only once the broker acknowledged the message
//! - a failed publish must surface as an error, never be swallowed
//! - delivery is **at-least-once**: the same message may be published again
//!   after a restart, so downstream consumers must be idempotent
//!
//! Broker specifics (partitioning, compaction, retention) stay behind the
//! implementation.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

/// Publish failure.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("message serialization failed: {0}")]
    Serialization(String),

    #[error("publish rejected: {0}")]
    Rejected(String),
}

/// Outbound message sink with acknowledged publishing.
#[async_trait]
pub trait TopicSink<M: Send + Sync>: Send + Sync {
    /// Publish one message under a partition key; resolves after the ack.
    async fn publish(&self, key: &str, message: &M) -> Result<(), PublishError>;
}

#[async_trait]
impl<M, S> TopicSink<M> for Arc<S>
where
    M: Send + Sync,
    S: TopicSink<M> + ?Sized,
{
    async fn publish(&self, key: &str, message: &M) -> Result<(), PublishError> {
        (**self).publish(key, message).await
    }
}
