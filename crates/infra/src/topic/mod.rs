//! Topic producers: republish tagged event streams to a message broker.

pub mod producer;
#[cfg(feature = "redis")]
pub mod redis_streams;

pub use producer::{OutboundMessage, OutboundStream, SourceFn, TopicProducer};
#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamsSink;
