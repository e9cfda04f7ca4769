//! Redis Streams topic sink.
//!
//! Each publish is one `XADD <stream> * key <key> payload <json>`; Redis
//! confirms the write before `publish` returns, which is the ack the topic
//! producer commits its offset on. Consumers read the stream with their own
//! consumer groups; that side lives outside this crate.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{instrument, warn};

use keel_events::{PublishError, TopicSink};

pub struct RedisStreamsSink<M> {
    client: Arc<redis::Client>,
    stream_key: String,
    /// Reused across publishes; dropped after a failed command so the next
    /// publish reconnects.
    connection: Mutex<Option<MultiplexedConnection>>,
    _message: PhantomData<fn(&M)>,
}

impl<M> std::fmt::Debug for RedisStreamsSink<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamsSink")
            .field("stream_key", &self.stream_key)
            .finish()
    }
}

impl<M> RedisStreamsSink<M> {
    /// `redis_url` like `redis://localhost:6379`; the stream is created by
    /// the first XADD.
    pub fn new(redis_url: impl AsRef<str>, stream_key: impl Into<String>) -> Result<Self, PublishError> {
        let client =
            redis::Client::open(redis_url.as_ref()).map_err(|e| PublishError::Unavailable(e.to_string()))?;
        Ok(Self {
            client: Arc::new(client),
            stream_key: stream_key.into(),
            connection: Mutex::new(None),
            _message: PhantomData,
        })
    }

    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    async fn connection(&self) -> Result<MultiplexedConnection, PublishError> {
        let mut cached = self.connection.lock().await;
        if let Some(conn) = cached.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| PublishError::Unavailable(format!("connect failed: {e}")))?;
        *cached = Some(conn.clone());
        Ok(conn)
    }
}

#[async_trait]
impl<M> TopicSink<M> for RedisStreamsSink<M>
where
    M: Serialize + Send + Sync,
{
    #[instrument(skip(self, message), fields(stream_key = %self.stream_key), err)]
    async fn publish(&self, key: &str, message: &M) -> Result<(), PublishError> {
        let payload = serde_json::to_string(message).map_err(|e| PublishError::Serialization(e.to_string()))?;

        let mut conn = self.connection().await?;
        let added: Result<String, redis::RedisError> = redis::cmd("XADD")
            .arg(&self.stream_key)
            .arg("*")
            .arg("key")
            .arg(key)
            .arg("payload")
            .arg(&payload)
            .query_async(&mut conn)
            .await;

        match added {
            Ok(_id) => Ok(()),
            Err(err) => {
                if err.is_io_error() || err.is_connection_dropped() {
                    warn!(error = %err, "dropping redis connection");
                    *self.connection.lock().await = None;
                    Err(PublishError::Unavailable(format!("XADD failed: {err}")))
                } else {
                    Err(PublishError::Rejected(format!("XADD failed: {err}")))
                }
            }
        }
    }
}
