//! Backplane transport on Redis pub/sub.

use async_trait::async_trait;
use bytes::Bytes;
use deadpool_redis::Pool;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use redis::AsyncCommands;
use tiercache_core::backplane::{BackplaneError, BackplaneTransport};
use tracing::info;

/// Publishes on a pooled connection and subscribes on a dedicated client,
/// since a connection in subscriber mode cannot issue other commands.
pub struct RedisBackplaneTransport {
    pool: Pool,
    redis_url: String,
    channel: String,
}

impl RedisBackplaneTransport {
    pub fn new(pool: Pool, redis_url: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            pool,
            redis_url: redis_url.into(),
            channel: channel.into(),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

#[async_trait]
impl BackplaneTransport for RedisBackplaneTransport {
    fn name(&self) -> &str {
        "redis"
    }

    async fn publish(&self, payload: Bytes) -> Result<(), BackplaneError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| BackplaneError::Connection(e.to_string()))?;

        conn.publish::<_, _, ()>(&self.channel, payload.as_ref())
            .await
            .map_err(|e| BackplaneError::Publish(e.to_string()))
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, Bytes>, BackplaneError> {
        let client = redis::Client::open(self.redis_url.as_str())
            .map_err(|e| BackplaneError::Connection(e.to_string()))?;

        let mut pubsub = client
            .get_async_pubsub()
            .await
            .map_err(|e| BackplaneError::Connection(e.to_string()))?;

        pubsub
            .subscribe(&self.channel)
            .await
            .map_err(|e| BackplaneError::Subscribe(e.to_string()))?;

        info!(channel = %self.channel, "Subscribed to backplane channel");

        let stream = pubsub
            .into_on_message()
            .map(|msg| Bytes::copy_from_slice(msg.get_payload_bytes()));
        Ok(stream.boxed())
    }
}
