//! Publish/subscribe transport underneath the backplane.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;

/// Errors that can occur on the backplane transport.
#[derive(Debug, thiserror::Error)]
pub enum BackplaneError {
    #[error("Backplane connection error: {0}")]
    Connection(String),

    #[error("Backplane subscribe error: {0}")]
    Subscribe(String),

    #[error("Backplane publish error: {0}")]
    Publish(String),

    #[error("Backplane stream ended")]
    StreamEnded,
}

/// A shared channel every participating instance publishes to and listens on.
///
/// Delivery is best effort. Payloads are opaque chunks produced by
/// [`encode_chunk`](super::encode_chunk).
#[async_trait]
pub trait BackplaneTransport: Send + Sync {
    fn name(&self) -> &str;

    async fn publish(&self, payload: Bytes) -> Result<(), BackplaneError>;

    /// Opens a subscription. The stream ending means the connection was lost.
    async fn subscribe(&self) -> Result<BoxStream<'static, Bytes>, BackplaneError>;
}
