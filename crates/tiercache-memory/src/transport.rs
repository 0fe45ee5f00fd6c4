//! In-process backplane transport.
//!
//! A [`MemoryBackplaneHub`] plays the role of the shared channel: every cache
//! manager in the process gets its own [`MemoryTransport`] from the same hub.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;
use tiercache_core::backplane::{BackplaneError, BackplaneTransport};
use tokio::sync::broadcast;
use tracing::warn;

const DEFAULT_CAPACITY: usize = 1024;

/// Shared broadcast channel.
#[derive(Clone)]
pub struct MemoryBackplaneHub {
    inner: Arc<HubInner>,
}

struct HubInner {
    sender: RwLock<broadcast::Sender<Bytes>>,
    capacity: usize,
    fail_publish: AtomicBool,
}

impl Default for MemoryBackplaneHub {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackplaneHub {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(HubInner {
                sender: RwLock::new(sender),
                capacity,
                fail_publish: AtomicBool::new(false),
            }),
        }
    }

    /// A transport attached to this hub.
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            hub: self.clone(),
            name: "memory".to_string(),
        }
    }

    /// Makes every publish fail until reset.
    pub fn set_publish_failure(&self, fail: bool) {
        self.inner.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Drops every open subscription, as a broker restart would.
    pub fn reset_connections(&self) {
        let (sender, _) = broadcast::channel(self.inner.capacity);
        *self.inner.sender.write() = sender;
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.sender.read().receiver_count()
    }
}

/// One participant's connection to a [`MemoryBackplaneHub`].
pub struct MemoryTransport {
    hub: MemoryBackplaneHub,
    name: String,
}

#[async_trait]
impl BackplaneTransport for MemoryTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, payload: Bytes) -> Result<(), BackplaneError> {
        if self.hub.inner.fail_publish.load(Ordering::SeqCst) {
            return Err(BackplaneError::Publish("hub refused message".to_string()));
        }
        // No subscribers is not an error; the message is just lost.
        let _ = self.hub.inner.sender.read().send(payload);
        Ok(())
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, Bytes>, BackplaneError> {
        let receiver = self.hub.inner.sender.read().subscribe();
        let stream = stream::unfold(receiver, |mut rx| async move {
            match rx.recv().await {
                Ok(payload) => Some((payload, rx)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "memory backplane subscriber lagged, dropping subscription");
                    None
                }
                Err(broadcast::error::RecvError::Closed) => None,
            }
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let hub = MemoryBackplaneHub::new();
        let a = hub.transport();
        let b = hub.transport();

        let mut sub_a = a.subscribe().await.unwrap();
        let mut sub_b = b.subscribe().await.unwrap();

        a.publish(Bytes::from_static(b"hello")).await.unwrap();

        assert_eq!(sub_a.next().await.unwrap(), Bytes::from_static(b"hello"));
        assert_eq!(sub_b.next().await.unwrap(), Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn test_publish_failure_toggle() {
        let hub = MemoryBackplaneHub::new();
        let t = hub.transport();

        hub.set_publish_failure(true);
        assert!(matches!(
            t.publish(Bytes::from_static(b"x")).await,
            Err(BackplaneError::Publish(_))
        ));

        hub.set_publish_failure(false);
        assert!(t.publish(Bytes::from_static(b"x")).await.is_ok());
    }

    #[tokio::test]
    async fn test_reset_ends_open_streams() {
        let hub = MemoryBackplaneHub::new();
        let t = hub.transport();
        let mut sub = t.subscribe().await.unwrap();
        assert_eq!(hub.subscriber_count(), 1);

        hub.reset_connections();

        assert!(sub.next().await.is_none());
        let mut fresh = t.subscribe().await.unwrap();
        t.publish(Bytes::from_static(b"again")).await.unwrap();
        assert_eq!(fresh.next().await.unwrap(), Bytes::from_static(b"again"));
    }
}
