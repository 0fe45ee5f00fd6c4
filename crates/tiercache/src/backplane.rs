//! Backplane engine: outbound batching and the inbound listener.
//!
//! ## Outbound
//!
//! Mutations enqueue a [`BackplaneMessage`] and return immediately. A flush
//! task drains the queue in batches, encodes each batch as one chunk and
//! publishes it. When the queue is full, pending messages are replaced by a
//! single `Clear`, which peers apply as a coarser but safe invalidation. A
//! failed publish is logged and answered with the same `Clear` once the
//! transport recovers.
//!
//! ## Inbound
//!
//! The listener subscribes to the transport, decodes chunks, drops messages
//! carrying this instance's owner id and hands the rest to the manager. When
//! the subscription is lost it reconnects with exponential backoff; since
//! messages may have been missed meanwhile, the manager is asked to resync
//! after every reconnect.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tiercache_core::CacheError;
use tiercache_core::backplane::{
    BackplaneAction, BackplaneMessage, BackplaneTransport, OwnerId, decode_chunk, encode_chunk,
};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::BackplaneConfig;
use crate::metrics;

/// Tuning for the backplane engine.
#[derive(Debug, Clone)]
pub struct BackplaneOptions {
    pub queue_capacity: usize,
    pub max_batch: usize,
    pub flush_interval: Duration,
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
}

impl Default for BackplaneOptions {
    fn default() -> Self {
        BackplaneOptions::from(&BackplaneConfig::default())
    }
}

impl From<&BackplaneConfig> for BackplaneOptions {
    fn from(cfg: &BackplaneConfig) -> Self {
        Self {
            queue_capacity: cfg.queue_capacity.max(1),
            max_batch: cfg.max_batch.max(1),
            flush_interval: Duration::from_millis(cfg.flush_interval_ms),
            reconnect_min: Duration::from_millis(cfg.reconnect_min_ms.max(1)),
            reconnect_max: Duration::from_millis(cfg.reconnect_max_ms.max(cfg.reconnect_min_ms)),
        }
    }
}

/// Receiver side of the backplane, implemented by the manager.
#[async_trait]
pub(crate) trait InvalidationTarget: Send + Sync {
    /// Applies a message published by another instance.
    async fn apply_remote(&self, action: &BackplaneAction);

    /// Drops everything messages could have invalidated while disconnected.
    async fn resync(&self);
}

/// Counters for the backplane of one manager.
#[derive(Debug, Default)]
pub struct BackplaneStats {
    sent: AtomicU64,
    received: AtomicU64,
    dropped: AtomicU64,
    decode_errors: AtomicU64,
    send_failures: AtomicU64,
}

/// Point-in-time copy of [`BackplaneStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackplaneStatsSnapshot {
    pub sent: u64,
    pub received: u64,
    pub dropped: u64,
    pub decode_errors: u64,
    pub send_failures: u64,
}

impl BackplaneStats {
    pub fn snapshot(&self) -> BackplaneStatsSnapshot {
        BackplaneStatsSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Default)]
struct OutboundQueue {
    pending: VecDeque<BackplaneMessage>,
    seen: HashSet<BackplaneMessage>,
    /// A `Clear` is pending, which subsumes every other message.
    clearing: bool,
}

impl OutboundQueue {
    fn push(&mut self, message: BackplaneMessage) -> bool {
        if self.clearing {
            return false;
        }
        if matches!(message.action, BackplaneAction::Clear) {
            self.pending.clear();
            self.seen.clear();
            self.clearing = true;
        } else if !self.seen.insert(message.clone()) {
            return false;
        }
        self.pending.push_back(message);
        true
    }

    fn drain(&mut self, max: usize) -> Vec<BackplaneMessage> {
        let n = self.pending.len().min(max);
        let batch: Vec<_> = self.pending.drain(..n).collect();
        for message in &batch {
            self.seen.remove(message);
            if matches!(message.action, BackplaneAction::Clear) {
                self.clearing = false;
            }
        }
        batch
    }

    fn len(&self) -> usize {
        self.pending.len()
    }
}

struct Shared {
    cache: String,
    owner: OwnerId,
    transport: Arc<dyn BackplaneTransport>,
    options: BackplaneOptions,
    queue: Mutex<OutboundQueue>,
    notify: Notify,
    stats: BackplaneStats,
    cancel: CancellationToken,
}

/// The running backplane of one cache manager.
pub struct Backplane {
    shared: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Backplane {
    /// Subscribes and spawns the flush and listener tasks.
    ///
    /// A failing first subscription is logged and retried in the background;
    /// the cache works without the backplane until it connects.
    pub(crate) async fn start(
        cache: &str,
        owner: OwnerId,
        transport: Arc<dyn BackplaneTransport>,
        options: BackplaneOptions,
        target: Arc<dyn InvalidationTarget>,
    ) -> Self {
        let shared = Arc::new(Shared {
            cache: cache.to_string(),
            owner,
            transport,
            options,
            queue: Mutex::new(OutboundQueue::default()),
            notify: Notify::new(),
            stats: BackplaneStats::default(),
            cancel: CancellationToken::new(),
        });

        let initial = match shared.transport.subscribe().await {
            Ok(stream) => {
                info!(cache = %shared.cache, transport = %shared.transport.name(), owner = %owner, "Backplane subscribed");
                Some(stream)
            }
            Err(e) => {
                error!(cache = %shared.cache, error = %e, "Backplane subscribe failed, retrying in background");
                None
            }
        };

        let flusher = tokio::spawn(flush_loop(Arc::clone(&shared)));
        let listener = tokio::spawn(listen_loop(Arc::clone(&shared), target, initial));

        Self {
            shared,
            tasks: Mutex::new(vec![flusher, listener]),
        }
    }

    pub fn owner_id(&self) -> OwnerId {
        self.shared.owner
    }

    pub fn transport_name(&self) -> &str {
        self.shared.transport.name()
    }

    pub fn stats(&self) -> BackplaneStatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Number of messages waiting to be published.
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Queues a message for publishing. Never blocks on the transport.
    pub(crate) fn send(&self, action: BackplaneAction) {
        let message = BackplaneMessage {
            owner: self.shared.owner,
            action,
        };
        enqueue(&self.shared, message);
    }

    /// Stops both tasks after publishing what is still queued.
    pub(crate) async fn shutdown(&self) {
        self.shared.cancel.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(cache = %self.shared.cache, error = %e, "Backplane task ended abnormally");
            }
        }
    }
}

impl Drop for Backplane {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

fn enqueue(shared: &Shared, message: BackplaneMessage) {
    {
        let mut queue = shared.queue.lock();
        if queue.len() >= shared.options.queue_capacity {
            let dropped = queue.len();
            queue.push(BackplaneMessage::clear(shared.owner));
            shared.stats.dropped.fetch_add(dropped as u64, Ordering::Relaxed);
            metrics::record_backplane_dropped(&shared.cache, dropped);
            warn!(
                cache = %shared.cache,
                dropped,
                "Backplane queue full, collapsing pending messages into a clear"
            );
        } else {
            queue.push(message);
        }
    }
    shared.notify.notify_one();
}

async fn flush_loop(shared: Arc<Shared>) {
    let mut failures = 0u32;
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = shared.notify.notified() => {}
        }

        // Let a burst accumulate into one chunk.
        if !shared.options.flush_interval.is_zero() {
            tokio::select! {
                _ = shared.cancel.cancelled() => break,
                _ = tokio::time::sleep(shared.options.flush_interval) => {}
            }
        }

        if flush_pending(&shared).await {
            failures = 0;
        } else {
            failures += 1;
            let delay = backoff(&shared.options, failures);
            tokio::select! {
                _ = shared.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            shared.notify.notify_one();
        }
    }

    // Best effort: publish what is left before stopping.
    flush_pending(&shared).await;
}

/// Publishes everything queued. Returns false if a publish failed.
async fn flush_pending(shared: &Shared) -> bool {
    loop {
        let batch = shared.queue.lock().drain(shared.options.max_batch);
        if batch.is_empty() {
            return true;
        }

        let payload = encode_chunk(&batch);
        match shared.transport.publish(payload).await {
            Ok(()) => {
                shared.stats.sent.fetch_add(batch.len() as u64, Ordering::Relaxed);
                metrics::record_backplane_sent(&shared.cache, batch.len());
                debug!(cache = %shared.cache, messages = batch.len(), "Backplane chunk published");
            }
            Err(e) => {
                let err = CacheError::backplane_send(e.to_string());
                shared.stats.send_failures.fetch_add(1, Ordering::Relaxed);
                metrics::record_backplane_send_failure(&shared.cache);
                warn!(
                    cache = %shared.cache,
                    error = %err,
                    lost = batch.len(),
                    "Backplane publish failed, peers will be told to clear"
                );
                shared.queue.lock().push(BackplaneMessage::clear(shared.owner));
                return false;
            }
        }
    }
}

fn backoff(options: &BackplaneOptions, attempt: u32) -> Duration {
    let factor = 1u32 << attempt.saturating_sub(1).min(16);
    options
        .reconnect_min
        .saturating_mul(factor)
        .min(options.reconnect_max)
}

async fn listen_loop(
    shared: Arc<Shared>,
    target: Arc<dyn InvalidationTarget>,
    initial: Option<futures_util::stream::BoxStream<'static, bytes::Bytes>>,
) {
    let mut stream = initial;
    let mut failures = 0u32;
    let mut connected_once = stream.is_some();

    loop {
        let mut current = match stream.take() {
            Some(s) => s,
            None => match shared.transport.subscribe().await {
                Ok(s) => {
                    info!(cache = %shared.cache, "Backplane resubscribed");
                    failures = 0;
                    if connected_once {
                        target.resync().await;
                    }
                    connected_once = true;
                    s
                }
                Err(e) => {
                    failures += 1;
                    let delay = backoff(&shared.options, failures);
                    error!(
                        cache = %shared.cache,
                        error = %e,
                        backoff_ms = delay.as_millis() as u64,
                        "Backplane subscribe failed, reconnecting..."
                    );
                    tokio::select! {
                        _ = shared.cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
            },
        };

        loop {
            let next = tokio::select! {
                _ = shared.cancel.cancelled() => return,
                next = current.next() => next,
            };
            match next {
                Some(payload) => handle_chunk(&shared, target.as_ref(), &payload).await,
                None => break,
            }
        }

        failures += 1;
        let delay = backoff(&shared.options, failures);
        error!(
            cache = %shared.cache,
            backoff_ms = delay.as_millis() as u64,
            "Backplane subscription lost, reconnecting..."
        );
        tokio::select! {
            _ = shared.cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn handle_chunk(shared: &Shared, target: &dyn InvalidationTarget, payload: &[u8]) {
    let decoded = decode_chunk(payload);

    for e in &decoded.errors {
        shared.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
        metrics::record_backplane_decode_error(&shared.cache);
        warn!(cache = %shared.cache, error = %e, "Skipping undecodable backplane record");
    }

    for message in decoded.messages {
        if message.owner == shared.owner {
            continue;
        }
        shared.stats.received.fetch_add(1, Ordering::Relaxed);
        metrics::record_backplane_received(&shared.cache);
        debug!(cache = %shared.cache, from = %message.owner, action = ?message.action, "Backplane message received");
        target.apply_remote(&message.action).await;
    }
}
