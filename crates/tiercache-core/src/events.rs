//! Cache events and the handler registry.
//!
//! Every event carries an [`Origin`]: `Local` when it was caused by a call on
//! this cache instance, `Remote` when a backplane message from another
//! instance caused it. Consumers that react to events by writing to the cache
//! must ignore `Remote` events or they will echo each other forever.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::error;

use crate::handle::EvictionReason;
use crate::key::CacheKey;

/// Where a change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    Local,
    Remote,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Remote => write!(f, "remote"),
        }
    }
}

/// Event kinds, used to filter subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheEventKind {
    Add,
    Get,
    Put,
    Remove,
    Update,
    RemoveByHandle,
    Clear,
    ClearRegion,
}

/// Something that happened to the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    Add { key: CacheKey, origin: Origin },
    Get { key: CacheKey, origin: Origin },
    Put { key: CacheKey, origin: Origin },
    Remove { key: CacheKey, origin: Origin },
    Update { key: CacheKey, origin: Origin },
    /// A tier dropped the item on its own.
    RemoveByHandle {
        key: CacheKey,
        reason: EvictionReason,
        /// Position of the tier that evicted the item.
        tier: usize,
    },
    Clear { origin: Origin },
    ClearRegion { region: String, origin: Origin },
}

impl CacheEvent {
    pub fn kind(&self) -> CacheEventKind {
        match self {
            Self::Add { .. } => CacheEventKind::Add,
            Self::Get { .. } => CacheEventKind::Get,
            Self::Put { .. } => CacheEventKind::Put,
            Self::Remove { .. } => CacheEventKind::Remove,
            Self::Update { .. } => CacheEventKind::Update,
            Self::RemoveByHandle { .. } => CacheEventKind::RemoveByHandle,
            Self::Clear { .. } => CacheEventKind::Clear,
            Self::ClearRegion { .. } => CacheEventKind::ClearRegion,
        }
    }

    pub fn origin(&self) -> Origin {
        match self {
            Self::Add { origin, .. }
            | Self::Get { origin, .. }
            | Self::Put { origin, .. }
            | Self::Remove { origin, .. }
            | Self::Update { origin, .. }
            | Self::Clear { origin }
            | Self::ClearRegion { origin, .. } => *origin,
            Self::RemoveByHandle { .. } => Origin::Local,
        }
    }

    pub fn key(&self) -> Option<&CacheKey> {
        match self {
            Self::Add { key, .. }
            | Self::Get { key, .. }
            | Self::Put { key, .. }
            | Self::Remove { key, .. }
            | Self::Update { key, .. }
            | Self::RemoveByHandle { key, .. } => Some(key),
            Self::Clear { .. } | Self::ClearRegion { .. } => None,
        }
    }

    pub fn region(&self) -> Option<&str> {
        match self {
            Self::ClearRegion { region, .. } => Some(region),
            _ => self.key().and_then(CacheKey::region),
        }
    }
}

/// Handle returned by [`EventRegistry::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type EventHandler = Arc<dyn Fn(&CacheEvent) + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    kind: Option<CacheEventKind>,
    handler: EventHandler,
}

/// Registry of event handlers.
///
/// Handlers run synchronously on the thread that raised the event, outside
/// of the registry lock, so a handler may subscribe or unsubscribe.
#[derive(Default)]
pub struct EventRegistry {
    subscriptions: RwLock<Vec<Subscription>>,
    next_id: AtomicU64,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for one kind of event, or all kinds when `kind` is `None`.
    pub fn subscribe<F>(&self, kind: Option<CacheEventKind>, handler: F) -> SubscriptionId
    where
        F: Fn(&CacheEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscriptions.write().push(Subscription {
            id,
            kind,
            handler: Arc::new(handler),
        });
        id
    }

    /// Removes a handler. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscriptions = self.subscriptions.write();
        let before = subscriptions.len();
        subscriptions.retain(|s| s.id != id);
        subscriptions.len() != before
    }

    pub fn handler_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    /// Delivers the event to every matching handler. Returns how many ran.
    ///
    /// A panicking handler is logged and does not affect the others.
    pub fn emit(&self, event: &CacheEvent) -> usize {
        let handlers: Vec<EventHandler> = {
            let subscriptions = self.subscriptions.read();
            if subscriptions.is_empty() {
                return 0;
            }
            subscriptions
                .iter()
                .filter(|s| s.kind.is_none_or(|k| k == event.kind()))
                .map(|s| Arc::clone(&s.handler))
                .collect()
        };

        for handler in &handlers {
            if std::panic::catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                error!(kind = ?event.kind(), "cache event handler panicked");
            }
        }
        handlers.len()
    }
}

impl fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRegistry")
            .field("handler_count", &self.handler_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn put_event(origin: Origin) -> CacheEvent {
        CacheEvent::Put {
            key: CacheKey::in_region("k", "r").unwrap(),
            origin,
        }
    }

    #[test]
    fn test_event_accessors() {
        let event = put_event(Origin::Remote);
        assert_eq!(event.kind(), CacheEventKind::Put);
        assert_eq!(event.origin(), Origin::Remote);
        assert_eq!(event.region(), Some("r"));

        let clear = CacheEvent::ClearRegion {
            region: "r".into(),
            origin: Origin::Local,
        };
        assert!(clear.key().is_none());
        assert_eq!(clear.region(), Some("r"));
    }

    #[test]
    fn test_subscribe_filters_by_kind() {
        let registry = EventRegistry::new();
        let puts = Arc::new(AtomicUsize::new(0));
        let all = Arc::new(AtomicUsize::new(0));

        let p = Arc::clone(&puts);
        registry.subscribe(Some(CacheEventKind::Put), move |_| {
            p.fetch_add(1, Ordering::SeqCst);
        });
        let a = Arc::clone(&all);
        registry.subscribe(None, move |_| {
            a.fetch_add(1, Ordering::SeqCst);
        });

        registry.emit(&put_event(Origin::Local));
        registry.emit(&CacheEvent::Clear {
            origin: Origin::Local,
        });

        assert_eq!(puts.load(Ordering::SeqCst), 1);
        assert_eq!(all.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unsubscribe() {
        let registry = EventRegistry::new();
        let id = registry.subscribe(None, |_| {});
        assert_eq!(registry.handler_count(), 1);
        assert!(registry.unsubscribe(id));
        assert!(!registry.unsubscribe(id));
        assert_eq!(registry.emit(&put_event(Origin::Local)), 0);
    }

    #[test]
    fn test_panicking_handler_is_isolated() {
        let registry = EventRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        registry.subscribe(None, |_| panic!("handler failure"));
        let c = Arc::clone(&calls);
        registry.subscribe(None, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(registry.emit(&put_event(Origin::Local)), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
