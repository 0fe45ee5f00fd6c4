//! Bounded-retry optimistic updates.
//!
//! Tiers with native compare-and-swap are driven through a read / apply /
//! conditional-write loop. Tiers without it are updated under a per-key
//! advisory lock held by the coordinator.
//!
//! ```text
//! get_versioned ──► update_fn ──► compare_and_swap(expected)
//!       ▲                               │
//!       └──────── Conflict ◄────────────┘   (until max_retries)
//! ```

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::error::{CacheError, UpdateFailureReason};
use crate::handle::{CacheHandle, CasOutcome};
use crate::item::CacheItem;
use crate::key::CacheKey;
use crate::CacheResult;

/// Default number of attempts for an update.
pub const DEFAULT_MAX_RETRIES: u32 = 50;

/// Default wait between attempts after a transient failure.
pub const DEFAULT_RETRY_TIMEOUT: Duration = Duration::from_millis(100);

/// How an update attempt ended.
#[derive(Debug, Clone)]
pub enum UpdateOutcome<V> {
    /// The new item was stored.
    Updated(CacheItem<V>),
    /// No item existed at the time of the final attempt.
    NotFound,
    /// Every attempt lost against a concurrent writer.
    TooManyRetries,
    /// The update function returned `None`.
    Aborted,
}

/// Result of an optimistic update against one tier.
#[derive(Debug, Clone)]
pub struct UpdateItemResult<V> {
    outcome: UpdateOutcome<V>,
    version_conflict_detected: bool,
    tries_used: u32,
}

impl<V> UpdateItemResult<V> {
    pub fn new(outcome: UpdateOutcome<V>, version_conflict_detected: bool, tries_used: u32) -> Self {
        Self {
            outcome,
            version_conflict_detected,
            tries_used,
        }
    }

    pub fn success(&self) -> bool {
        matches!(self.outcome, UpdateOutcome::Updated(_))
    }

    pub fn version_conflict_detected(&self) -> bool {
        self.version_conflict_detected
    }

    pub fn tries_used(&self) -> u32 {
        self.tries_used
    }

    pub fn outcome(&self) -> &UpdateOutcome<V> {
        &self.outcome
    }

    /// The stored item, if the update succeeded.
    pub fn item(&self) -> Option<&CacheItem<V>> {
        match &self.outcome {
            UpdateOutcome::Updated(item) => Some(item),
            _ => None,
        }
    }

    pub fn into_item(self) -> Option<CacheItem<V>> {
        match self.outcome {
            UpdateOutcome::Updated(item) => Some(item),
            _ => None,
        }
    }

    /// Why nothing was stored, or `None` on success.
    pub fn failure_reason(&self) -> Option<UpdateFailureReason> {
        match self.outcome {
            UpdateOutcome::Updated(_) => None,
            UpdateOutcome::NotFound => Some(UpdateFailureReason::NotFound),
            UpdateOutcome::TooManyRetries => Some(UpdateFailureReason::TooManyRetries),
            UpdateOutcome::Aborted => Some(UpdateFailureReason::Aborted),
        }
    }
}

/// Per-key advisory locks for tiers without compare-and-swap.
#[derive(Default)]
pub struct KeyLocks {
    locks: Arc<DashMap<CacheKey, Arc<Mutex<()>>>>,
}

/// Holds a key lock; released on drop, including during unwinding.
pub struct KeyLockGuard {
    guard: Option<OwnedMutexGuard<()>>,
    key: CacheKey,
    locks: Arc<DashMap<CacheKey, Arc<Mutex<()>>>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &CacheKey) -> KeyLockGuard {
        let mutex = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = mutex.lock_owned().await;
        KeyLockGuard {
            guard: Some(guard),
            key: key.clone(),
            locks: Arc::clone(&self.locks),
        }
    }

    /// Number of keys with a live lock entry.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl Drop for KeyLockGuard {
    fn drop(&mut self) {
        // Release first so the map holds the last reference when nobody waits.
        self.guard.take();
        self.locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

/// Runs optimistic updates against a single tier.
pub struct UpdateCoordinator {
    max_retries: u32,
    retry_timeout: Duration,
    locks: KeyLocks,
}

impl Default for UpdateCoordinator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES, DEFAULT_RETRY_TIMEOUT)
    }
}

impl UpdateCoordinator {
    pub fn new(max_retries: u32, retry_timeout: Duration) -> Self {
        Self {
            max_retries: max_retries.max(1),
            retry_timeout,
            locks: KeyLocks::new(),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn retry_timeout(&self) -> Duration {
        self.retry_timeout
    }

    pub fn locks(&self) -> &KeyLocks {
        &self.locks
    }

    /// Applies `update_fn` to the current value of `key` in `handle`.
    ///
    /// `max_retries` overrides the coordinator default for this call.
    /// Infrastructure errors are retried within the same budget and returned
    /// once it is exhausted.
    pub async fn update<V, F>(
        &self,
        handle: &dyn CacheHandle<V>,
        key: &CacheKey,
        update_fn: F,
        max_retries: Option<u32>,
    ) -> CacheResult<UpdateItemResult<V>>
    where
        V: Clone + Send + Sync + 'static,
        F: Fn(&V) -> Option<V> + Send + Sync,
    {
        let max = max_retries.unwrap_or(self.max_retries).max(1);
        if handle.capabilities().supports_atomic_update {
            self.update_optimistic(handle, key, &update_fn, max).await
        } else {
            self.update_locked(handle, key, &update_fn, max).await
        }
    }

    async fn update_optimistic<V, F>(
        &self,
        handle: &dyn CacheHandle<V>,
        key: &CacheKey,
        update_fn: &F,
        max: u32,
    ) -> CacheResult<UpdateItemResult<V>>
    where
        V: Clone + Send + Sync + 'static,
        F: Fn(&V) -> Option<V> + Send + Sync,
    {
        let mut tries = 0u32;
        let mut conflict = false;

        loop {
            tries += 1;

            let current = match handle.get_versioned(key).await {
                Ok(Some(current)) => current,
                Ok(None) => {
                    return Ok(UpdateItemResult::new(UpdateOutcome::NotFound, conflict, tries));
                }
                Err(e) if e.is_transient() && tries < max => {
                    self.backoff(handle.name(), key, &e).await;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let Some(new_value) = update_fn(current.item.value()) else {
                return Ok(UpdateItemResult::new(UpdateOutcome::Aborted, conflict, tries));
            };
            let candidate = current.item.with_value(new_value);

            match handle.compare_and_swap(candidate.clone(), current.version).await {
                Ok(CasOutcome::Stored(version)) => {
                    debug!(tier = %handle.name(), key = %key, tries, version = %version, "update stored");
                    return Ok(UpdateItemResult::new(
                        UpdateOutcome::Updated(candidate),
                        conflict,
                        tries,
                    ));
                }
                Ok(CasOutcome::Conflict) => {
                    conflict = true;
                    if tries >= max {
                        warn!(tier = %handle.name(), key = %key, tries, "update gave up after version conflicts");
                        return Ok(UpdateItemResult::new(
                            UpdateOutcome::TooManyRetries,
                            true,
                            tries,
                        ));
                    }
                    debug!(tier = %handle.name(), key = %key, tries, "version conflict, retrying");
                    tokio::task::yield_now().await;
                }
                Ok(CasOutcome::Missing) => {
                    return Ok(UpdateItemResult::new(UpdateOutcome::NotFound, conflict, tries));
                }
                Err(e) if e.is_transient() && tries < max => {
                    self.backoff(handle.name(), key, &e).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn update_locked<V, F>(
        &self,
        handle: &dyn CacheHandle<V>,
        key: &CacheKey,
        update_fn: &F,
        max: u32,
    ) -> CacheResult<UpdateItemResult<V>>
    where
        V: Clone + Send + Sync + 'static,
        F: Fn(&V) -> Option<V> + Send + Sync,
    {
        let mut tries = 0u32;

        loop {
            tries += 1;

            let guard = match tokio::time::timeout(self.retry_timeout, self.locks.lock(key)).await
            {
                Ok(guard) => guard,
                Err(_) if tries < max => continue,
                Err(_) => {
                    return Err(CacheError::tier_unavailable(
                        handle.name(),
                        format!("timed out waiting for the update lock on {key}"),
                    ));
                }
            };

            let current = match handle.get(key).await {
                Ok(Some(item)) => item,
                Ok(None) => {
                    return Ok(UpdateItemResult::new(UpdateOutcome::NotFound, false, tries));
                }
                Err(e) if e.is_transient() && tries < max => {
                    drop(guard);
                    self.backoff(handle.name(), key, &e).await;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let Some(new_value) = update_fn(current.value()) else {
                return Ok(UpdateItemResult::new(UpdateOutcome::Aborted, false, tries));
            };
            let candidate = current.with_value(new_value);

            match handle.put(candidate.clone()).await {
                Ok(()) => {
                    debug!(tier = %handle.name(), key = %key, tries, "update stored under lock");
                    return Ok(UpdateItemResult::new(
                        UpdateOutcome::Updated(candidate),
                        false,
                        tries,
                    ));
                }
                Err(e) if e.is_transient() && tries < max => {
                    drop(guard);
                    self.backoff(handle.name(), key, &e).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn backoff(&self, tier: &str, key: &CacheKey, error: &CacheError) {
        warn!(
            tier = %tier,
            key = %key,
            error = %error,
            wait_ms = self.retry_timeout.as_millis() as u64,
            "transient tier failure during update, retrying"
        );
        tokio::time::sleep(self.retry_timeout).await;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;

    use super::*;
    use crate::handle::{HandleCapabilities, Version, Versioned};

    /// Minimal versioned map; `atomic` switches between the CAS and lock paths.
    struct TestTier {
        atomic: bool,
        entries: SyncMutex<HashMap<CacheKey, (CacheItem<i64>, Version)>>,
        fail_next: AtomicU32,
    }

    impl TestTier {
        fn new(atomic: bool) -> Self {
            Self {
                atomic,
                entries: SyncMutex::new(HashMap::new()),
                fail_next: AtomicU32::new(0),
            }
        }

        fn seed(&self, key: &CacheKey, value: i64) {
            self.entries
                .lock()
                .insert(key.clone(), (CacheItem::new(key.clone(), value), Version::new(1)));
        }

        fn value(&self, key: &CacheKey) -> Option<i64> {
            self.entries.lock().get(key).map(|(item, _)| *item.value())
        }

        fn maybe_fail(&self) -> CacheResult<()> {
            let remaining = self.fail_next.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_next.store(remaining - 1, Ordering::SeqCst);
                return Err(CacheError::tier_unavailable("test", "flaky"));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl CacheHandle<i64> for TestTier {
        fn name(&self) -> &str {
            "test"
        }

        fn capabilities(&self) -> HandleCapabilities {
            HandleCapabilities {
                supports_regions: true,
                supports_atomic_update: self.atomic,
                is_distributed: false,
            }
        }

        async fn add(&self, item: CacheItem<i64>) -> CacheResult<bool> {
            let mut entries = self.entries.lock();
            if entries.contains_key(item.key()) {
                return Ok(false);
            }
            entries.insert(item.key().clone(), (item, Version::new(1)));
            Ok(true)
        }

        async fn put(&self, item: CacheItem<i64>) -> CacheResult<()> {
            self.maybe_fail()?;
            let mut entries = self.entries.lock();
            let version = entries
                .get(item.key())
                .map(|(_, v)| v.next())
                .unwrap_or(Version::new(1));
            entries.insert(item.key().clone(), (item, version));
            Ok(())
        }

        async fn get(&self, key: &CacheKey) -> CacheResult<Option<CacheItem<i64>>> {
            Ok(self.entries.lock().get(key).map(|(item, _)| item.clone()))
        }

        async fn remove(&self, key: &CacheKey) -> CacheResult<bool> {
            Ok(self.entries.lock().remove(key).is_some())
        }

        async fn clear(&self) -> CacheResult<()> {
            self.entries.lock().clear();
            Ok(())
        }

        async fn clear_region(&self, region: &str) -> CacheResult<()> {
            self.entries.lock().retain(|k, _| k.region() != Some(region));
            Ok(())
        }

        async fn count(&self) -> CacheResult<u64> {
            Ok(self.entries.lock().len() as u64)
        }

        async fn get_versioned(&self, key: &CacheKey) -> CacheResult<Option<Versioned<i64>>> {
            self.maybe_fail()?;
            Ok(self.entries.lock().get(key).map(|(item, version)| Versioned {
                item: item.clone(),
                version: *version,
            }))
        }

        async fn compare_and_swap(
            &self,
            item: CacheItem<i64>,
            expected: Version,
        ) -> CacheResult<CasOutcome> {
            // Yield between read and write so concurrent callers interleave.
            tokio::task::yield_now().await;
            let mut entries = self.entries.lock();
            match entries.get(item.key()) {
                None => Ok(CasOutcome::Missing),
                Some((_, current)) if *current != expected => Ok(CasOutcome::Conflict),
                Some((_, current)) => {
                    let next = current.next();
                    entries.insert(item.key().clone(), (item, next));
                    Ok(CasOutcome::Stored(next))
                }
            }
        }
    }

    fn key() -> CacheKey {
        CacheKey::plain("counter").unwrap()
    }

    #[tokio::test]
    async fn test_update_missing_key_reports_not_found() {
        let tier = TestTier::new(true);
        let coordinator = UpdateCoordinator::default();

        let result = coordinator
            .update(&tier, &key(), |v: &i64| Some(v + 1), None)
            .await
            .unwrap();

        assert!(!result.success());
        assert!(!result.version_conflict_detected());
        assert_eq!(result.tries_used(), 1);
        assert_eq!(result.failure_reason(), Some(UpdateFailureReason::NotFound));
    }

    #[tokio::test]
    async fn test_update_single_writer() {
        let tier = TestTier::new(true);
        tier.seed(&key(), 41);
        let coordinator = UpdateCoordinator::default();

        let result = coordinator
            .update(&tier, &key(), |v: &i64| Some(v + 1), None)
            .await
            .unwrap();

        assert!(result.success());
        assert_eq!(result.tries_used(), 1);
        assert_eq!(*result.item().unwrap().value(), 42);
        assert_eq!(tier.value(&key()), Some(42));
    }

    #[tokio::test]
    async fn test_update_aborted_by_function() {
        let tier = TestTier::new(true);
        tier.seed(&key(), 1);
        let coordinator = UpdateCoordinator::default();

        let result = coordinator
            .update(&tier, &key(), |_: &i64| None, None)
            .await
            .unwrap();

        assert!(!result.success());
        assert_eq!(result.failure_reason(), Some(UpdateFailureReason::Aborted));
        assert_eq!(tier.value(&key()), Some(1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_updates_converge() {
        let tier = Arc::new(TestTier::new(true));
        tier.seed(&key(), 0);
        let coordinator = Arc::new(UpdateCoordinator::new(10_000, Duration::from_millis(1)));

        let writers = 8;
        let iterations = 50;
        let mut tasks = Vec::new();
        for _ in 0..writers {
            let tier = Arc::clone(&tier);
            let coordinator = Arc::clone(&coordinator);
            tasks.push(tokio::spawn(async move {
                let mut tries = 0u32;
                for _ in 0..iterations {
                    let result = coordinator
                        .update(tier.as_ref(), &key(), |v: &i64| Some(v + 1), None)
                        .await
                        .unwrap();
                    assert!(result.success());
                    tries += result.tries_used();
                }
                tries
            }));
        }

        let mut total_tries = 0u32;
        for task in tasks {
            total_tries += task.await.unwrap();
        }

        assert_eq!(tier.value(&key()), Some(writers * iterations));
        assert!(total_tries >= (writers * iterations) as u32);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_locked_path_converges() {
        let tier = Arc::new(TestTier::new(false));
        tier.seed(&key(), 0);
        let coordinator = Arc::new(UpdateCoordinator::new(50, Duration::from_secs(5)));

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let tier = Arc::clone(&tier);
            let coordinator = Arc::clone(&coordinator);
            tasks.push(tokio::spawn(async move {
                for _ in 0..25 {
                    let result = coordinator
                        .update(tier.as_ref(), &key(), |v: &i64| Some(v + 1), None)
                        .await
                        .unwrap();
                    assert!(result.success());
                    assert!(!result.version_conflict_detected());
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(tier.value(&key()), Some(100));
        assert!(coordinator.locks().is_empty());
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let tier = TestTier::new(true);
        tier.seed(&key(), 1);
        tier.fail_next.store(2, Ordering::SeqCst);
        let coordinator = UpdateCoordinator::new(5, Duration::from_millis(1));

        let result = coordinator
            .update(&tier, &key(), |v: &i64| Some(v * 10), None)
            .await
            .unwrap();

        assert!(result.success());
        assert_eq!(result.tries_used(), 3);
        assert_eq!(tier.value(&key()), Some(10));
    }

    #[tokio::test]
    async fn test_transient_failures_surface_when_budget_exhausted() {
        let tier = TestTier::new(true);
        tier.seed(&key(), 1);
        tier.fail_next.store(10, Ordering::SeqCst);
        let coordinator = UpdateCoordinator::new(3, Duration::from_millis(1));

        let err = coordinator
            .update(&tier, &key(), |v: &i64| Some(v + 1), None)
            .await
            .unwrap_err();

        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_lock_released_after_panicking_update_fn() {
        let tier = Arc::new(TestTier::new(false));
        tier.seed(&key(), 1);
        let coordinator = Arc::new(UpdateCoordinator::new(3, Duration::from_millis(200)));

        let panicking = {
            let tier = Arc::clone(&tier);
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                let _ = coordinator
                    .update(tier.as_ref(), &key(), |_: &i64| -> Option<i64> { panic!("boom") }, None)
                    .await;
            })
        };
        assert!(panicking.await.is_err());

        let result = coordinator
            .update(tier.as_ref(), &key(), |v: &i64| Some(v + 1), None)
            .await
            .unwrap();
        assert!(result.success());
        assert_eq!(tier.value(&key()), Some(2));
    }
}
