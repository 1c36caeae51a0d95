//! Tag-indexed get-or-compute cache with single-flight misses.
//!
//! # Single flight
//!
//! A miss registers a *flight* under its key before the computation starts.
//! Later callers for the same key join that flight instead of computing again,
//! and all of them receive the same `Ok` value or the same error. The
//! computation runs on its own spawned task and stores its result from there,
//! so a caller that gives up (its request was cancelled) never strands the
//! others.
//!
//! # Invalidation vs. in-flight work
//!
//! `delete`, `set` and `invalidate_by_tags` also detach any matching flight.
//! A detached flight still answers its waiters but is not stored: the data it
//! read may predate the mutation that triggered the invalidation.
//!
//! # Locking
//!
//! Two locks, always taken in the same order: the flight registry, then the
//! backend. Neither is held across an `.await`.

use crate::backend::{CacheBackend, InMemoryBackend, InsertOutcome, Lookup};
use crate::entry::{CacheEntry, EntryOptions};
use crate::stats::{CacheStats, Counters};
use cadence_core::{CacheConfig, CacheError, CadenceError, CadenceResult};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::collections::{BTreeSet, HashMap};
use std::any::Any;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

type FlightFuture<V> = Shared<BoxFuture<'static, CadenceResult<Arc<V>>>>;

struct Flight<V> {
    id: u64,
    tags: BTreeSet<String>,
    future: FlightFuture<V>,
}

enum Admission<V> {
    Hit(Arc<V>),
    Wait(FlightFuture<V>),
}

struct Inner<V, B> {
    backend: B,
    flights: Mutex<HashMap<String, Flight<V>>>,
    next_flight_id: AtomicU64,
    default_ttl: Duration,
    counters: Counters,
}

impl<V, B> Inner<V, B>
where
    V: Send + Sync + 'static,
    B: CacheBackend<V>,
{
    fn lock_flights(&self) -> CadenceResult<MutexGuard<'_, HashMap<String, Flight<V>>>> {
        self.flights
            .lock()
            .map_err(|_| CadenceError::Cache(CacheError::LockPoisoned))
    }

    /// Backend read with hit/expiry accounting. Misses are counted by callers.
    fn read(&self, key: &str) -> CadenceResult<Option<Arc<V>>> {
        match self.backend.get(key, Instant::now())? {
            Lookup::Hit(value) => {
                Counters::bump(&self.counters.hits, 1);
                Ok(Some(value))
            }
            Lookup::Expired => {
                Counters::bump(&self.counters.expirations, 1);
                Ok(None)
            }
            Lookup::Miss => Ok(None),
        }
    }

    fn store(&self, key: &str, value: Arc<V>, options: EntryOptions) -> CadenceResult<()> {
        let ttl = options.ttl.unwrap_or(self.default_ttl);
        let now = Instant::now();
        let entry = CacheEntry::new(key, value, ttl, options.tags, now);
        let InsertOutcome {
            expired, evicted, ..
        } = self.backend.insert(entry, now)?;
        Counters::bump(&self.counters.expirations, expired as u64);
        Counters::bump(&self.counters.evictions, evicted as u64);
        if evicted > 0 {
            debug!(key, evicted, "capacity reached; evicted least recently read entries");
        }
        Ok(())
    }

    /// Runs on the flight's own task once the computation finishes.
    fn settle(
        &self,
        key: &str,
        id: u64,
        options: EntryOptions,
        outcome: CadenceResult<V>,
    ) -> CadenceResult<Arc<V>> {
        let value = match outcome {
            Ok(value) => Arc::new(value),
            Err(error) => {
                Counters::bump(&self.counters.failures, 1);
                self.abandon(key, id);
                debug!(key, %error, "computation failed; nothing cached");
                return Err(error);
            }
        };

        let mut flights = self.lock_flights()?;
        let current = flights.get(key).is_some_and(|flight| flight.id == id);
        if !current {
            Counters::bump(&self.counters.detached_flights, 1);
            debug!(key, "flight was invalidated while running; result not cached");
            return Ok(value);
        }
        flights.remove(key);
        self.store(key, Arc::clone(&value), options)?;
        Ok(value)
    }

    /// Drop the flight registration if it is still ours.
    fn abandon(&self, key: &str, id: u64) {
        if let Ok(mut flights) = self.flights.lock() {
            if flights.get(key).is_some_and(|flight| flight.id == id) {
                flights.remove(key);
            }
        }
    }

    fn purge_expired(&self) -> CadenceResult<usize> {
        let purged = self.backend.purge_expired(Instant::now())?;
        Counters::bump(&self.counters.expirations, purged as u64);
        Ok(purged)
    }
}

/// Generic get-or-compute cache with TTL, tag invalidation and an LRU bound.
///
/// Cloning is cheap and shares the underlying store.
///
/// # Example
///
/// ```ignore
/// let cache: TaggedCache<Report> = TaggedCache::new(&CacheConfig::default());
/// let report = cache
///     .get_or_set(
///         "stats:42:2024-03-01",
///         EntryOptions::new().with_ttl(ttl).with_tags(["institution:42", "stats"]),
///         move || async move { build_report(42).await },
///     )
///     .await?;
///
/// // A mentor was reassigned at institution 42.
/// cache.invalidate_by_tags(["institution:42"])?;
/// ```
pub struct TaggedCache<V, B = InMemoryBackend<V>> {
    inner: Arc<Inner<V, B>>,
}

impl<V, B> Clone for TaggedCache<V, B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> TaggedCache<V, InMemoryBackend<V>>
where
    V: Send + Sync + 'static,
{
    /// In-memory cache sized and timed by `config`.
    pub fn new(config: &CacheConfig) -> Self {
        Self::with_backend(InMemoryBackend::new(config.max_entries), config.default_ttl)
    }
}

impl<V, B> TaggedCache<V, B>
where
    V: Send + Sync + 'static,
    B: CacheBackend<V> + 'static,
{
    /// Cache over a custom backend.
    pub fn with_backend(backend: B, default_ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend,
                flights: Mutex::new(HashMap::new()),
                next_flight_id: AtomicU64::new(1),
                default_ttl,
                counters: Counters::default(),
            }),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.inner.default_ttl
    }

    /// Return the live value under `key`, or compute, store and return it.
    ///
    /// `compute` is invoked at most once per miss episode no matter how many
    /// callers race on the key. Its failure is returned to every waiting caller
    /// and nothing is stored. Must be called from within a Tokio runtime.
    pub async fn get_or_set<F, Fut>(
        &self,
        key: &str,
        options: EntryOptions,
        compute: F,
    ) -> CadenceResult<Arc<V>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CadenceResult<V>> + Send + 'static,
    {
        match self.admit(key, options, compute)? {
            Admission::Hit(value) => Ok(value),
            Admission::Wait(flight) => flight.await,
        }
    }

    fn admit<F, Fut>(
        &self,
        key: &str,
        options: EntryOptions,
        compute: F,
    ) -> CadenceResult<Admission<V>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CadenceResult<V>> + Send + 'static,
    {
        if let Some(value) = self.inner.read(key)? {
            return Ok(Admission::Hit(value));
        }

        let mut flights = self.inner.lock_flights()?;
        // A flight may have landed between the read above and taking the lock.
        if let Some(value) = self.inner.read(key)? {
            return Ok(Admission::Hit(value));
        }
        if let Some(flight) = flights.get(key) {
            Counters::bump(&self.inner.counters.coalesced, 1);
            debug!(key, flight = flight.id, "joining in-flight computation");
            return Ok(Admission::Wait(flight.future.clone()));
        }

        Counters::bump(&self.inner.counters.misses, 1);
        // `compute` runs under the registry lock; a panic here must not poison it.
        let work = match panic::catch_unwind(AssertUnwindSafe(compute)) {
            Ok(work) => work,
            Err(payload) => {
                drop(flights);
                Counters::bump(&self.inner.counters.failures, 1);
                let reason = panic_reason(payload.as_ref());
                warn!(key, %reason, "cache computation panicked before starting");
                return Err(CadenceError::Cache(CacheError::ComputeAborted {
                    key: key.to_string(),
                    reason,
                }));
            }
        };
        let flight = self.launch(key, options, work);
        debug!(key, flight = flight.id, "cache miss; computing");
        let future = flight.future.clone();
        flights.insert(key.to_string(), flight);
        Ok(Admission::Wait(future))
    }

    fn launch<Fut>(&self, key: &str, options: EntryOptions, work: Fut) -> Flight<V>
    where
        Fut: Future<Output = CadenceResult<V>> + Send + 'static,
    {
        let id = self.inner.next_flight_id.fetch_add(1, Ordering::Relaxed);
        let tags = options.tags.clone();

        let settle_inner = Arc::clone(&self.inner);
        let settle_key = key.to_string();
        let handle = tokio::spawn(async move {
            let outcome = work.await;
            settle_inner.settle(&settle_key, id, options, outcome)
        });

        let abort_inner = Arc::clone(&self.inner);
        let abort_key = key.to_string();
        let future = async move {
            match handle.await {
                Ok(result) => result,
                Err(join_error) => {
                    abort_inner.abandon(&abort_key, id);
                    warn!(key = %abort_key, error = %join_error, "cache computation aborted");
                    Err(CadenceError::Cache(CacheError::ComputeAborted {
                        key: abort_key,
                        reason: join_error.to_string(),
                    }))
                }
            }
        }
        .boxed()
        .shared();

        Flight { id, tags, future }
    }

    /// Peek at a live value without computing.
    pub fn get(&self, key: &str) -> CadenceResult<Option<Arc<V>>> {
        let value = self.inner.read(key)?;
        if value.is_none() {
            Counters::bump(&self.inner.counters.misses, 1);
        }
        Ok(value)
    }

    /// Store `value` under `key`, replacing any entry and detaching any flight.
    pub fn set(&self, key: &str, value: V, options: EntryOptions) -> CadenceResult<Arc<V>> {
        let value = Arc::new(value);
        let mut flights = self.inner.lock_flights()?;
        flights.remove(key);
        self.inner.store(key, Arc::clone(&value), options)?;
        Ok(value)
    }

    /// Remove one entry and scrub it from its tags. Idempotent.
    pub fn delete(&self, key: &str) -> CadenceResult<bool> {
        let mut flights = self.inner.lock_flights()?;
        flights.remove(key);
        let removed = self.inner.backend.remove(key)?;
        if removed {
            Counters::bump(&self.inner.counters.invalidations, 1);
        }
        Ok(removed)
    }

    /// Remove every entry carrying any of `tags`; returns how many were removed.
    pub fn invalidate_by_tags<I, S>(&self, tags: I) -> CadenceResult<usize>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tags: BTreeSet<String> = tags.into_iter().map(Into::into).collect();
        if tags.is_empty() {
            return Ok(0);
        }

        let mut flights = self.inner.lock_flights()?;
        flights.retain(|_, flight| flight.tags.is_disjoint(&tags));
        let removed = self.inner.backend.remove_tagged(&tags)?;
        Counters::bump(&self.inner.counters.invalidations, removed as u64);
        debug!(?tags, removed, "invalidated cache entries by tag");
        Ok(removed)
    }

    /// Drop every expired entry now instead of waiting for it to be read.
    pub fn purge_expired(&self) -> CadenceResult<usize> {
        self.inner.purge_expired()
    }

    /// Periodically purge expired entries.
    ///
    /// Only caps memory held by entries nobody reads again; reads never depend
    /// on it. The task holds a weak reference and exits once every clone of the
    /// cache has been dropped.
    pub fn spawn_sweeper(&self, every: Duration) -> JoinHandle<()> {
        let weak: Weak<Inner<V, B>> = Arc::downgrade(&self.inner);
        let every = every.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                match inner.purge_expired() {
                    Ok(0) => {}
                    Ok(purged) => debug!(purged, "cache sweep removed expired entries"),
                    Err(error) => warn!(%error, "cache sweep failed"),
                }
            }
        })
    }

    /// Number of stored entries (expired entries not yet collected included).
    pub fn len(&self) -> CadenceResult<usize> {
        self.inner.backend.len()
    }

    pub fn is_empty(&self) -> CadenceResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Number of computations currently registered.
    pub fn in_flight(&self) -> CadenceResult<usize> {
        Ok(self.inner.lock_flights()?.len())
    }

    /// Keys currently indexed under `tag`.
    pub fn keys_for_tag(&self, tag: &str) -> CadenceResult<Vec<String>> {
        self.inner.backend.keys_for_tag(tag)
    }

    /// Every broken entry/tag-index invariant. Empty when consistent.
    pub fn tag_index_violations(&self) -> CadenceResult<Vec<String>> {
        self.inner.backend.tag_index_violations()
    }

    pub fn stats(&self) -> CadenceResult<CacheStats> {
        let entry_count = self.len()? as u64;
        let in_flight = self.in_flight()? as u64;
        Ok(self.inner.counters.snapshot(entry_count, in_flight))
    }
}

fn panic_reason(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::RepositoryError;
    use std::sync::atomic::AtomicUsize;

    fn cache(max_entries: usize) -> TaggedCache<u64> {
        TaggedCache::new(
            &CacheConfig::new()
                .with_ttl(Duration::from_secs(60))
                .with_max_entries(max_entries),
        )
    }

    fn counting(counter: &Arc<AtomicUsize>, value: u64) -> impl FnOnce() -> BoxFuture<'static, CadenceResult<u64>> {
        let counter = Arc::clone(counter);
        move || {
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(value)
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn test_get_or_set_computes_once_while_live() {
        let cache = cache(16);
        let calls = Arc::new(AtomicUsize::new(0));

        let first = cache
            .get_or_set("k", EntryOptions::new(), counting(&calls, 7))
            .await
            .unwrap();
        let second = cache
            .get_or_set("k", EntryOptions::new(), counting(&calls, 8))
            .await
            .unwrap();

        assert_eq!(*first, 7);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let stats = cache.stats().unwrap();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.entry_count, 1);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_are_recomputed() {
        let cache = cache(16);
        let calls = Arc::new(AtomicUsize::new(0));
        let options = EntryOptions::new().with_ttl(Duration::from_secs(10));

        cache
            .get_or_set("k", options.clone(), counting(&calls, 1))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(cache.get("k").unwrap().as_deref(), Some(&1));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(cache.get("k").unwrap().is_none());
        let value = cache
            .get_or_set("k", options, counting(&calls, 2))
            .await
            .unwrap();
        assert_eq!(*value, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.stats().unwrap().expirations, 1);
    }

    #[tokio::test]
    async fn test_failure_is_not_cached() {
        let cache = cache(16);
        let result = cache
            .get_or_set("k", EntryOptions::new().with_tag("t"), || async {
                Err(CadenceError::from(RepositoryError::Unavailable {
                    reason: "db down".to_string(),
                }))
            })
            .await;

        assert!(matches!(result, Err(CadenceError::Repository(_))));
        assert!(cache.is_empty().unwrap());
        assert!(cache.keys_for_tag("t").unwrap().is_empty());
        assert_eq!(cache.in_flight().unwrap(), 0);
        assert_eq!(cache.stats().unwrap().failures, 1);

        let calls = Arc::new(AtomicUsize::new(0));
        let value = cache
            .get_or_set("k", EntryOptions::new(), counting(&calls, 3))
            .await
            .unwrap();
        assert_eq!(*value, 3);
    }

    #[tokio::test]
    async fn test_panicking_compute_surfaces_as_aborted() {
        let cache = cache(16);
        let result = cache
            .get_or_set("k", EntryOptions::new(), || async {
                if true {
                    panic!("boom");
                }
                Ok(0u64)
            })
            .await;

        assert!(matches!(
            result,
            Err(CadenceError::Cache(CacheError::ComputeAborted { .. }))
        ));
        assert_eq!(cache.in_flight().unwrap(), 0);
        assert!(cache.get("k").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_panic_before_future_leaves_cache_usable() {
        let cache = cache(16);
        cache.set("b", 1, EntryOptions::new().with_tag("t")).unwrap();

        let result = cache
            .get_or_set(
                "a",
                EntryOptions::new(),
                || -> futures_util::future::Ready<CadenceResult<u64>> { panic!("bad closure") },
            )
            .await;
        match result {
            Err(CadenceError::Cache(CacheError::ComputeAborted { key, reason })) => {
                assert_eq!(key, "a");
                assert!(reason.contains("bad closure"));
            }
            other => panic!("expected ComputeAborted, got {other:?}"),
        }

        assert_eq!(cache.in_flight().unwrap(), 0);
        assert_eq!(cache.get("b").unwrap().as_deref(), Some(&1));
        assert!(cache.delete("b").unwrap());
        let calls = Arc::new(AtomicUsize::new(0));
        let value = cache
            .get_or_set("a", EntryOptions::new(), counting(&calls, 5))
            .await
            .unwrap();
        assert_eq!(*value, 5);
        assert_eq!(cache.stats().unwrap().failures, 1);
    }

    #[tokio::test]
    async fn test_set_replaces_and_delete_is_idempotent() {
        let cache = cache(16);
        cache
            .set("k", 1, EntryOptions::new().with_tag("old"))
            .unwrap();
        cache
            .set("k", 2, EntryOptions::new().with_tag("new"))
            .unwrap();

        assert_eq!(cache.get("k").unwrap().as_deref(), Some(&2));
        assert!(cache.keys_for_tag("old").unwrap().is_empty());

        assert!(cache.delete("k").unwrap());
        assert!(!cache.delete("k").unwrap());
        assert!(cache.keys_for_tag("new").unwrap().is_empty());
        assert!(cache.tag_index_violations().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalidate_by_tags_is_selective() {
        let cache = cache(16);
        let tagged = |id: u64| {
            EntryOptions::new().with_tags([format!("institution:{id}"), "stats".to_string()])
        };
        cache.set("stats:42:a", 1, tagged(42)).unwrap();
        cache.set("stats:42:b", 2, tagged(42)).unwrap();
        cache.set("stats:7:a", 3, tagged(7)).unwrap();

        assert_eq!(cache.invalidate_by_tags(["institution:42"]).unwrap(), 2);
        assert!(cache.get("stats:42:a").unwrap().is_none());
        assert!(cache.get("stats:42:b").unwrap().is_none());
        assert_eq!(cache.get("stats:7:a").unwrap().as_deref(), Some(&3));
        assert_eq!(cache.invalidate_by_tags(Vec::<String>::new()).unwrap(), 0);
        assert!(cache.tag_index_violations().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_capacity_evicts_least_recently_read() {
        let cache = cache(2);
        cache.set("a", 1, EntryOptions::new()).unwrap();
        cache.set("b", 2, EntryOptions::new()).unwrap();
        assert!(cache.get("a").unwrap().is_some());

        cache.set("c", 3, EntryOptions::new()).unwrap();
        assert!(cache.get("b").unwrap().is_none());
        assert!(cache.get("a").unwrap().is_some());
        assert_eq!(cache.stats().unwrap().evictions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_purges_unread_entries() {
        let cache = cache(16);
        cache
            .set("k", 1, EntryOptions::new().with_ttl(Duration::from_secs(5)))
            .unwrap();
        let sweeper = cache.spawn_sweeper(Duration::from_secs(10));

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(cache.len().unwrap(), 0);
        assert_eq!(cache.stats().unwrap().expirations, 1);

        drop(cache);
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(sweeper.is_finished());
    }
}
