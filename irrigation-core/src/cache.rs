//! Process-wide TTL cache with per-key request coalescing.
//!
//! Entries are checked on read; nothing is evicted in the background. While
//! one caller computes a missing value, callers arriving for the same key
//! wait for it and receive the same outcome, failures included.

use chrono::{DateTime, Utc};
use std::{
    collections::HashMap,
    convert::Infallible,
    future::Future,
    hash::Hash,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use crate::model::CacheStatus;

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T> {
    pub value: T,
    pub generated_at: DateTime<Utc>,
    pub ttl: Duration,
}

impl<T> CacheEntry<T> {
    pub fn new(value: T, generated_at: DateTime<Utc>, ttl: Duration) -> Self {
        Self { value, generated_at, ttl }
    }

    /// Entries stamped after `now` count as age zero.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.generated_at).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.age(now) < self.ttl
    }
}

#[derive(Debug)]
struct Flight<V> {
    last: tokio::sync::Mutex<Option<V>>,
    /// Bumped under `last` whenever a computation completes.
    completed: AtomicU64,
}

impl<V> Default for Flight<V> {
    fn default() -> Self {
        Self { last: tokio::sync::Mutex::new(None), completed: AtomicU64::new(0) }
    }
}

/// At most one computation in flight per key.
#[derive(Debug)]
pub struct SingleFlight<K, V> {
    flights: Mutex<HashMap<K, Arc<Flight<V>>>>,
}

impl<K, V> Default for SingleFlight<K, V> {
    fn default() -> Self {
        Self { flights: Mutex::new(HashMap::new()) }
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `compute` for `key` unless a computation for it is already in
    /// flight, in which case wait for that one and share its output.
    ///
    /// The flag is `true` when the output came from another caller's run.
    /// A computation that is dropped before finishing shares nothing.
    pub async fn run<F, Fut>(&self, key: K, compute: F) -> (V, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        let flight = {
            let mut flights = self.flights.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(flights.entry(key).or_default())
        };

        let seen = flight.completed.load(Ordering::Acquire);
        let mut last = flight.last.lock().await;

        if flight.completed.load(Ordering::Acquire) != seen {
            if let Some(value) = last.as_ref() {
                return (value.clone(), true);
            }
        }

        let value = compute().await;
        *last = Some(value.clone());
        flight.completed.fetch_add(1, Ordering::Release);
        (value, false)
    }
}

type Outcome<V, E> = Result<(CacheEntry<V>, CacheStatus), E>;

#[derive(Debug)]
pub struct TtlCache<K, V, E = Infallible> {
    entries: Mutex<HashMap<K, CacheEntry<V>>>,
    flights: SingleFlight<K, Outcome<V, E>>,
}

impl<K, V, E> Default for TtlCache<K, V, E> {
    fn default() -> Self {
        Self { entries: Mutex::new(HashMap::new()), flights: SingleFlight::default() }
    }
}

impl<K, V, E> TtlCache<K, V, E>
where
    K: Eq + Hash + Clone,
    V: Clone,
    E: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Entry for `key` if it is still within its TTL at `now`.
    pub fn get(&self, key: &K, now: DateTime<Utc>) -> Option<CacheEntry<V>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.get(key).filter(|e| e.is_fresh(now)).cloned()
    }

    /// Entry for `key` regardless of age.
    pub fn get_any(&self, key: &K) -> Option<CacheEntry<V>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.get(key).cloned()
    }

    pub fn put(&self, key: K, value: V, now: DateTime<Utc>, ttl: Duration) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key, CacheEntry::new(value, now, ttl));
    }

    pub fn invalidate(&self, key: &K) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Return the fresh entry for `key`, or run `compute` and store its
    /// result. Callers that arrive while `compute` runs get its outcome
    /// (an error as well as a value) instead of starting their own.
    /// A failed computation stores nothing and leaves any expired entry
    /// in place.
    pub async fn get_or_try_insert_with<F, Fut>(
        &self,
        key: K,
        now: DateTime<Utc>,
        ttl: Duration,
        compute: F,
    ) -> Outcome<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(entry) = self.get(&key, now) {
            return Ok((entry, CacheStatus::Cached));
        }

        let slot_key = key.clone();
        let (outcome, shared) = self
            .flights
            .run(slot_key, || async move {
                // Filled while this caller queued behind a finished run.
                if let Some(entry) = self.get(&key, now) {
                    return Ok((entry, CacheStatus::Cached));
                }
                let entry = CacheEntry::new(compute().await?, now, ttl);
                self.put(key, entry.value.clone(), now, ttl);
                Ok((entry, CacheStatus::Fresh))
            })
            .await;

        if shared {
            outcome.map(|(entry, _)| (entry, CacheStatus::Cached))
        } else {
            outcome
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::AtomicUsize;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn get_respects_ttl() {
        let cache: TtlCache<&str, u32> = TtlCache::new();
        cache.put("a", 1, t0(), Duration::from_secs(60));

        assert_eq!(cache.get(&"a", t0() + chrono::Duration::seconds(59)).unwrap().value, 1);
        assert!(cache.get(&"a", t0() + chrono::Duration::seconds(60)).is_none());
        // Expired entries stay readable for degraded serving.
        assert_eq!(cache.get_any(&"a").unwrap().value, 1);
    }

    #[test]
    fn invalidate_drops_entry() {
        let cache: TtlCache<&str, u32> = TtlCache::new();
        cache.put("a", 1, t0(), Duration::from_secs(60));
        cache.invalidate(&"a");
        assert!(cache.get_any(&"a").is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn miss_computes_then_hit_is_cached() {
        let cache: TtlCache<&str, u32, ()> = TtlCache::new();
        let ttl = Duration::from_secs(60);

        let (entry, status) = cache
            .get_or_try_insert_with("k", t0(), ttl, || async { Ok(7) })
            .await
            .unwrap();
        assert_eq!((entry.value, status), (7, CacheStatus::Fresh));

        let (entry, status) = cache
            .get_or_try_insert_with("k", t0(), ttl, || async { Ok(8) })
            .await
            .unwrap();
        assert_eq!((entry.value, status), (7, CacheStatus::Cached));
    }

    #[tokio::test]
    async fn failure_keeps_previous_entry() {
        let cache: TtlCache<&str, u32, &str> = TtlCache::new();
        let ttl = Duration::from_secs(60);
        cache.put("k", 1, t0(), ttl);

        let later = t0() + chrono::Duration::minutes(5);
        let err = cache.get_or_try_insert_with("k", later, ttl, || async { Err("down") }).await;
        assert_eq!(err.unwrap_err(), "down");
        assert_eq!(cache.get_any(&"k").unwrap().generated_at, t0());
    }

    #[tokio::test]
    async fn later_call_retries_after_failure() {
        let cache: TtlCache<&str, u32, &str> = TtlCache::new();
        let ttl = Duration::from_secs(60);

        assert!(cache.get_or_try_insert_with("k", t0(), ttl, || async { Err("down") }).await.is_err());
        let (entry, status) = cache.get_or_try_insert_with("k", t0(), ttl, || async { Ok(3) }).await.unwrap();
        assert_eq!((entry.value, status), (3, CacheStatus::Fresh));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_misses_coalesce() {
        let cache: Arc<TtlCache<String, u32>> = Arc::new(TtlCache::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let calls = Arc::clone(&calls);
                tokio::spawn(async move {
                    cache
                        .get_or_try_insert_with("poly".to_string(), t0(), Duration::from_secs(60), || async {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok(42)
                        })
                        .await
                        .unwrap()
                })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap().0.value, 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_misses_share_one_failure() {
        let cache: Arc<TtlCache<String, u32, String>> = Arc::new(TtlCache::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let started = std::time::Instant::now();

        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let calls = Arc::clone(&calls);
                tokio::spawn(async move {
                    cache
                        .get_or_try_insert_with("poly".to_string(), t0(), Duration::from_secs(60), || async {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            Err("all providers down".to_string())
                        })
                        .await
                })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap_err(), "all providers down");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_millis(900));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn single_flight_reports_shared_output() {
        let flights: SingleFlight<&str, u32> = SingleFlight::new();
        let counter = AtomicUsize::new(0);
        let calls = &counter;

        let compute = move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            5
        };
        let (a, b, c) = tokio::join!(
            flights.run("z", compute),
            flights.run("z", compute),
            flights.run("z", compute),
        );

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!([a.0, b.0, c.0], [5, 5, 5]);
        assert_eq!([a.1, b.1, c.1].iter().filter(|shared| **shared).count(), 2);

        // Nothing in flight any more: the next caller computes.
        let (_, shared) = flights.run("z", || async { 6 }).await;
        assert!(!shared);
    }
}
