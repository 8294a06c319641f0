//! Keyed query cache with freshness tracking and single-flight fetches.
//!
//! # Design
//! One `Slot` per `CacheKey` holds the last good payload plus its state
//! (`Fresh`, `Stale`, `Fetching`, `Errored`). A separate in-flight registry
//! maps a key to its one outstanding fetch: a spawned task whose output is
//! fanned out to every waiter through a `Shared` future.
//!
//! Every fetch start takes a new generation from a cache-wide counter. A
//! settling fetch commits only while it is still the registered flight for
//! its key with the same generation; anything else (cleared, cancelled,
//! superseded) is dropped on the floor. Generations are never reused, so a
//! flight that outlives a `clear()` cannot match a newer entry.
//!
//! Waiters hold an `Interest` guard. When the last waiter of a flight goes
//! away before it settles, the flight's token is cancelled and the entry
//! falls back to `Stale`; other waiters keep a shared flight alive.
//!
//! The mutex is only held for synchronous bookkeeping, never across an
//! `.await`.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::descriptor::{CacheKey, InvalidationSet};
use crate::error::{ClassifiedError, ErrorKind};

/// Type-erased cached value. Recovered with a typed downcast.
pub type Payload = Arc<dyn Any + Send + Sync>;

type SharedFetch = Shared<BoxFuture<'static, Result<Payload, ClassifiedError>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Fresh,
    Stale,
    Fetching,
    Errored,
}

/// Snapshot of one cache entry.
#[derive(Clone)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub data: Option<Payload>,
    pub state: EntryState,
    pub last_fetched_at: Option<Instant>,
    pub error: Option<ClassifiedError>,
    pub generation: u64,
}

impl CacheEntry {
    pub fn data_as<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.data.clone()?.downcast::<T>().ok()
    }
}

impl fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("key", &self.key)
            .field("has_data", &self.data.is_some())
            .field("state", &self.state)
            .field("last_fetched_at", &self.last_fetched_at)
            .field("error", &self.error)
            .field("generation", &self.generation)
            .finish()
    }
}

/// Change notifications for mounted queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    /// A fetch for the key settled and was committed.
    Updated(CacheKey),
    /// The key was marked stale; observers should refetch.
    Invalidated(CacheKey),
    Cleared,
}

struct Slot {
    data: Option<Payload>,
    state: EntryState,
    last_fetched_at: Option<Instant>,
    error: Option<ClassifiedError>,
    generation: u64,
}

impl Slot {
    fn empty() -> Self {
        Self {
            data: None,
            state: EntryState::Stale,
            last_fetched_at: None,
            error: None,
            generation: 0,
        }
    }

    fn snapshot(&self, key: &CacheKey) -> CacheEntry {
        CacheEntry {
            key: key.clone(),
            data: self.data.clone(),
            state: self.state,
            last_fetched_at: self.last_fetched_at,
            error: self.error.clone(),
            generation: self.generation,
        }
    }

    fn is_fresh_within(&self, ttl: Duration) -> bool {
        self.state == EntryState::Fresh
            && self
                .last_fetched_at
                .is_some_and(|at| Instant::now().duration_since(at) < ttl)
    }
}

struct InFlight {
    generation: u64,
    fetch: SharedFetch,
    cancel: CancellationToken,
    /// Error handed to waiters when the flight is cancelled. Unset means `Aborted`.
    reason: Arc<OnceLock<ClassifiedError>>,
    interest: usize,
    /// Set when the key is invalidated mid-fetch; the result commits as stale.
    invalidated: bool,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<CacheKey, Slot>,
    in_flight: HashMap<CacheKey, InFlight>,
    observers: HashMap<CacheKey, usize>,
    next_generation: u64,
}

struct CacheShared {
    inner: Mutex<Inner>,
    events: broadcast::Sender<CacheEvent>,
}

enum Lookup {
    Hit(Payload),
    Join(SharedFetch, Interest),
    Miss,
}

/// Process-wide query cache. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct QueryCache {
    shared: Arc<CacheShared>,
}

impl fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_struct("QueryCache")
            .field("entries", &inner.entries.len())
            .field("in_flight", &inner.in_flight.len())
            .finish()
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryCache {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            shared: Arc::new(CacheShared {
                inner: Mutex::new(Inner::default()),
                events,
            }),
        }
    }

    pub fn read(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.shared.inner.lock().entries.get(key).map(|slot| slot.snapshot(key))
    }

    pub fn data<T: Send + Sync + 'static>(&self, key: &CacheKey) -> Option<Arc<T>> {
        self.read(key)?.data_as::<T>()
    }

    pub fn len(&self) -> usize {
        self.shared.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_flight_count(&self) -> usize {
        self.shared.inner.lock().in_flight.len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.shared.events.subscribe()
    }

    /// Return cached data for `key` if it is fresh within `ttl`, otherwise
    /// join or start the single fetch for `key`.
    ///
    /// `fetcher` is only invoked when a new fetch starts. The token it
    /// receives fires when the fetch is cancelled (last waiter gone, cache
    /// cleared).
    pub async fn ensure_fresh<T, F, Fut>(
        &self,
        key: CacheKey,
        fetcher: F,
        ttl: Duration,
    ) -> Result<Arc<T>, ClassifiedError>
    where
        T: Send + Sync + 'static,
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, ClassifiedError>> + Send + 'static,
    {
        let (fetch, _interest) = match self.lookup(&key, ttl) {
            Lookup::Hit(payload) => return downcast(&key, payload),
            Lookup::Join(fetch, interest) => (fetch, interest),
            Lookup::Miss => {
                let cancel = CancellationToken::new();
                let future = fetcher(cancel.clone());
                self.start(key.clone(), ttl, cancel, future)
            }
        };
        let payload = fetch.await?;
        downcast(&key, payload)
    }

    fn lookup(&self, key: &CacheKey, ttl: Duration) -> Lookup {
        let mut inner = self.shared.inner.lock();
        Self::lookup_locked(&mut inner, key, ttl, &self.shared)
    }

    fn lookup_locked(inner: &mut Inner, key: &CacheKey, ttl: Duration, shared: &Arc<CacheShared>) -> Lookup {
        if let Some(slot) = inner.entries.get(key) {
            if slot.is_fresh_within(ttl) {
                if let Some(data) = &slot.data {
                    debug!(%key, "cache hit");
                    return Lookup::Hit(data.clone());
                }
            }
        }
        if let Some(flight) = inner.in_flight.get_mut(key) {
            flight.interest += 1;
            debug!(%key, generation = flight.generation, waiters = flight.interest, "joining in-flight fetch");
            let interest = Interest {
                key: key.clone(),
                generation: flight.generation,
                cache: Arc::downgrade(shared),
            };
            return Lookup::Join(flight.fetch.clone(), interest);
        }
        Lookup::Miss
    }

    /// Register and spawn a new flight, unless another caller registered one
    /// while the fetcher was being built. An unregistered future was never
    /// polled, so dropping it performs no I/O.
    fn start<T, Fut>(
        &self,
        key: CacheKey,
        ttl: Duration,
        cancel: CancellationToken,
        future: Fut,
    ) -> (SharedFetch, Interest)
    where
        T: Send + Sync + 'static,
        Fut: Future<Output = Result<T, ClassifiedError>> + Send + 'static,
    {
        let mut guard = self.shared.inner.lock();
        let inner = &mut *guard;
        match Self::lookup_locked(inner, &key, ttl, &self.shared) {
            Lookup::Hit(payload) => {
                let ready: BoxFuture<'static, Result<Payload, ClassifiedError>> =
                    futures::future::ready(Ok(payload)).boxed();
                return (ready.shared(), Interest::detached(&key));
            }
            Lookup::Join(fetch, interest) => return (fetch, interest),
            Lookup::Miss => {}
        }

        inner.next_generation += 1;
        let generation = inner.next_generation;
        let reason = Arc::new(OnceLock::new());
        let fetch = self.spawn_fetch(key.clone(), generation, cancel.clone(), reason.clone(), future);

        let slot = inner.entries.entry(key.clone()).or_insert_with(Slot::empty);
        slot.state = EntryState::Fetching;
        slot.generation = generation;
        inner.in_flight.insert(
            key.clone(),
            InFlight {
                generation,
                fetch: fetch.clone(),
                cancel,
                reason,
                interest: 1,
                invalidated: false,
            },
        );
        debug!(%key, generation, "fetch started");

        let interest = Interest {
            key,
            generation,
            cache: Arc::downgrade(&self.shared),
        };
        (fetch, interest)
    }

    fn spawn_fetch<T, Fut>(
        &self,
        key: CacheKey,
        generation: u64,
        cancel: CancellationToken,
        reason: Arc<OnceLock<ClassifiedError>>,
        future: Fut,
    ) -> SharedFetch
    where
        T: Send + Sync + 'static,
        Fut: Future<Output = Result<T, ClassifiedError>> + Send + 'static,
    {
        let cache = Arc::downgrade(&self.shared);
        let task = async move {
            let outcome: Result<Payload, ClassifiedError> = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(reason.get().cloned().unwrap_or_else(ClassifiedError::aborted)),
                result = AssertUnwindSafe(future).catch_unwind() => match result {
                    Ok(result) => result.map(|value| Arc::new(value) as Payload),
                    Err(_) => Err(ClassifiedError::new(ErrorKind::Aborted, None, "fetch panicked")),
                },
            };
            if let Some(shared) = cache.upgrade() {
                QueryCache { shared }.settle(&key, generation, &outcome);
            }
            outcome
        };
        let handle = tokio::spawn(task);
        async move { handle.await.unwrap_or_else(|_| Err(ClassifiedError::aborted())) }
            .boxed()
            .shared()
    }

    fn settle(&self, key: &CacheKey, generation: u64, outcome: &Result<Payload, ClassifiedError>) {
        let mut events = Vec::new();
        {
            let mut guard = self.shared.inner.lock();
            let inner = &mut *guard;
            let invalidated = match inner.in_flight.get(key) {
                Some(flight) if flight.generation == generation => flight.invalidated,
                _ => {
                    debug!(%key, generation, "discarding superseded fetch result");
                    return;
                }
            };
            inner.in_flight.remove(key);
            let Some(slot) = inner.entries.get_mut(key) else {
                return;
            };
            if slot.generation != generation {
                debug!(%key, generation, current = slot.generation, "discarding superseded fetch result");
                return;
            }
            match outcome {
                Ok(payload) => {
                    slot.data = Some(payload.clone());
                    slot.last_fetched_at = Some(Instant::now());
                    slot.error = None;
                    slot.state = if invalidated {
                        EntryState::Stale
                    } else {
                        EntryState::Fresh
                    };
                    events.push(CacheEvent::Updated(key.clone()));
                    if invalidated {
                        events.push(CacheEvent::Invalidated(key.clone()));
                    }
                }
                Err(err) if err.is_aborted() => {
                    slot.state = EntryState::Stale;
                }
                Err(err) => {
                    debug!(%key, generation, kind = %err.kind, "fetch failed");
                    slot.state = EntryState::Errored;
                    slot.error = Some(err.clone());
                    events.push(CacheEvent::Updated(key.clone()));
                }
            }
            debug!(%key, generation, state = ?slot.state, "fetch settled");
        }
        for event in events {
            let _ = self.shared.events.send(event);
        }
    }

    /// Mark `keys` stale. Nothing is fetched here; mounted queries observing
    /// a key refetch when they see the `Invalidated` event, everyone else on
    /// their next `ensure_fresh`. Returns the keys that have observers.
    pub fn invalidate(&self, keys: &InvalidationSet) -> Vec<CacheKey> {
        let mut touched = Vec::new();
        let mut observed = Vec::new();
        {
            let mut guard = self.shared.inner.lock();
            let inner = &mut *guard;
            for key in keys.iter() {
                let Some(slot) = inner.entries.get_mut(key) else {
                    continue;
                };
                match inner.in_flight.get_mut(key) {
                    Some(flight) => flight.invalidated = true,
                    None => slot.state = EntryState::Stale,
                }
                touched.push(key.clone());
                if inner.observers.get(key).is_some_and(|count| *count > 0) {
                    observed.push(key.clone());
                }
            }
        }
        info!(keys = touched.len(), observed = observed.len(), "invalidated cache keys");
        for key in touched {
            let _ = self.shared.events.send(CacheEvent::Invalidated(key));
        }
        observed
    }

    /// Drop every entry and cancel every in-flight fetch.
    pub fn clear(&self) {
        self.clear_with(ClassifiedError::aborted());
    }

    /// `clear`, but waiters of the cancelled fetches receive `reason`
    /// instead of `Aborted`.
    pub fn clear_with(&self, reason: ClassifiedError) {
        let flights: Vec<InFlight> = {
            let mut inner = self.shared.inner.lock();
            inner.entries.clear();
            inner.in_flight.drain().map(|(_, flight)| flight).collect()
        };
        info!(cancelled = flights.len(), "cache cleared");
        for flight in flights {
            let _ = flight.reason.set(reason.clone());
            flight.cancel.cancel();
        }
        let _ = self.shared.events.send(CacheEvent::Cleared);
    }

    /// Register an active observer of `key` for as long as the guard lives.
    pub fn observe(&self, key: &CacheKey) -> ObserverGuard {
        *self.shared.inner.lock().observers.entry(key.clone()).or_insert(0) += 1;
        ObserverGuard {
            key: key.clone(),
            cache: Arc::downgrade(&self.shared),
        }
    }

    pub fn observer_count(&self, key: &CacheKey) -> usize {
        self.shared.inner.lock().observers.get(key).copied().unwrap_or(0)
    }
}

fn downcast<T: Send + Sync + 'static>(key: &CacheKey, payload: Payload) -> Result<Arc<T>, ClassifiedError> {
    payload
        .downcast::<T>()
        .map_err(|_| ClassifiedError::invalid_payload(format!("cached value for {key} has a different type")))
}

/// One waiter's claim on a flight.
struct Interest {
    key: CacheKey,
    generation: u64,
    cache: Weak<CacheShared>,
}

impl Interest {
    fn detached(key: &CacheKey) -> Self {
        Self {
            key: key.clone(),
            generation: 0,
            cache: Weak::new(),
        }
    }
}

impl Drop for Interest {
    fn drop(&mut self) {
        let Some(shared) = self.cache.upgrade() else {
            return;
        };
        let mut guard = shared.inner.lock();
        let inner = &mut *guard;
        let Some(flight) = inner.in_flight.get_mut(&self.key) else {
            return;
        };
        if flight.generation != self.generation {
            return;
        }
        flight.interest -= 1;
        if flight.interest > 0 {
            return;
        }
        if let Some(flight) = inner.in_flight.remove(&self.key) {
            flight.cancel.cancel();
        }
        if let Some(slot) = inner.entries.get_mut(&self.key) {
            if slot.generation == self.generation {
                slot.state = EntryState::Stale;
            }
        }
        debug!(key = %self.key, generation = self.generation, "last waiter left, fetch cancelled");
    }
}

/// Keeps a key counted as observed until dropped.
pub struct ObserverGuard {
    key: CacheKey,
    cache: Weak<CacheShared>,
}

impl Drop for ObserverGuard {
    fn drop(&mut self) {
        let Some(shared) = self.cache.upgrade() else {
            return;
        };
        let mut inner = shared.inner.lock();
        if let Some(count) = inner.observers.get_mut(&self.key) {
            *count -= 1;
            if *count == 0 {
                inner.observers.remove(&self.key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::future::join_all;

    use super::*;

    const TTL: Duration = Duration::from_secs(30);

    fn key(name: &str) -> CacheKey {
        CacheKey::new(name)
    }

    /// Fetcher returning `value` after `delay`, counting invocations.
    fn counting(
        calls: &Arc<AtomicUsize>,
        value: &'static str,
        delay: Duration,
    ) -> impl FnOnce(CancellationToken) -> BoxFuture<'static, Result<String, ClassifiedError>> {
        let calls = calls.clone();
        move |_token| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                tokio::time::sleep(delay).await;
                Ok(value.to_string())
            }
            .boxed()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn second_read_within_ttl_uses_cache() {
        let cache = QueryCache::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let first = cache
            .ensure_fresh(key("clients"), counting(&calls, "acme", Duration::ZERO), TTL)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        let second = cache
            .ensure_fresh(key("clients"), counting(&calls, "other", Duration::ZERO), TTL)
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.read(&key("clients")).unwrap().state, EntryState::Fresh);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_ttl_refetches() {
        let cache = QueryCache::new();
        let calls = Arc::new(AtomicUsize::new(0));

        cache
            .ensure_fresh(key("clients"), counting(&calls, "v1", Duration::ZERO), TTL)
            .await
            .unwrap();
        tokio::time::sleep(TTL).await;
        let value = cache
            .ensure_fresh(key("clients"), counting(&calls, "v2", Duration::ZERO), TTL)
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(*value, "v2");
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_reads_share_one_fetch() {
        let cache = QueryCache::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let reads = (0..8).map(|_| {
            cache.ensure_fresh(key("clients"), counting(&calls, "acme", Duration::from_millis(50)), TTL)
        });
        let results = join_all(reads).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let first = results[0].as_ref().unwrap();
        for result in &results {
            assert!(Arc::ptr_eq(first, result.as_ref().unwrap()));
        }
        assert_eq!(cache.in_flight_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_reads_share_one_error() {
        let cache = QueryCache::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let reads = (0..4).map(|_| {
            let calls = calls.clone();
            cache.ensure_fresh::<String, _, _>(
                key("clients"),
                move |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Err(ClassifiedError::new(ErrorKind::ServerError, Some(500), "boom"))
                    }
                },
                TTL,
            )
        });
        let results = join_all(reads).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for result in results {
            assert_eq!(result.unwrap_err().message, "boom");
        }
        let entry = cache.read(&key("clients")).unwrap();
        assert_eq!(entry.state, EntryState::Errored);
        assert_eq!(entry.error.unwrap().status, Some(500));
    }

    #[tokio::test(start_paused = true)]
    async fn error_keeps_last_known_good_data() {
        let cache = QueryCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        cache
            .ensure_fresh(key("clients"), counting(&calls, "good", Duration::ZERO), TTL)
            .await
            .unwrap();

        let err = cache
            .ensure_fresh::<String, _, _>(
                key("clients"),
                |_| async { Err(ClassifiedError::new(ErrorKind::ServerError, Some(503), "down")) },
                Duration::ZERO,
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::ServerError);
        let entry = cache.read(&key("clients")).unwrap();
        assert_eq!(entry.state, EntryState::Errored);
        assert_eq!(*entry.data_as::<String>().unwrap(), "good");
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_generation_cannot_overwrite_newer_entry() {
        let cache = QueryCache::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let slow = {
            let cache = cache.clone();
            let fetcher = counting(&calls, "old", Duration::from_secs(5));
            tokio::spawn(async move { cache.ensure_fresh(key("clients"), fetcher, TTL).await })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;
        let old_generation = cache.read(&key("clients")).unwrap().generation;

        cache.clear();
        let fresh = cache
            .ensure_fresh(key("clients"), counting(&calls, "new", Duration::ZERO), TTL)
            .await
            .unwrap();
        assert_eq!(*fresh, "new");
        let entry = cache.read(&key("clients")).unwrap();
        assert!(entry.generation > old_generation);

        // The late response of the older generation arrives now.
        let late: Payload = Arc::new("old".to_string());
        cache.settle(&key("clients"), old_generation, &Ok(late));

        let after = cache.read(&key("clients")).unwrap();
        assert_eq!(after.state, EntryState::Fresh);
        assert_eq!(after.generation, entry.generation);
        assert_eq!(*after.data_as::<String>().unwrap(), "new");
        assert!(slow.await.unwrap().unwrap_err().is_aborted());
    }

    #[tokio::test(start_paused = true)]
    async fn invalidate_marks_exactly_the_declared_keys() {
        let cache = QueryCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        for name in ["clients", "invoices", "tasks"] {
            cache
                .ensure_fresh(key(name), counting(&calls, "v", Duration::ZERO), TTL)
                .await
                .unwrap();
        }

        let observed = cache.invalidate(&InvalidationSet::of(["clients", "invoices", "missing"]));

        assert!(observed.is_empty());
        assert_eq!(cache.read(&key("clients")).unwrap().state, EntryState::Stale);
        assert_eq!(cache.read(&key("invoices")).unwrap().state, EntryState::Stale);
        assert_eq!(cache.read(&key("tasks")).unwrap().state, EntryState::Fresh);
        assert!(cache.read(&key("missing")).is_none());

        cache
            .ensure_fresh(key("clients"), counting(&calls, "v2", Duration::ZERO), TTL)
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn invalidation_during_fetch_commits_stale() {
        let cache = QueryCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut events = cache.subscribe();

        let pending = {
            let cache = cache.clone();
            let fetcher = counting(&calls, "pre-write", Duration::from_millis(100));
            tokio::spawn(async move { cache.ensure_fresh(key("clients"), fetcher, TTL).await })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(cache.read(&key("clients")).unwrap().state, EntryState::Fetching);

        cache.invalidate(&InvalidationSet::of(["clients"]));
        assert_eq!(cache.read(&key("clients")).unwrap().state, EntryState::Fetching);

        assert_eq!(*pending.await.unwrap().unwrap(), "pre-write");
        assert_eq!(cache.read(&key("clients")).unwrap().state, EntryState::Stale);

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert_eq!(
            seen,
            vec![
                CacheEvent::Invalidated(key("clients")),
                CacheEvent::Updated(key("clients")),
                CacheEvent::Invalidated(key("clients")),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn last_waiter_leaving_cancels_the_fetch() {
        let cache = QueryCache::new();
        let seen_token = Arc::new(Mutex::new(None::<CancellationToken>));

        let waiter = {
            let cache = cache.clone();
            let slot = seen_token.clone();
            tokio::spawn(async move {
                cache
                    .ensure_fresh::<String, _, _>(
                        key("clients"),
                        move |token| {
                            *slot.lock() = Some(token.clone());
                            async move {
                                token.cancelled().await;
                                Err(ClassifiedError::aborted())
                            }
                        },
                        TTL,
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;
        waiter.abort();
        let _ = waiter.await;

        let token = seen_token.lock().clone().unwrap();
        assert!(token.is_cancelled());
        assert_eq!(cache.in_flight_count(), 0);
        assert_eq!(cache.read(&key("clients")).unwrap().state, EntryState::Stale);
    }

    #[tokio::test(start_paused = true)]
    async fn shared_fetch_survives_one_waiter_leaving() {
        let cache = QueryCache::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let leaving = {
            let cache = cache.clone();
            let fetcher = counting(&calls, "acme", Duration::from_millis(100));
            tokio::spawn(async move { cache.ensure_fresh(key("clients"), fetcher, TTL).await })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;
        let staying = {
            let cache = cache.clone();
            let fetcher = counting(&calls, "unused", Duration::ZERO);
            tokio::spawn(async move { cache.ensure_fresh(key("clients"), fetcher, TTL).await })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;
        leaving.abort();
        let _ = leaving.await;

        assert_eq!(*staying.await.unwrap().unwrap(), "acme");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.read(&key("clients")).unwrap().state, EntryState::Fresh);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_drops_entries_and_aborts_waiters() {
        let cache = QueryCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        cache
            .ensure_fresh(key("invoices"), counting(&calls, "v", Duration::ZERO), TTL)
            .await
            .unwrap();
        let pending = {
            let cache = cache.clone();
            let fetcher = counting(&calls, "v", Duration::from_secs(1));
            tokio::spawn(async move { cache.ensure_fresh(key("clients"), fetcher, TTL).await })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;

        cache.clear();

        assert!(pending.await.unwrap().unwrap_err().is_aborted());
        assert!(cache.is_empty());
        assert_eq!(cache.in_flight_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_with_hands_its_reason_to_waiters() {
        let cache = QueryCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let pending = {
            let cache = cache.clone();
            let fetcher = counting(&calls, "v", Duration::from_secs(1));
            tokio::spawn(async move { cache.ensure_fresh(key("clients"), fetcher, TTL).await })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;

        cache.clear_with(ClassifiedError::new(ErrorKind::Unauthorized, Some(401), "session expired"));

        let err = pending.await.unwrap().unwrap_err();
        assert!(err.is_auth_required());
        assert_eq!(err.message, "session expired");
        assert_eq!(cache.in_flight_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn type_mismatch_is_invalid_payload() {
        let cache = QueryCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        cache
            .ensure_fresh(key("clients"), counting(&calls, "text", Duration::ZERO), TTL)
            .await
            .unwrap();

        let err = cache
            .ensure_fresh::<u32, _, _>(key("clients"), |_| async { Ok(1) }, TTL)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidPayload);
    }

    #[test]
    fn observers_are_counted_per_key() {
        let cache = QueryCache::new();
        let a = cache.observe(&key("clients"));
        let b = cache.observe(&key("clients"));
        assert_eq!(cache.observer_count(&key("clients")), 2);
        drop(a);
        assert_eq!(cache.observer_count(&key("clients")), 1);
        drop(b);
        assert_eq!(cache.observer_count(&key("clients")), 0);
    }
}
