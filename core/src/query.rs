//! Query coordination: binds a consumer's lifetime to a cache key.
//!
//! # Design
//! `QueryCoordinator::mount` spawns one task per consumer. The task registers
//! as an observer of its key, loads through `QueryCache::ensure_fresh`, then
//! waits for work: an explicit `refetch()`, the background revalidation
//! ticker, or cache events (invalidation, sibling updates, clears). State is
//! published on a `watch` channel, so a UI only ever reads the latest value.
//!
//! Every `ensure_fresh` await sits inside a `select!` on the handle's token.
//! Dropping the handle therefore withdraws this consumer's interest in a
//! shared fetch without aborting it for anyone else; the cache cancels the
//! fetch only when its last waiter leaves.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cache::{CacheEvent, EntryState, QueryCache};
use crate::config::ClientConfig;
use crate::descriptor::{CacheKey, RequestDescriptor};
use crate::error::ClassifiedError;
use crate::executor::RequestExecutor;

/// Freshness settings for one mounted query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryOptions {
    /// How long fetched data counts as fresh.
    pub stale_time: Duration,
    /// Force a refetch this often while mounted.
    pub refetch_interval: Option<Duration>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self::from_config(&ClientConfig::default())
    }
}

impl QueryOptions {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            stale_time: config.stale_time(),
            refetch_interval: config.refetch_interval(),
        }
    }

    pub fn stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = stale_time;
        self
    }

    pub fn refetch_interval(mut self, interval: Duration) -> Self {
        self.refetch_interval = Some(interval);
        self
    }
}

/// What a mounted query currently shows.
#[derive(Debug)]
pub enum QueryState<T> {
    Idle,
    Loading,
    Success { data: Arc<T>, is_stale: bool },
    Failed(ClassifiedError),
    /// The session expired; the consumer should not render an error.
    AuthRequired,
}

impl<T> Clone for QueryState<T> {
    fn clone(&self) -> Self {
        match self {
            QueryState::Idle => QueryState::Idle,
            QueryState::Loading => QueryState::Loading,
            QueryState::Success { data, is_stale } => QueryState::Success {
                data: data.clone(),
                is_stale: *is_stale,
            },
            QueryState::Failed(err) => QueryState::Failed(err.clone()),
            QueryState::AuthRequired => QueryState::AuthRequired,
        }
    }
}

impl<T> QueryState<T> {
    pub fn data(&self) -> Option<&Arc<T>> {
        match self {
            QueryState::Success { data, .. } => Some(data),
            _ => None,
        }
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, QueryState::Loading)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, QueryState::Success { .. })
    }

    pub fn is_error(&self) -> bool {
        matches!(self, QueryState::Failed(_))
    }

    pub fn is_auth_required(&self) -> bool {
        matches!(self, QueryState::AuthRequired)
    }

    fn from_error(err: ClassifiedError) -> Self {
        if err.is_auth_required() {
            QueryState::AuthRequired
        } else {
            QueryState::Failed(err)
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueryCoordinator {
    cache: QueryCache,
    executor: Arc<RequestExecutor>,
}

impl QueryCoordinator {
    pub fn new(cache: QueryCache, executor: Arc<RequestExecutor>) -> Self {
        Self { cache, executor }
    }

    /// One-shot read through the cache.
    pub async fn fetch<T>(&self, descriptor: &RequestDescriptor, ttl: Duration) -> Result<Arc<T>, ClassifiedError>
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        let fetcher = fetcher::<T>(self.executor.clone(), descriptor.clone());
        self.cache.ensure_fresh(descriptor.cache_key(), fetcher, ttl).await
    }

    /// Mount a consumer of `descriptor`. The query stays live until the
    /// returned handle is dropped or unmounted.
    pub fn mount<T>(&self, descriptor: RequestDescriptor, options: QueryOptions) -> QueryHandle<T>
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        let key = descriptor.cache_key();
        let (state_tx, state_rx) = watch::channel(QueryState::Idle);
        let (refetch_tx, refetch_rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let task = QueryTask {
            key: key.clone(),
            descriptor,
            options,
            cache: self.cache.clone(),
            executor: self.executor.clone(),
            state: state_tx,
            refetch: refetch_rx,
            token: token.clone(),
        };
        debug!(%key, "query mounted");
        QueryHandle {
            key,
            state: state_rx,
            refetch: refetch_tx,
            token,
            join: Some(tokio::spawn(task.run())),
        }
    }
}

fn fetcher<T>(
    executor: Arc<RequestExecutor>,
    descriptor: RequestDescriptor,
) -> impl FnOnce(CancellationToken) -> BoxFuture<'static, Result<T, ClassifiedError>>
where
    T: DeserializeOwned + Send + 'static,
{
    move |token| async move { executor.execute_json::<T>(&descriptor, &token).await }.boxed()
}

struct QueryTask<T> {
    key: CacheKey,
    descriptor: RequestDescriptor,
    options: QueryOptions,
    cache: QueryCache,
    executor: Arc<RequestExecutor>,
    state: watch::Sender<QueryState<T>>,
    refetch: mpsc::UnboundedReceiver<()>,
    token: CancellationToken,
}

impl<T> QueryTask<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    async fn run(mut self) {
        let _observer = self.cache.observe(&self.key);
        let mut events = self.cache.subscribe();
        let mut ticker = self.options.refetch_interval.map(|period| {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        self.publish_cached();
        if !self.refresh(self.options.stale_time).await {
            return;
        }

        loop {
            let ttl = tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                request = self.refetch.recv() => match request {
                    Some(()) => Duration::ZERO,
                    None => break,
                },
                _ = tick(&mut ticker) => Duration::ZERO,
                event = events.recv() => match event {
                    Ok(CacheEvent::Invalidated(key)) if key == self.key => self.options.stale_time,
                    Ok(CacheEvent::Updated(key)) if key == self.key => {
                        self.publish_cached();
                        continue;
                    }
                    Ok(CacheEvent::Cleared) => {
                        if !self.executor.session().is_authenticated() {
                            self.state.send_replace(QueryState::AuthRequired);
                            continue;
                        }
                        self.options.stale_time
                    }
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(key = %self.key, skipped, "cache events lagged, revalidating");
                        self.options.stale_time
                    }
                    Err(RecvError::Closed) => break,
                },
            };
            if !self.refresh(ttl).await {
                break;
            }
        }
        debug!(key = %self.key, "query unmounted");
    }

    /// Returns `false` when the consumer went away mid-fetch.
    async fn refresh(&mut self, ttl: Duration) -> bool {
        if self.state.borrow().data().is_none() {
            self.state.send_replace(QueryState::Loading);
        }
        let fetcher = fetcher::<T>(self.executor.clone(), self.descriptor.clone());
        let result = tokio::select! {
            biased;
            _ = self.token.cancelled() => return false,
            result = self.cache.ensure_fresh(self.key.clone(), fetcher, ttl) => result,
        };
        match result {
            Ok(data) => {
                let is_stale = self
                    .cache
                    .read(&self.key)
                    .is_some_and(|entry| entry.state != EntryState::Fresh);
                self.state.send_replace(QueryState::Success { data, is_stale });
            }
            Err(err) if err.is_aborted() => {}
            Err(err) => {
                self.state.send_replace(QueryState::from_error(err));
            }
        }
        true
    }

    fn publish_cached(&self) {
        let Some(entry) = self.cache.read(&self.key) else {
            return;
        };
        if entry.state == EntryState::Errored {
            if let Some(err) = entry.error {
                self.state.send_replace(QueryState::from_error(err));
            }
            return;
        }
        if let Some(data) = entry.data_as::<T>() {
            let is_stale = entry.state != EntryState::Fresh;
            self.state.send_replace(QueryState::Success { data, is_stale });
        }
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => futures::future::pending().await,
    }
}

/// A mounted query. Dropping it unmounts the consumer.
pub struct QueryHandle<T> {
    key: CacheKey,
    state: watch::Receiver<QueryState<T>>,
    refetch: mpsc::UnboundedSender<()>,
    token: CancellationToken,
    join: Option<JoinHandle<()>>,
}

impl<T> QueryHandle<T> {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn state(&self) -> QueryState<T> {
        self.state.borrow().clone()
    }

    /// Wait for the next published state. `None` once the query is gone.
    pub async fn changed(&mut self) -> Option<QueryState<T>> {
        self.state.changed().await.ok()?;
        Some(self.state.borrow_and_update().clone())
    }

    /// Wait until the state satisfies `predicate`.
    pub async fn wait_for(&mut self, predicate: impl FnMut(&QueryState<T>) -> bool) -> Option<QueryState<T>> {
        self.state.wait_for(predicate).await.ok().map(|state| state.clone())
    }

    /// Force a refetch regardless of freshness.
    pub fn refetch(&self) {
        let _ = self.refetch.send(());
    }

    pub async fn unmount(mut self) {
        self.token.cancel();
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }
}

impl<T> Drop for QueryHandle<T> {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
