//! The data-access service object.
//!
//! # Design
//! `DataClient` is built once at startup and shared by reference (or `Arc`)
//! with every consumer. It owns one `SessionSignal`, one `QueryCache` and
//! one `RequestExecutor`, and wires the session-expiry protocol: the cache
//! purge is registered at `Stage::Purge`, navigation handlers added through
//! `on_session_expired` run at `Stage::Navigate`, after the purge.

use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cache::QueryCache;
use crate::config::ClientConfig;
use crate::descriptor::{InvalidationSet, RequestDescriptor};
use crate::error::{ClassifiedError, ConfigError, ErrorKind};
use crate::executor::RequestExecutor;
use crate::http::Transport;
use crate::mutation::MutationCoordinator;
use crate::query::{QueryCoordinator, QueryHandle, QueryOptions};
use crate::resources;
use crate::session::{SessionSignal, SessionSubscription, Stage};
use crate::transport::ReqwestTransport;
use crate::types::Credentials;

pub struct DataClient {
    config: ClientConfig,
    session: SessionSignal,
    cache: QueryCache,
    executor: Arc<RequestExecutor>,
    queries: QueryCoordinator,
    mutations: MutationCoordinator,
    _purge: SessionSubscription,
}

impl std::fmt::Debug for DataClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataClient")
            .field("config", &self.config)
            .field("session", &self.session)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl DataClient {
    pub fn new(config: ClientConfig, transport: Arc<dyn Transport>) -> Result<Self, ConfigError> {
        config.validate()?;
        let session = SessionSignal::new();
        let cache = QueryCache::new();
        let executor = Arc::new(RequestExecutor::new(&config, transport, session.clone()));

        let purged = cache.clone();
        let purge = session.subscribe(Stage::Purge, move || {
            let cache = purged.clone();
            async move { cache.clear_with(ClassifiedError::new(ErrorKind::Unauthorized, Some(401), "session expired")) }
        });

        Ok(Self {
            queries: QueryCoordinator::new(cache.clone(), executor.clone()),
            mutations: MutationCoordinator::new(cache.clone(), executor.clone()),
            config,
            session,
            cache,
            executor,
            _purge: purge,
        })
    }

    /// Build a client over `ReqwestTransport`.
    pub fn connect(config: ClientConfig) -> Result<Self, ConfigError> {
        let transport = ReqwestTransport::new()?;
        Self::new(config, Arc::new(transport))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn session(&self) -> &SessionSignal {
        &self.session
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    pub fn executor(&self) -> &Arc<RequestExecutor> {
        &self.executor
    }

    pub fn queries(&self) -> &QueryCoordinator {
        &self.queries
    }

    pub fn mutations(&self) -> &MutationCoordinator {
        &self.mutations
    }

    pub fn query_options(&self) -> QueryOptions {
        QueryOptions::from_config(&self.config)
    }

    /// Mount a query with the configured stale time and refetch interval.
    pub fn mount<T>(&self, descriptor: RequestDescriptor) -> QueryHandle<T>
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        self.queries.mount(descriptor, self.query_options())
    }

    /// Read through the cache with the configured stale time.
    pub async fn fetch<T>(&self, descriptor: &RequestDescriptor) -> Result<Arc<T>, ClassifiedError>
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        self.queries.fetch(descriptor, self.config.stale_time()).await
    }

    pub async fn mutate<T: DeserializeOwned>(
        &self,
        descriptor: &RequestDescriptor,
        invalidation: &InvalidationSet,
    ) -> Result<T, ClassifiedError> {
        self.mutations.run(descriptor, invalidation).await
    }

    /// Register the redirect-to-login reaction. Runs after the cache purge.
    pub fn on_session_expired<F, Fut>(&self, handler: F) -> SessionSubscription
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.session.subscribe(Stage::Navigate, handler)
    }

    /// Record a login performed outside this client (e.g. by a shared cookie jar).
    pub fn mark_authenticated(&self) {
        self.session.mark_authenticated();
    }

    pub async fn login(&self, credentials: &Credentials) -> Result<(), ClassifiedError> {
        let descriptor = resources::session::login(credentials)
            .map_err(|e| ClassifiedError::new(ErrorKind::ClientError, None, e.to_string()))?;
        self.executor
            .execute_once(&descriptor, &CancellationToken::new())
            .await?;
        self.session.mark_authenticated();
        info!("session established");
        Ok(())
    }

    /// End the session server-side and drop everything cached under it.
    /// Mounted queries move to `AuthRequired`; no expiry handler runs.
    pub async fn logout(&self) -> Result<(), ClassifiedError> {
        let descriptor = resources::session::logout()
            .map_err(|e| ClassifiedError::new(ErrorKind::ClientError, None, e.to_string()))?;
        self.session.end();
        let result = self
            .executor
            .execute_once(&descriptor, &CancellationToken::new())
            .await;
        self.cache.clear();
        result.map(|_| ())
    }
}
