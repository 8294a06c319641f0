//! Write path: execute once, then invalidate.
//!
//! Mutations are never retried and never deduplicated. A write that failed
//! ambiguously (timeout, dropped connection) may or may not have reached the
//! server, and repeating it could create a second record. The cache is only
//! touched after the response has been received and decoded, so a failed
//! write leaves every cached entry exactly as it was.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::QueryCache;
use crate::descriptor::{InvalidationSet, RequestDescriptor};
use crate::error::ClassifiedError;
use crate::executor::{decode, RequestExecutor};

#[derive(Debug, Clone)]
pub struct MutationCoordinator {
    cache: QueryCache,
    executor: Arc<RequestExecutor>,
}

impl MutationCoordinator {
    pub fn new(cache: QueryCache, executor: Arc<RequestExecutor>) -> Self {
        Self { cache, executor }
    }

    pub async fn run<T: DeserializeOwned>(
        &self,
        descriptor: &RequestDescriptor,
        invalidation: &InvalidationSet,
    ) -> Result<T, ClassifiedError> {
        self.run_with_cancel(descriptor, invalidation, &CancellationToken::new())
            .await
    }

    pub async fn run_with_cancel<T: DeserializeOwned>(
        &self,
        descriptor: &RequestDescriptor,
        invalidation: &InvalidationSet,
        cancel: &CancellationToken,
    ) -> Result<T, ClassifiedError> {
        let endpoint = descriptor.endpoint();
        let method = descriptor.method().as_str();
        let result = self
            .executor
            .execute_once(descriptor, cancel)
            .await
            .and_then(|response| decode::<T>(&response));

        match result {
            Ok(value) => {
                let observed = self.cache.invalidate(invalidation);
                debug!(method, endpoint, invalidated = invalidation.len(), observed = observed.len(), "mutation committed");
                Ok(value)
            }
            Err(err) => {
                warn!(method, endpoint, kind = %err.kind, "mutation failed, cache left untouched");
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde::Deserialize;

    use super::*;
    use crate::cache::EntryState;
    use crate::config::ClientConfig;
    use crate::descriptor::CacheKey;
    use crate::error::ErrorKind;
    use crate::http::TransportError;
    use crate::session::SessionSignal;
    use crate::testing::{ScriptedTransport, Step};

    #[derive(Debug, Deserialize)]
    struct Created {
        id: u32,
    }

    const TTL: Duration = Duration::from_secs(30);

    fn mutations(transport: &ScriptedTransport, cache: &QueryCache) -> MutationCoordinator {
        let config = ClientConfig::new("http://api.test");
        let executor = RequestExecutor::new(&config, Arc::new(transport.clone()), SessionSignal::new());
        MutationCoordinator::new(cache.clone(), Arc::new(executor))
    }

    async fn seed(cache: &QueryCache, names: &[&str]) {
        for name in names {
            let value = name.to_string();
            cache
                .ensure_fresh(CacheKey::new(name), move |_| async move { Ok(value) }, TTL)
                .await
                .unwrap();
        }
    }

    fn create() -> RequestDescriptor {
        RequestDescriptor::post("/clients")
            .json(&serde_json::json!({"name": "Acme"}))
            .build()
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn success_invalidates_exactly_the_declared_keys() {
        let cache = QueryCache::new();
        seed(&cache, &["clients", "invoices", "tasks"]).await;
        let transport = ScriptedTransport::new([Step::status(201, r#"{"id":42}"#)]);

        let created: Created = mutations(&transport, &cache)
            .run(&create(), &InvalidationSet::of(["clients", "invoices"]))
            .await
            .unwrap();

        assert_eq!(created.id, 42);
        assert_eq!(cache.read(&CacheKey::new("clients")).unwrap().state, EntryState::Stale);
        assert_eq!(cache.read(&CacheKey::new("invoices")).unwrap().state, EntryState::Stale);
        assert_eq!(cache.read(&CacheKey::new("tasks")).unwrap().state, EntryState::Fresh);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_leaves_cache_untouched() {
        let cache = QueryCache::new();
        seed(&cache, &["clients", "invoices"]).await;
        let before: Vec<_> = ["clients", "invoices"]
            .iter()
            .map(|name| cache.read(&CacheKey::new(name)).unwrap())
            .collect();
        let transport = ScriptedTransport::new([Step::status(500, r#"{"message":"ledger locked"}"#)]);

        let err = mutations(&transport, &cache)
            .run::<Created>(&create(), &InvalidationSet::of(["clients", "invoices"]))
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::ServerError);
        assert_eq!(err.message, "ledger locked");
        for entry in before {
            let after = cache.read(&entry.key).unwrap();
            assert_eq!(after.state, entry.state);
            assert_eq!(after.generation, entry.generation);
            assert_eq!(after.last_fetched_at, entry.last_fetched_at);
            assert!(Arc::ptr_eq(after.data.as_ref().unwrap(), entry.data.as_ref().unwrap()));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn network_failure_is_not_retried() {
        let cache = QueryCache::new();
        let transport = ScriptedTransport::new([Step::Fail(TransportError::Connect("reset".into()))]);
        let retryable = RequestDescriptor::post("/clients").retryable(true).build().unwrap();

        let err = mutations(&transport, &cache)
            .run::<Created>(&retryable, &InvalidationSet::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::Network);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn undecodable_success_does_not_invalidate() {
        let cache = QueryCache::new();
        seed(&cache, &["clients"]).await;
        let transport = ScriptedTransport::new([Step::status(201, "not json")]);

        let err = mutations(&transport, &cache)
            .run::<Created>(&create(), &InvalidationSet::of(["clients"]))
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::InvalidPayload);
        assert_eq!(cache.read(&CacheKey::new("clients")).unwrap().state, EntryState::Fresh);
    }

    #[tokio::test(start_paused = true)]
    async fn delete_with_empty_body_decodes_to_unit() {
        let cache = QueryCache::new();
        seed(&cache, &["clients"]).await;
        let transport = ScriptedTransport::new([Step::status(204, "")]);
        let delete = RequestDescriptor::delete("/clients/1").build().unwrap();

        mutations(&transport, &cache)
            .run::<()>(&delete, &InvalidationSet::of(["clients"]))
            .await
            .unwrap();

        assert_eq!(cache.read(&CacheKey::new("clients")).unwrap().state, EntryState::Stale);
    }
}
