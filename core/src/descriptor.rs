//! Request descriptors, cache keys and invalidation sets.
//!
//! # Design
//! A `RequestDescriptor` names a semantic operation ("list clients, page 2"),
//! not an attempt: the executor turns it into a fresh `HttpRequest` for every
//! try. Validation happens once, in `DescriptorBuilder::build`, so the
//! executor never has to reject a descriptor at run time.
//!
//! `CacheKey` is derived from the endpoint and query parameters only. Two
//! descriptors that differ in timeout or retry policy still address the same
//! cached resource.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use reqwest::Url;
use serde::Serialize;

use crate::error::DescriptorError;
use crate::http::{HttpMethod, HttpRequest};

/// An immutable description of one API operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestDescriptor {
    method: HttpMethod,
    endpoint: String,
    query: BTreeMap<String, String>,
    body: Option<String>,
    timeout: Option<Duration>,
    retryable: bool,
}

impl RequestDescriptor {
    pub fn get(endpoint: &str) -> DescriptorBuilder {
        DescriptorBuilder::new(HttpMethod::Get, endpoint)
    }

    pub fn post(endpoint: &str) -> DescriptorBuilder {
        DescriptorBuilder::new(HttpMethod::Post, endpoint)
    }

    pub fn put(endpoint: &str) -> DescriptorBuilder {
        DescriptorBuilder::new(HttpMethod::Put, endpoint)
    }

    pub fn patch(endpoint: &str) -> DescriptorBuilder {
        DescriptorBuilder::new(HttpMethod::Patch, endpoint)
    }

    pub fn delete(endpoint: &str) -> DescriptorBuilder {
        DescriptorBuilder::new(HttpMethod::Delete, endpoint)
    }

    pub fn method(&self) -> HttpMethod {
        self.method
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn body(&self) -> Option<&str> {
        self.body.as_deref()
    }

    /// Per-request timeout, if one was set explicitly.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn retryable(&self) -> bool {
        self.retryable
    }

    pub fn cache_key(&self) -> CacheKey {
        CacheKey {
            endpoint: normalize_endpoint(&self.endpoint),
            params: self.query.clone(),
        }
    }

    /// Render the request for one attempt against `base_url`.
    pub fn to_http_request(&self, base_url: &str) -> Result<HttpRequest, DescriptorError> {
        let joined = format!("{}{}", base_url.trim_end_matches('/'), self.endpoint);
        let mut url = Url::parse(&joined).map_err(|e| DescriptorError::InvalidUrl(format!("{joined}: {e}")))?;
        if !self.query.is_empty() {
            url.query_pairs_mut().extend_pairs(&self.query);
        }
        let mut headers = vec![("accept".to_string(), "application/json".to_string())];
        if self.body.is_some() {
            headers.push(("content-type".to_string(), "application/json".to_string()));
        }
        Ok(HttpRequest {
            method: self.method,
            url: url.into(),
            headers,
            body: self.body.clone(),
        })
    }
}

/// Builder for `RequestDescriptor`. Errors are deferred to `build`.
#[derive(Debug)]
pub struct DescriptorBuilder {
    method: HttpMethod,
    endpoint: String,
    query: BTreeMap<String, String>,
    body: Option<Result<String, DescriptorError>>,
    timeout: Option<Duration>,
    retryable: Option<bool>,
}

impl DescriptorBuilder {
    fn new(method: HttpMethod, endpoint: &str) -> Self {
        Self {
            method,
            endpoint: endpoint.to_string(),
            query: BTreeMap::new(),
            body: None,
            timeout: None,
            retryable: None,
        }
    }

    pub fn query(mut self, name: &str, value: impl ToString) -> Self {
        self.query.insert(name.to_string(), value.to_string());
        self
    }

    pub fn json<T: Serialize>(mut self, body: &T) -> Self {
        self.body = Some(serde_json::to_string(body).map_err(|e| DescriptorError::Serialization(e.to_string())));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Override the default retry policy (reads retry, writes do not).
    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = Some(retryable);
        self
    }

    pub fn build(self) -> Result<RequestDescriptor, DescriptorError> {
        if !self.endpoint.starts_with('/') {
            return Err(DescriptorError::InvalidEndpoint(self.endpoint));
        }
        if self.timeout == Some(Duration::ZERO) {
            return Err(DescriptorError::ZeroTimeout);
        }
        let body = self.body.transpose()?;
        if body.is_some() && matches!(self.method, HttpMethod::Get | HttpMethod::Delete) {
            return Err(DescriptorError::UnexpectedBody(self.method.as_str()));
        }
        Ok(RequestDescriptor {
            method: self.method,
            endpoint: self.endpoint,
            query: self.query,
            body,
            timeout: self.timeout,
            retryable: self.retryable.unwrap_or_else(|| self.method.is_idempotent_read()),
        })
    }
}

/// Identity of a cached resource: endpoint plus query parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    endpoint: String,
    params: BTreeMap<String, String>,
}

impl CacheKey {
    pub fn new(endpoint: &str) -> Self {
        Self {
            endpoint: normalize_endpoint(endpoint),
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, name: &str, value: impl ToString) -> Self {
        self.params.insert(name.to_string(), value.to_string());
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl From<&str> for CacheKey {
    fn from(endpoint: &str) -> Self {
        CacheKey::new(endpoint)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.endpoint)?;
        for (i, (name, value)) in self.params.iter().enumerate() {
            let sep = if i == 0 { '?' } else { '&' };
            write!(f, "{sep}{name}={value}")?;
        }
        Ok(())
    }
}

/// Cache keys a mutation declares as affected.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationSet {
    keys: BTreeSet<CacheKey>,
}

impl InvalidationSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn of<I, K>(keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<CacheKey>,
    {
        keys.into_iter().map(Into::into).collect()
    }

    pub fn with(mut self, key: impl Into<CacheKey>) -> Self {
        self.keys.insert(key.into());
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = &CacheKey> {
        self.keys.iter()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.keys.contains(key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl FromIterator<CacheKey> for InvalidationSet {
    fn from_iter<I: IntoIterator<Item = CacheKey>>(iter: I) -> Self {
        Self {
            keys: iter.into_iter().collect(),
        }
    }
}

fn normalize_endpoint(endpoint: &str) -> String {
    endpoint.trim_matches('/').to_string()
}
