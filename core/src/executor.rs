//! Executes `RequestDescriptor`s with timeout, cancellation and bounded retry.
//!
//! # Design
//! `execute` is an explicit loop: build the request, run one attempt, classify
//! the outcome, then either return, or sleep the policy's backoff and go
//! again. Each attempt races the transport against the descriptor timeout and
//! the caller's cancellation token; losing either race drops the transport
//! future, which releases the underlying connection.
//!
//! A 401 is turned into the session-expiry protocol before the error is
//! returned. The executor never touches the cache.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::classify::{classify, to_error, Outcome};
use crate::config::ClientConfig;
use crate::descriptor::RequestDescriptor;
use crate::error::{ClassifiedError, ErrorKind};
use crate::http::{HttpRequest, HttpResponse, Transport};
use crate::retry::RetryPolicy;
use crate::session::SessionSignal;

pub struct RequestExecutor {
    transport: Arc<dyn Transport>,
    base_url: String,
    default_timeout: Duration,
    policy: RetryPolicy,
    session: SessionSignal,
}

impl std::fmt::Debug for RequestExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestExecutor")
            .field("base_url", &self.base_url)
            .field("default_timeout", &self.default_timeout)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl RequestExecutor {
    pub fn new(config: &ClientConfig, transport: Arc<dyn Transport>, session: SessionSignal) -> Self {
        Self {
            transport,
            base_url: config.base_url.clone(),
            default_timeout: config.timeout(),
            policy: RetryPolicy::from_config(config),
            session,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn session(&self) -> &SessionSignal {
        &self.session
    }

    /// Run `descriptor`, retrying transient failures if it is retryable.
    pub async fn execute(
        &self,
        descriptor: &RequestDescriptor,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse, ClassifiedError> {
        self.run(descriptor, cancel, descriptor.retryable()).await
    }

    /// Run `descriptor` exactly once, whatever its retry flag says.
    pub async fn execute_once(
        &self,
        descriptor: &RequestDescriptor,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse, ClassifiedError> {
        self.run(descriptor, cancel, false).await
    }

    /// `execute` followed by `decode`.
    pub async fn execute_json<T: DeserializeOwned>(
        &self,
        descriptor: &RequestDescriptor,
        cancel: &CancellationToken,
    ) -> Result<T, ClassifiedError> {
        let response = self.execute(descriptor, cancel).await?;
        decode(&response)
    }

    async fn run(
        &self,
        descriptor: &RequestDescriptor,
        cancel: &CancellationToken,
        retryable: bool,
    ) -> Result<HttpResponse, ClassifiedError> {
        let request = descriptor
            .to_http_request(&self.base_url)
            .map_err(|e| ClassifiedError::new(ErrorKind::ClientError, None, e.to_string()))?;
        let timeout = descriptor.timeout().unwrap_or(self.default_timeout);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let epoch = self.session.epoch();
            let outcome = self.attempt(request.clone(), timeout, cancel).await;
            let kind = classify(&outcome);
            debug!(method = request.method.as_str(), url = %request.url, attempt, %kind, "attempt finished");

            let outcome = match outcome {
                Outcome::Response(response) if kind == ErrorKind::Success => return Ok(response),
                other => other,
            };

            match kind {
                ErrorKind::Unauthorized => {
                    if self.session.expire(epoch).await {
                        info!(url = %request.url, "401 received, session expiry issued");
                    }
                    return Err(to_error(kind, &outcome));
                }
                _ if self.policy.should_retry(kind, retryable, attempt) => {
                    let delay = self.policy.backoff(attempt);
                    warn!(url = %request.url, attempt, %kind, delay_ms = delay.as_millis() as u64, "retrying request");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(ClassifiedError::aborted()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    continue;
                }
                _ => {}
            }

            let err = to_error(kind, &outcome);
            if kind.is_transient() && retryable {
                warn!(url = %request.url, attempts = attempt, %kind, "giving up after retries");
            }
            return Err(err);
        }
    }

    async fn attempt(&self, request: HttpRequest, timeout: Duration, cancel: &CancellationToken) -> Outcome {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Outcome::Cancelled,
            result = tokio::time::timeout(timeout, self.transport.send(request)) => match result {
                Ok(Ok(response)) => Outcome::Response(response),
                Ok(Err(err)) => Outcome::Transport(err),
                Err(_) => Outcome::TimedOut,
            },
        }
    }
}

/// Validate a JSON response body into `T`. An empty body reads as `null`,
/// so `()` and `Option<_>` decode from 204 responses.
pub fn decode<T: DeserializeOwned>(response: &HttpResponse) -> Result<T, ClassifiedError> {
    let body = if response.body.trim().is_empty() {
        "null"
    } else {
        response.body.as_str()
    };
    serde_json::from_str(body).map_err(|e| {
        ClassifiedError::new(
            ErrorKind::InvalidPayload,
            Some(response.status),
            format!("unexpected response shape: {e}"),
        )
    })
}
