//! `Transport` backed by reqwest.
//!
//! The client keeps a cookie store so the backend's session cookie rides on
//! every request. No client-level timeout is configured: the executor owns
//! deadlines and drops the request future when one fires.

use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::{Client, Method};

use crate::error::ConfigError;
use crate::http::{HttpMethod, HttpRequest, HttpResponse, Transport, TransportError};

#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, ConfigError> {
        let client = Client::builder()
            .cookie_store(true)
            .build()
            .map_err(|e| ConfigError::Transport(e.to_string()))?;
        Ok(Self::with_client(client))
    }

    /// Wrap an existing client, e.g. one sharing a cookie jar with a login flow.
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    async fn round_trip(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut builder = self.client.request(method(request.method), &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(map_error)?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| Some((name.to_string(), value.to_str().ok()?.to_string())))
            .collect();
        let body = response.text().await.map_err(map_error)?;

        Ok(HttpResponse { status, headers, body })
    }
}

impl Transport for ReqwestTransport {
    fn send(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, TransportError>> {
        self.round_trip(request).boxed()
    }
}

fn method(method: HttpMethod) -> Method {
    match method {
        HttpMethod::Get => Method::GET,
        HttpMethod::Post => Method::POST,
        HttpMethod::Put => Method::PUT,
        HttpMethod::Patch => Method::PATCH,
        HttpMethod::Delete => Method::DELETE,
    }
}

fn map_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Connect(err.to_string())
    }
}
