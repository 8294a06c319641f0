//! HTTP transport types and the `Transport` seam.
//!
//! # Design
//! Requests and responses are plain data. The executor builds an
//! `HttpRequest` from a `RequestDescriptor`, hands it to a `Transport`, and
//! classifies whatever comes back. Keeping the wire behind a trait lets the
//! retry, timeout and session logic run against a scripted transport in tests
//! and against `ReqwestTransport` in production.
//!
//! All fields use owned types (`String`, `Vec`) so values can be cloned into
//! every retry attempt without lifetime concerns.

use futures::future::BoxFuture;
use thiserror::Error;

/// HTTP method for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }

    /// Whether the method is safe to repeat without side effects.
    pub fn is_idempotent_read(self) -> bool {
        matches!(self, HttpMethod::Get)
    }
}

/// An HTTP request described as plain data.
///
/// `url` is absolute: the executor joins the configured base origin with the
/// descriptor's endpoint and query string before building one of these.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

/// An HTTP response described as plain data.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

/// Failures below the HTTP layer: no status code was received.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Connection refused, reset, DNS failure, broken body stream.
    #[error("connection failed: {0}")]
    Connect(String),

    /// The transport's own deadline fired before a response arrived.
    #[error("transport timed out")]
    Timeout,

    /// The transport abandoned the call on request.
    #[error("transport aborted")]
    Aborted,
}

/// Executes one HTTP exchange.
///
/// Implementations must be cancel-safe: dropping the returned future abandons
/// the call and releases its connection.
pub trait Transport: Send + Sync {
    fn send(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, TransportError>>;
}
