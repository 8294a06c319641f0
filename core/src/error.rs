//! Error types for the data-access layer.
//!
//! # Design
//! Every failed request ends up as a `ClassifiedError`: an `ErrorKind` that
//! drives retry and presentation policy, the HTTP status when one was
//! received, and a human-readable message (server-provided when the body
//! carried one). It is `Clone` because a single-flight fetch hands the same
//! error to every waiter.
//!
//! Programmer errors (a malformed descriptor, bad configuration) are separate
//! types and are reported at construction time, never by `execute`.

use std::fmt;

use thiserror::Error;

/// Outcome classes produced by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// No response: connection refused, reset, DNS.
    Network,
    /// Client-side deadline fired or the server answered 408.
    Timeout,
    /// The caller cancelled.
    Aborted,
    /// HTTP 401.
    Unauthorized,
    /// Any other 4xx.
    ClientError,
    /// 5xx.
    ServerError,
    /// A 2xx whose body did not match the expected payload shape.
    InvalidPayload,
    Success,
}

impl ErrorKind {
    /// Transient kinds are the only ones a retryable request repeats.
    pub fn is_transient(self) -> bool {
        matches!(self, ErrorKind::Network | ErrorKind::Timeout)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Aborted => "aborted",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::ClientError => "client error",
            ErrorKind::ServerError => "server error",
            ErrorKind::InvalidPayload => "invalid payload",
            ErrorKind::Success => "success",
        };
        f.write_str(name)
    }
}

/// A failed request, classified.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub status: Option<u16>,
    pub message: String,
}

impl ClassifiedError {
    pub fn new(kind: ErrorKind, status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            kind,
            status,
            message: message.into(),
        }
    }

    pub fn aborted() -> Self {
        Self::new(ErrorKind::Aborted, None, "request aborted")
    }

    pub fn invalid_payload(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidPayload, None, message)
    }

    /// UI callers use this to swap an error toast for the login redirect.
    pub fn is_auth_required(&self) -> bool {
        self.kind == ErrorKind::Unauthorized
    }

    pub fn is_aborted(&self) -> bool {
        self.kind == ErrorKind::Aborted
    }

    /// The dismissible message to show the user, if any.
    ///
    /// Cancellation is only interesting to whoever cancelled, and a lost
    /// session is handled by the expiry protocol, so neither produces a notice.
    pub fn user_notice(&self) -> Option<&str> {
        match self.kind {
            ErrorKind::Aborted | ErrorKind::Unauthorized => None,
            _ => Some(&self.message),
        }
    }
}

/// Rejected `RequestDescriptor` construction.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("endpoint must start with '/': {0}")]
    InvalidEndpoint(String),

    #[error("{0} requests cannot carry a body")]
    UnexpectedBody(&'static str),

    #[error("timeout must be greater than zero")]
    ZeroTimeout,

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("invalid request url {0}")]
    InvalidUrl(String),
}

/// Rejected `ClientConfig`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },

    #[error("failed to build HTTP transport: {0}")]
    Transport(String),
}
