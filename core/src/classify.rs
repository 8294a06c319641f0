//! Maps raw transport outcomes to `ErrorKind`.
//!
//! Pure functions only. The executor feeds every attempt through `classify`
//! and builds the surfaced error with `to_error`.

use serde::Deserialize;

use crate::error::{ClassifiedError, ErrorKind};
use crate::http::{HttpResponse, TransportError};

/// What one attempt produced before classification.
#[derive(Debug, Clone)]
pub enum Outcome {
    Response(HttpResponse),
    Transport(TransportError),
    /// The executor's own deadline fired.
    TimedOut,
    /// The caller's cancellation token fired.
    Cancelled,
}

pub fn classify(outcome: &Outcome) -> ErrorKind {
    match outcome {
        Outcome::Response(response) => classify_status(response.status),
        Outcome::Transport(TransportError::Connect(_)) => ErrorKind::Network,
        Outcome::Transport(TransportError::Timeout) | Outcome::TimedOut => ErrorKind::Timeout,
        Outcome::Transport(TransportError::Aborted) | Outcome::Cancelled => ErrorKind::Aborted,
    }
}

pub fn classify_status(status: u16) -> ErrorKind {
    match status {
        200..=299 => ErrorKind::Success,
        401 => ErrorKind::Unauthorized,
        408 => ErrorKind::Timeout,
        400..=499 => ErrorKind::ClientError,
        // 5xx, plus informational/redirect codes the transport did not consume.
        _ => ErrorKind::ServerError,
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

/// Server-provided `message` from a JSON body, or a generic fallback.
pub fn extract_message(status: u16, body: &str) -> String {
    serde_json::from_str::<ErrorBody>(body)
        .map(|parsed| parsed.message)
        .unwrap_or_else(|_| format!("request failed ({status})"))
}

/// Build the error surfaced for a non-successful outcome.
pub fn to_error(kind: ErrorKind, outcome: &Outcome) -> ClassifiedError {
    match outcome {
        Outcome::Response(response) => ClassifiedError::new(
            kind,
            Some(response.status),
            extract_message(response.status, &response.body),
        ),
        Outcome::Transport(TransportError::Connect(detail)) => {
            ClassifiedError::new(kind, None, format!("network error: {detail}"))
        }
        Outcome::Transport(TransportError::Timeout) | Outcome::TimedOut => {
            ClassifiedError::new(kind, None, "request timed out")
        }
        Outcome::Transport(TransportError::Aborted) | Outcome::Cancelled => ClassifiedError::aborted(),
    }
}
