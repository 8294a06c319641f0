//! Scripted transport for unit tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::http::{HttpRequest, HttpResponse, Transport, TransportError};

#[derive(Debug, Clone)]
pub enum Step {
    Respond { status: u16, body: String, delay: Duration },
    Fail(TransportError),
    /// Never answers; only a timeout or cancellation ends the call.
    Hang,
}

impl Step {
    pub fn ok(body: &str) -> Self {
        Self::status(200, body)
    }

    pub fn status(status: u16, body: &str) -> Self {
        Step::Respond {
            status,
            body: body.to_string(),
            delay: Duration::ZERO,
        }
    }

    pub fn delayed(status: u16, body: &str, delay: Duration) -> Self {
        Step::Respond {
            status,
            body: body.to_string(),
            delay,
        }
    }
}

/// Plays back `Step`s in order; the last step repeats once the script runs out.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    script: Arc<Mutex<VecDeque<Step>>>,
    log: Arc<Mutex<Vec<(Instant, HttpRequest)>>>,
}

impl ScriptedTransport {
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            script: Arc::new(Mutex::new(steps.into_iter().collect())),
            log: Arc::default(),
        }
    }

    pub fn calls(&self) -> usize {
        self.log.lock().len()
    }

    pub fn call_times(&self) -> Vec<Instant> {
        self.log.lock().iter().map(|(at, _)| *at).collect()
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.log.lock().iter().map(|(_, request)| request.clone()).collect()
    }

    fn next_step(&self) -> Step {
        let mut script = self.script.lock();
        if script.len() > 1 {
            script.pop_front().unwrap_or(Step::Hang)
        } else {
            script.front().cloned().unwrap_or(Step::Hang)
        }
    }
}

impl Transport for ScriptedTransport {
    fn send(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, TransportError>> {
        self.log.lock().push((Instant::now(), request));
        let step = self.next_step();
        async move {
            match step {
                Step::Respond { status, body, delay } => {
                    tokio::time::sleep(delay).await;
                    Ok(HttpResponse {
                        status,
                        headers: Vec::new(),
                        body,
                    })
                }
                Step::Fail(err) => Err(err),
                Step::Hang => futures::future::pending().await,
            }
        }
        .boxed()
    }
}
