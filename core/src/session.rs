//! Session-expiry signal.
//!
//! # Design
//! `SessionSignal` is a cloneable handle over one shared state machine:
//!
//! ```text
//! Active --emit--> Expiring --(all handlers done)--> Active
//! ```
//!
//! Emission while `Expiring` is a no-op, so a handler that itself triggers a
//! 401 cannot re-enter the protocol. Each expiry bumps an epoch. The executor
//! records the epoch when an attempt starts and expires the session *for that
//! epoch*, which collapses a burst of 401s from requests issued under the
//! same session into a single expiry.
//!
//! Handlers run sequentially, `Stage::Purge` before `Stage::Navigate`, so
//! cached authenticated data is gone before any redirect is issued. They run
//! on their own task: the request that saw the 401 is often a cache fetch the
//! purge itself cancels, and the protocol must outlive it.
//!
//! `end()` is the quiet counterpart for a deliberate logout.

use std::future::Future;
use std::sync::{Arc, Weak};

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Active,
    Expiring,
}

/// Handler ordering within one expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    /// Drop authenticated state (caches, persisted UI state).
    Purge,
    /// Redirect to the login surface.
    Navigate,
}

/// Broadcast to external observers once all handlers have run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Expired { epoch: u64 },
}

impl SessionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::Expired { .. } => "session-expired",
        }
    }
}

type Handler = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

struct Registered {
    id: u64,
    stage: Stage,
    handler: Handler,
}

struct State {
    phase: SessionPhase,
    epoch: u64,
    authenticated: bool,
    next_id: u64,
    handlers: Vec<Registered>,
}

struct Inner {
    state: Mutex<State>,
    events: broadcast::Sender<SessionEvent>,
}

#[derive(Clone)]
pub struct SessionSignal {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SessionSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("SessionSignal")
            .field("phase", &state.phase)
            .field("epoch", &state.epoch)
            .field("authenticated", &state.authenticated)
            .field("handlers", &state.handlers.len())
            .finish()
    }
}

impl Default for SessionSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionSignal {
    /// A signal for a session that is assumed authenticated (cookie present).
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    phase: SessionPhase::Active,
                    epoch: 0,
                    authenticated: true,
                    next_id: 0,
                    handlers: Vec::new(),
                }),
                events,
            }),
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.inner.state.lock().phase
    }

    pub fn epoch(&self) -> u64 {
        self.inner.state.lock().epoch
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.state.lock().authenticated
    }

    /// Record a successful (re)login.
    pub fn mark_authenticated(&self) {
        self.inner.state.lock().authenticated = true;
    }

    /// Register a handler run on every expiry. Dropping the returned
    /// subscription unregisters it.
    pub fn subscribe<F, Fut>(&self, stage: Stage, handler: F) -> SessionSubscription
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: Handler = Arc::new(move || handler().boxed());
        let mut state = self.inner.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.handlers.push(Registered { id, stage, handler });
        SessionSubscription {
            id,
            signal: Arc::downgrade(&self.inner),
        }
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Expire the current session unconditionally. Returns `false` when an
    /// expiry is already in progress.
    pub async fn emit(&self) -> bool {
        let epoch = self.epoch();
        self.expire(epoch).await
    }

    /// Expire the session observed at `epoch`. Returns `false` when that
    /// session already expired or an expiry is in progress. Once expired,
    /// further 401s stay silent until `mark_authenticated`.
    ///
    /// Handlers run on a detached task, so dropping the returned future does
    /// not interrupt the protocol.
    pub async fn expire(&self, epoch: u64) -> bool {
        let (epoch, handlers) = {
            let mut state = self.inner.state.lock();
            if state.phase == SessionPhase::Expiring || state.epoch != epoch || !state.authenticated {
                debug!(observed = epoch, current = state.epoch, "session expiry collapsed");
                return false;
            }
            state.phase = SessionPhase::Expiring;
            state.epoch += 1;
            state.authenticated = false;
            let mut handlers: Vec<(Stage, Handler)> = state
                .handlers
                .iter()
                .map(|registered| (registered.stage, registered.handler.clone()))
                .collect();
            handlers.sort_by_key(|(stage, _)| *stage);
            (state.epoch, handlers)
        };

        info!(epoch, handlers = handlers.len(), "session expired");
        let guard = ExpiryGuard {
            inner: self.inner.clone(),
        };
        let task = tokio::spawn(async move {
            for (_, handler) in handlers {
                handler().await;
            }
            let events = guard.inner.events.clone();
            drop(guard);
            let _ = events.send(SessionEvent::Expired { epoch });
        });
        if let Err(err) = task.await {
            warn!(epoch, error = %err, "session expiry handler failed");
        }
        true
    }

    /// End the session deliberately (logout). The epoch moves on and the
    /// session reads as unauthenticated, but no handler runs and no event is
    /// broadcast.
    pub fn end(&self) {
        let mut state = self.inner.state.lock();
        state.epoch += 1;
        state.authenticated = false;
        debug!(epoch = state.epoch, "session ended");
    }
}

/// Returns the signal to `Active` once the expiry task finishes, even if a
/// handler panicked.
struct ExpiryGuard {
    inner: Arc<Inner>,
}

impl Drop for ExpiryGuard {
    fn drop(&mut self) {
        self.inner.state.lock().phase = SessionPhase::Active;
    }
}

/// Disposer returned by `SessionSignal::subscribe`.
#[must_use = "dropping the subscription unregisters the handler"]
pub struct SessionSubscription {
    id: u64,
    signal: Weak<Inner>,
}

impl SessionSubscription {
    pub fn unsubscribe(self) {}
}

impl Drop for SessionSubscription {
    fn drop(&mut self) {
        if let Some(inner) = self.signal.upgrade() {
            inner.state.lock().handlers.retain(|registered| registered.id != self.id);
        }
    }
}
