//! Resilient data-access layer for the CRM dashboard.
//!
//! # Overview
//! Every remote read and write goes through a `RequestExecutor` that applies
//! a deadline, bounded retry with backoff, and cancellation, and reports
//! failures as a `ClassifiedError`. Reads are served from a shared
//! `QueryCache` that deduplicates concurrent fetches per key and rejects
//! results overtaken by a newer fetch. Writes go through the
//! `MutationCoordinator`, which invalidates an explicit set of keys on
//! success. A 401 anywhere raises one `SessionSignal` expiry per session,
//! which purges the cache before any navigation handler runs.
//!
//! # Design
//! - The HTTP layer is a `Transport` trait so tests drive the executor with
//!   scripted responses; `ReqwestTransport` is the production binding.
//! - Payloads are stored type-erased in the cache and recovered by the
//!   caller's type. A type mismatch surfaces as `InvalidPayload`.
//! - `DataClient` wires the pieces together and is the usual entry point.
//! - DTOs are defined independently from the mock-server crate; integration
//!   tests catch schema drift.

pub mod cache;
pub mod classify;
pub mod client;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod executor;
pub mod http;
pub mod mutation;
pub mod query;
pub mod resources;
pub mod retry;
pub mod session;
pub mod transport;
pub mod types;

#[cfg(test)]
mod testing;

pub use cache::{CacheEntry, CacheEvent, EntryState, QueryCache};
pub use client::DataClient;
pub use config::ClientConfig;
pub use descriptor::{CacheKey, InvalidationSet, RequestDescriptor};
pub use error::{ClassifiedError, ConfigError, DescriptorError, ErrorKind};
pub use executor::RequestExecutor;
pub use http::{HttpMethod, HttpRequest, HttpResponse, Transport, TransportError};
pub use mutation::MutationCoordinator;
pub use query::{QueryCoordinator, QueryHandle, QueryOptions, QueryState};
pub use retry::RetryPolicy;
pub use session::{SessionEvent, SessionPhase, SessionSignal, SessionSubscription, Stage};
pub use transport::ReqwestTransport;
pub use types::{Client, CreateClient, Credentials, UpdateClient};
