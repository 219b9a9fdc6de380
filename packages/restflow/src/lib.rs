//! # Restflow
//!
//! An asynchronous REST request engine: bounded concurrency, streamed
//! results, contained failures.
//!
//! ## Core Concepts
//!
//! - [`Request`] = one self-contained call with its own [`EventEmitter`],
//!   retry budget and [`IgnorePolicy`]
//! - [`Scheduler`] = launches requests with at most `max_active_requests` in
//!   flight and fans their events into one emitter
//! - [`Transport`] = the network boundary ([`HttpTransport`] in production)
//!
//! Requests report everything as events. A failing request never takes the
//! scheduler down: ignored failures become `request_error_ignored`, genuine
//! failures become `error`, and callers choose how to react.
//!
//! ## Architecture
//!
//! ```text
//! submit() ──► pending (FIFO)
//!                  │
//!                  ▼ dispatch loop (one instance)
//!           BoundedCounter ── room? ──► Request.send(transport)
//!                                            │
//!                                            ▼ emit()
//!                         request emitter ──pipe──► scheduler emitter
//!                                            │
//!                          stream(): ────────┴──► AsyncQueue ──► consumers
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Capacity** - never more than `max_active_requests` requests in flight
//! 2. **Exactly one completion** - every `send` emits `request_complete` once,
//!    on every path
//! 3. **Launch order is submission order** - settlement order is not
//! 4. **Every consumer sees every item** - [`AsyncQueue`] delivers each item
//!    to every attached consumer, in order, exactly once
//!
//! ## Example
//!
//! ```ignore
//! use restflow::{Request, Scheduler, SchedulerConfig};
//! use futures::StreamExt;
//!
//! let scheduler = Scheduler::http(SchedulerConfig::from_env()?)?;
//!
//! let requests: Vec<Request> = ids
//!     .iter()
//!     .map(|id| {
//!         Request::get(format!("https://api.example.com/items/{id}"))
//!             .ignore_status([404])
//!             .with_retry_budget(3)
//!     })
//!     .collect();
//!
//! let mut results = scheduler.stream(requests)?;
//! while let Some(item) = results.next().await {
//!     println!("{}", item?);
//! }
//! ```

// Core modules
mod config;
mod error;
mod events;
mod hooks;
mod http;
mod logging;
mod queue;
mod request;
mod scheduler;
mod transport;

// Synchronization primitives
pub mod sync;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Stress tests (test-only)
#[cfg(test)]
mod stress_tests;

// Re-export error types
pub use crate::error::{RestError, Result};

// Re-export event types
pub use events::{names, Event, EventEmitter, ListenerFn, ListenerId, RestEvent};

// Re-export request types
pub use request::{Body, IgnorePolicy, Method, Request, RequestHandle, RequestId};

// Re-export extension points
pub use hooks::{compose_options, parse_body, DefaultHooks, RequestHooks, DEFAULT_REQUEST_TIMEOUT};

// Re-export transport types
pub use http::HttpTransport;
pub use transport::{RequestOptions, Transport, TransportResponse};

// Re-export scheduler types (primary entry point)
pub use config::{SchedulerConfig, DEFAULT_MAX_ACTIVE_REQUESTS};
pub use scheduler::{Batch, Collected, Requests, Scheduler};

// Re-export the broadcast queue and sync primitives
pub use queue::AsyncQueue;
pub use sync::{BoundedCounter, Permit, SignalCell, Wait};

// Re-export logging helpers
pub use logging::{bind_logger, bind_request_logger};

// Re-export commonly used external types
pub use async_trait::async_trait;
