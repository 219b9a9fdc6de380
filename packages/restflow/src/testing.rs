//! Testing utilities: a scripted transport and an event recorder.
//!
//! # Feature Flag
//!
//! Outside this crate's own tests the module needs the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! restflow = { path = "../restflow", features = ["testing"] }
//! ```
//!
//! # Scripted replies
//!
//! ```ignore
//! use restflow::testing::{MockReply, MockTransport};
//!
//! let transport = Arc::new(MockTransport::sequence(vec![
//!     MockReply::status(503),
//!     MockReply::json(json!({"items": []})),
//! ]));
//! let scheduler = Scheduler::new(SchedulerConfig::default(), transport.clone())?;
//! scheduler.collect(Request::get("http://svc/items").with_retry_budget(2)).await?;
//! assert_eq!(transport.calls(), 2);
//! ```
//!
//! # Waiting for events
//!
//! Tests should wait for meaning, not time. [`EventRecorder`] records event
//! names in emission order and lets a test wait until enough arrived:
//!
//! ```ignore
//! let recorder = EventRecorder::attach(scheduler.events(), &[names::REQUEST_COMPLETE]);
//! scheduler.submit(requests)?;
//! recorder.wait_for_count(names::REQUEST_COMPLETE, 3).await;
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use tokio::sync::Notify;

use crate::error::{RestError, Result};
use crate::events::{Event, EventEmitter};
use crate::sync::lock;
use crate::transport::{RequestOptions, Transport, TransportResponse};

/// One scripted transport outcome.
#[derive(Debug, Clone)]
pub enum MockReply {
    /// A response with the given status and body chunks.
    Status { status: u16, chunks: Vec<Bytes> },
    /// The transport itself fails.
    Fail(RestError),
    /// Wait, then produce the inner reply.
    Delayed(Duration, Box<MockReply>),
}

impl MockReply {
    /// 200 with `value` serialized as the body.
    pub fn json(value: Value) -> Self {
        Self::Status {
            status: 200,
            chunks: vec![Bytes::from(value.to_string())],
        }
    }

    /// 200 with a plain text body.
    pub fn text(body: impl Into<String>) -> Self {
        Self::Status {
            status: 200,
            chunks: vec![Bytes::from(body.into())],
        }
    }

    /// Empty body with `status`.
    pub fn status(status: u16) -> Self {
        Self::Status {
            status,
            chunks: Vec::new(),
        }
    }

    /// `status` with the body split into `chunks`.
    pub fn chunks<I, B>(status: u16, chunks: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        Self::Status {
            status,
            chunks: chunks.into_iter().map(Into::into).collect(),
        }
    }

    pub fn fail(error: RestError) -> Self {
        Self::Fail(error)
    }

    pub fn delayed(delay: Duration, reply: MockReply) -> Self {
        Self::Delayed(delay, Box::new(reply))
    }
}

type Responder = dyn Fn(&RequestOptions, usize) -> MockReply + Send + Sync;

/// Transport answering from a script instead of the network.
///
/// Records every composed request, the number of calls, and the highest
/// number of calls that were in flight at once.
pub struct MockTransport {
    responder: Box<Responder>,
    latency: Duration,
    calls: AtomicUsize,
    inflight: AtomicUsize,
    peak_inflight: AtomicUsize,
    requests: Mutex<Vec<RequestOptions>>,
}

impl MockTransport {
    /// Answer with `responder(options, call_index)`.
    pub fn new(
        responder: impl Fn(&RequestOptions, usize) -> MockReply + Send + Sync + 'static,
    ) -> Self {
        Self {
            responder: Box::new(responder),
            latency: Duration::ZERO,
            calls: AtomicUsize::new(0),
            inflight: AtomicUsize::new(0),
            peak_inflight: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Answer every call with `reply`.
    pub fn always(reply: MockReply) -> Self {
        Self::new(move |_, _| reply.clone())
    }

    /// Answer call `n` with `replies[n]`; the last reply repeats.
    pub fn sequence(replies: Vec<MockReply>) -> Self {
        Self::new(move |_, call| {
            replies
                .get(call)
                .or_else(|| replies.last())
                .cloned()
                .unwrap_or_else(|| MockReply::status(204))
        })
    }

    /// Delay every call by `latency` before the scripted reply.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Number of `execute` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of concurrent `execute` calls observed.
    pub fn peak_inflight(&self) -> usize {
        self.peak_inflight.load(Ordering::SeqCst)
    }

    /// Every composed request, in call order.
    pub fn requests(&self) -> Vec<RequestOptions> {
        lock(&self.requests).clone()
    }
}

struct InflightGuard<'a>(&'a AtomicUsize);

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn execute(&self, options: RequestOptions) -> Result<TransportResponse> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.inflight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_inflight.fetch_max(now, Ordering::SeqCst);
        let _inflight = InflightGuard(&self.inflight);

        let mut reply = (self.responder)(&options, call);
        lock(&self.requests).push(options);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        loop {
            match reply {
                MockReply::Delayed(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    reply = *inner;
                }
                MockReply::Fail(error) => return Err(error),
                MockReply::Status { status, chunks } => {
                    return Ok(TransportResponse {
                        status,
                        headers: BTreeMap::new(),
                        body: stream::iter(chunks.into_iter().map(Ok)).boxed(),
                    });
                }
            }
        }
    }
}

/// Records event names in emission order.
pub struct EventRecorder {
    seen: Mutex<Vec<String>>,
    notify: Notify,
}

impl EventRecorder {
    /// Listen on `emitter` for every name in `names`.
    pub fn attach<E: Event>(emitter: &EventEmitter<E>, names: &[&str]) -> Arc<Self> {
        let recorder = Arc::new(Self {
            seen: Mutex::new(Vec::new()),
            notify: Notify::new(),
        });
        let sink = recorder.clone();
        emitter.on_each(names, move |event: &E| {
            lock(&sink.seen).push(event.name().to_string());
            sink.notify.notify_waiters();
        });
        recorder
    }

    /// Event names seen so far.
    pub fn names(&self) -> Vec<String> {
        lock(&self.seen).clone()
    }

    /// How many times `name` was seen.
    pub fn count(&self, name: &str) -> usize {
        lock(&self.seen).iter().filter(|n| n.as_str() == name).count()
    }

    /// Wait until `name` was seen at least `expected` times.
    pub async fn wait_for_count(&self, name: &str, expected: usize) {
        loop {
            // Register before checking so a notification in between is kept.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.count(name) >= expected {
                return;
            }
            notified.await;
        }
    }
}
