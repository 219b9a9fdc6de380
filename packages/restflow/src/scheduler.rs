//! Bounded-concurrency request scheduler.
//!
//! Requests are submitted into a FIFO `pending` list and launched by a single
//! dispatch loop while there is room in the active set. Every request's
//! emitter is piped into the scheduler's emitter, so one listener on
//! [`Scheduler::events`] observes the whole fleet.
//!
//! ```ignore
//! let scheduler = Scheduler::http(SchedulerConfig::default().with_max_active_requests(8))?;
//!
//! let mut results = scheduler.stream(vec![
//!     Request::get("https://api.example.com/a"),
//!     Request::get("https://api.example.com/b"),
//! ])?;
//! while let Some(value) = results.next().await {
//!     println!("{}", value?);
//! }
//! ```

use std::collections::{HashSet, VecDeque};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::config::SchedulerConfig;
use crate::error::{RestError, Result};
use crate::events::{names, EventEmitter, RestEvent};
use crate::http::HttpTransport;
use crate::queue::AsyncQueue;
use crate::request::{Request, RequestHandle, RequestId};
use crate::sync::{lock, BoundedCounter, SignalCell};
use crate::transport::Transport;

// =============================================================================
// Inputs and outputs
// =============================================================================

/// One request or a batch of them.
#[derive(Debug)]
pub enum Requests {
    One(Request),
    Many(Vec<Request>),
}

impl Requests {
    pub fn into_vec(self) -> Vec<Request> {
        match self {
            Self::One(request) => vec![request],
            Self::Many(requests) => requests,
        }
    }
}

impl From<Request> for Requests {
    fn from(request: Request) -> Self {
        Self::One(request)
    }
}

impl From<Vec<Request>> for Requests {
    fn from(requests: Vec<Request>) -> Self {
        Self::Many(requests)
    }
}

impl FromIterator<Request> for Requests {
    fn from_iter<I: IntoIterator<Item = Request>>(iter: I) -> Self {
        Self::Many(iter.into_iter().collect())
    }
}

/// Result shape of [`Scheduler::drain`].
#[derive(Debug, Clone, PartialEq)]
pub enum Collected {
    /// A single request produced a single value.
    One(Value),
    Many(Vec<Value>),
}

impl Collected {
    pub fn into_vec(self) -> Vec<Value> {
        match self {
            Self::One(value) => vec![value],
            Self::Many(values) => values,
        }
    }

    /// The value of a single-request drain.
    pub fn into_single(self) -> Option<Value> {
        match self {
            Self::One(value) => Some(value),
            Self::Many(_) => None,
        }
    }
}

/// Handles and a dedicated emitter for one `submit` call.
///
/// The emitter only sees events of this batch's requests.
#[derive(Debug)]
pub struct Batch {
    handles: Vec<RequestHandle>,
    events: EventEmitter<RestEvent>,
}

impl Batch {
    pub fn handles(&self) -> &[RequestHandle] {
        &self.handles
    }

    pub fn into_handles(self) -> Vec<RequestHandle> {
        self.handles
    }

    pub fn ids(&self) -> Vec<RequestId> {
        self.handles.iter().map(RequestHandle::id).collect()
    }

    pub fn events(&self) -> &EventEmitter<RestEvent> {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

// =============================================================================
// Scheduler
// =============================================================================

#[derive(Default)]
struct DispatchState {
    pending: VecDeque<Request>,
    running: bool,
}

struct Inner {
    config: SchedulerConfig,
    transport: Arc<dyn Transport>,
    events: EventEmitter<RestEvent>,
    active: BoundedCounter<RequestId>,
    state: Mutex<DispatchState>,
    wake: Notify,
}

/// Launches requests with at most `max_active_requests` in flight.
///
/// Clones share the same queue, active set and emitter.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Create a scheduler over `transport`.
    ///
    /// Fails when `max_active_requests` is zero.
    pub fn new(config: SchedulerConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        let capacity = NonZeroUsize::new(config.max_active_requests)
            .ok_or_else(|| RestError::validation("max_active_requests must be positive"))?;
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                transport,
                events: EventEmitter::new(),
                active: BoundedCounter::new(capacity),
                state: Mutex::new(DispatchState::default()),
                wake: Notify::new(),
            }),
        })
    }

    /// Create a scheduler sending over HTTP(S).
    pub fn http(config: SchedulerConfig) -> Result<Self> {
        Self::new(config, Arc::new(HttpTransport::new()))
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Emitter receiving every event of every submitted request, plus the
    /// scheduler's own lifecycle events.
    pub fn events(&self) -> &EventEmitter<RestEvent> {
        &self.inner.events
    }

    /// Number of requests currently in flight.
    pub fn active_count(&self) -> usize {
        self.inner.active.len()
    }

    /// Number of submitted requests not launched yet.
    pub fn pending_count(&self) -> usize {
        lock(&self.inner.state).pending.len()
    }

    /// Returns true while a dispatch loop is running.
    pub fn is_running(&self) -> bool {
        lock(&self.inner.state).running
    }

    /// Queue `requests` for launch and return their handles.
    ///
    /// Nothing is queued if any request fails validation.
    pub fn submit(&self, requests: impl Into<Requests>) -> Result<Batch> {
        let requests = requests.into().into_vec();
        if let Some(bad) = requests.iter().find(|r| r.target().trim().is_empty()) {
            return Err(RestError::validation(format!(
                "request {} has an empty target",
                bad.id()
            )));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| RestError::validation("submitting requests requires a tokio runtime"))?;

        let config = &self.inner.config;
        let batch_events = EventEmitter::new();
        let mut handles = Vec::with_capacity(requests.len());

        let mut state = lock(&self.inner.state);
        for mut request in requests {
            request.merge_defaults(&config.params, &config.headers);
            request.events().pipe(&self.inner.events);
            request.events().pipe(&batch_events);
            handles.push(request.handle());
            state.pending.push_back(request);
        }

        if state.running {
            drop(state);
            self.inner.wake.notify_one();
        } else {
            state.running = true;
            drop(state);
            runtime.spawn(self.inner.clone().dispatch());
        }

        Ok(Batch {
            handles,
            events: batch_events,
        })
    }

    /// Submit `requests` and stream their values in completion order.
    ///
    /// The stream ends once every request completed, or yields the first
    /// genuine request failure and ends.
    pub fn stream(
        &self,
        requests: impl Into<Requests>,
    ) -> Result<BoxStream<'static, Result<Value>>> {
        let requests = requests.into().into_vec();
        let queue = AsyncQueue::new();
        let results = queue.subscribe();

        if requests.is_empty() {
            queue.stop();
            return Ok(results);
        }

        let remaining: Arc<Mutex<HashSet<RequestId>>> =
            Arc::new(Mutex::new(requests.iter().map(Request::id).collect()));

        for request in &requests {
            let events = request.events();

            let failures = queue.clone();
            events.on(names::ERROR, move |event| {
                if let RestEvent::Error { error, .. } = event {
                    failures.raise(error.clone());
                }
            });

            let values = queue.clone();
            events.on(names::REQUEST_DATA, move |event| {
                if let RestEvent::Data { value, .. } = event {
                    values.enqueue(value.clone());
                }
            });

            let completions = queue.clone();
            let remaining = remaining.clone();
            events.on(names::REQUEST_COMPLETE, move |event| {
                let Some(id) = event.request_id() else {
                    return;
                };
                let mut remaining = lock(&remaining);
                if remaining.remove(&id) && remaining.is_empty() {
                    completions.stop();
                }
            });
        }

        self.submit(requests)?;
        Ok(results)
    }

    /// Submit `requests` and collect every value.
    ///
    /// A single request producing a single value yields [`Collected::One`].
    pub async fn drain(&self, requests: impl Into<Requests>) -> Result<Collected> {
        let requests = requests.into();
        let single = matches!(requests, Requests::One(_));
        let mut values = self.collect(requests).await?;
        if single && values.len() == 1 {
            return Ok(Collected::One(values.remove(0)));
        }
        Ok(Collected::Many(values))
    }

    /// Submit `requests` and collect every value into a list.
    pub async fn collect(&self, requests: impl Into<Requests>) -> Result<Vec<Value>> {
        let mut results = self.stream(requests)?;
        let mut values = Vec::new();
        while let Some(value) = results.next().await {
            values.push(value?);
        }
        Ok(values)
    }

    /// Wait until every request behind `handles` completed.
    ///
    /// With `fail_fast`, the first genuine failure among them is returned
    /// immediately instead.
    pub async fn await_all(&self, handles: &[RequestHandle], fail_fast: bool) -> Result<()> {
        // Registered before anything else so no completion is missed.
        let settled = join_all(handles.iter().map(RequestHandle::wait_complete));
        if !fail_fast {
            return settled.await.into_iter().collect();
        }

        let failure: Arc<SignalCell<()>> = Arc::new(SignalCell::new());
        let watcher = EventEmitter::new();
        let _pipes = PipeGuard {
            watcher: &watcher,
            handles,
        };
        for handle in handles {
            handle.events().pipe(&watcher);
        }

        let on_error = failure.clone();
        watcher.on(names::ERROR, move |event| {
            if let RestEvent::Error { error, .. } = event {
                if on_error.is_open() {
                    on_error.fail(error.clone());
                }
            }
        });

        // The error is recorded before it is emitted, so a failure that
        // happened before the pipes existed shows up here.
        if let Some(err) = handles.iter().find_map(RequestHandle::error) {
            return Err(err);
        }

        // `error` always precedes `request_complete`, so the failure wins a tie.
        tokio::select! {
            biased;
            outcome = failure.wait() => outcome,
            outcomes = settled => outcomes.into_iter().collect(),
        }
    }

    /// Submit `requests` and wait for all of them; see [`await_all`](Self::await_all).
    pub async fn run(&self, requests: impl Into<Requests>, fail_fast: bool) -> Result<Batch> {
        let batch = self.submit(requests)?;
        self.await_all(batch.handles(), fail_fast).await?;
        Ok(batch)
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("max_active_requests", &self.inner.config.max_active_requests)
            .field("active", &self.active_count())
            .field("pending", &self.pending_count())
            .field("running", &self.is_running())
            .finish()
    }
}

// =============================================================================
// Dispatch loop
// =============================================================================

impl Inner {
    async fn dispatch(self: Arc<Self>) {
        debug!(
            max_active = self.active.capacity(),
            "dispatch loop started"
        );
        self.report(
            names::START_SENDING_REQUESTS,
            self.events.emit(&RestEvent::DispatchStarted),
        );

        let mut inflight = JoinSet::new();
        loop {
            while let Some(request) = self.next_launchable() {
                self.launch(&mut inflight, request);
                if let Some(delay) = self.config.launch_delay() {
                    tokio::time::sleep(delay).await;
                }
            }

            {
                let mut state = lock(&self.state);
                if state.pending.is_empty() && inflight.is_empty() {
                    state.running = false;
                    break;
                }
            }

            tokio::select! {
                Some(joined) = inflight.join_next(), if !inflight.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!(error = %e, "request task panicked");
                        }
                    }
                }
                _ = self.wake.notified() => {}
            }
        }

        debug!("dispatch loop stopped");
        self.report(
            names::STOP_SENDING_REQUESTS,
            self.events.emit(&RestEvent::DispatchStopped),
        );
    }

    /// Pop the head of `pending` if it can take an active slot.
    fn next_launchable(&self) -> Option<Request> {
        let mut state = lock(&self.state);
        let head = state.pending.front()?;
        if self.active.try_acquire(head.id()) {
            state.pending.pop_front()
        } else {
            None
        }
    }

    fn launch(self: &Arc<Self>, inflight: &mut JoinSet<()>, request: Request) {
        let inner = self.clone();
        inflight.spawn(async move {
            let _slot = ActiveSlot {
                inner: &inner,
                id: request.id(),
            };
            if let Err(err) = request.send(inner.transport.as_ref()).await {
                debug!(request_id = %request.id(), error = %err, "request settled with error");
            }
            request.events().unpipe(&inner.events);
        });
    }

    fn report(&self, event: &str, result: anyhow::Result<()>) {
        if let Err(e) = result {
            warn!(event, error = %e, "scheduler event listener failed");
        }
    }
}

/// Releases an active slot when a request task ends, however it ends.
struct ActiveSlot<'a> {
    inner: &'a Inner,
    id: RequestId,
}

impl Drop for ActiveSlot<'_> {
    fn drop(&mut self) {
        self.inner.active.release(&self.id);
        if self.inner.active.is_empty() {
            self.inner.report(
                names::COMPLETE_ALL_ACTIVE_REQUESTS,
                self.inner.events.emit(&RestEvent::ActiveDrained),
            );
        }
    }
}

// =============================================================================
// Completion tracking
// =============================================================================

/// Removes the temporary pipes of `await_all` on every exit path.
struct PipeGuard<'a> {
    watcher: &'a EventEmitter<RestEvent>,
    handles: &'a [RequestHandle],
}

impl Drop for PipeGuard<'_> {
    fn drop(&mut self) {
        for handle in self.handles {
            handle.events().unpipe(self.watcher);
        }
    }
}
