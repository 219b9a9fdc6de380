//! Named-event emitter with directed broadcast between emitters.
//!
//! Every request owns an [`EventEmitter`]; the scheduler pipes each request's
//! emitter into its own so that one listener on the scheduler observes the
//! whole fleet.
//!
//! # Semantics
//!
//! - Listeners are registered per event name. A snapshot of the listeners is
//!   taken before they are invoked, so listeners may call `on`/`off`/`emit`
//!   re-entrantly without deadlocking.
//! - After the local listeners ran, the event is forwarded to every downstream
//!   emitter, even when a local listener failed. The first failure is
//!   returned once forwarding is done.
//! - Downstream edges are weak. Piping does not keep the target alive.
//! - Each emission carries a visited set, so a cyclic pipe graph delivers an
//!   event to every reachable emitter exactly once and then stops.
//!
//! # Example
//!
//! ```ignore
//! let request_events = EventEmitter::new();
//! let fleet = EventEmitter::new();
//! request_events.pipe(&fleet);
//!
//! fleet.on(names::REQUEST_DATA, |event: &RestEvent| {
//!     println!("data: {:?}", event);
//! });
//!
//! request_events.emit(&RestEvent::Data { id, value })?;
//! ```

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{RestError, Result};
use crate::request::RequestId;
use crate::sync::lock;

/// Identifies a listener registration; pass it to `off` to remove it.
pub type ListenerId = u64;

/// Closure type for event listeners.
pub type ListenerFn<E> = dyn Fn(&E) -> anyhow::Result<()> + Send + Sync;

/// Event names used by requests and the scheduler.
pub mod names {
    pub const REQUEST_START: &str = "request_start";
    pub const REQUEST_DATA: &str = "request_data";
    pub const REQUEST_COMPLETE: &str = "request_complete";
    pub const REQUEST_ERROR_IGNORED: &str = "request_error_ignored";
    pub const ERROR: &str = "error";
    pub const WARNING: &str = "warning";
    pub const START_SENDING_REQUESTS: &str = "start_sending_requests";
    pub const STOP_SENDING_REQUESTS: &str = "stop_sending_requests";
    pub const COMPLETE_ALL_ACTIVE_REQUESTS: &str = "complete_all_active_requests";
}

/// Something that can be emitted through an [`EventEmitter`].
pub trait Event: Clone + Send + Sync + 'static {
    /// The name listeners register for.
    fn name(&self) -> &str;
}

/// Events emitted by requests and the scheduler.
#[derive(Debug, Clone)]
pub enum RestEvent {
    /// The request is about to contact the transport.
    Start { id: RequestId },
    /// The request produced a parsed value.
    Data { id: RequestId, value: Value },
    /// The request finished; emitted exactly once per `send`.
    Complete { id: RequestId },
    /// A failure was retried or matched the ignore policy.
    ErrorIgnored { id: RequestId, error: RestError },
    /// A genuine failure.
    Error {
        id: Option<RequestId>,
        error: RestError,
    },
    /// A non-fatal condition worth surfacing.
    Warning {
        id: Option<RequestId>,
        message: String,
    },
    /// The scheduler dispatch loop started.
    DispatchStarted,
    /// The scheduler dispatch loop ran out of work and stopped.
    DispatchStopped,
    /// The last active request settled.
    ActiveDrained,
}

impl RestEvent {
    /// The request this event belongs to, if any.
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            Self::Start { id }
            | Self::Data { id, .. }
            | Self::Complete { id }
            | Self::ErrorIgnored { id, .. } => Some(*id),
            Self::Error { id, .. } | Self::Warning { id, .. } => *id,
            Self::DispatchStarted | Self::DispatchStopped | Self::ActiveDrained => None,
        }
    }
}

impl Event for RestEvent {
    fn name(&self) -> &str {
        match self {
            Self::Start { .. } => names::REQUEST_START,
            Self::Data { .. } => names::REQUEST_DATA,
            Self::Complete { .. } => names::REQUEST_COMPLETE,
            Self::ErrorIgnored { .. } => names::REQUEST_ERROR_IGNORED,
            Self::Error { .. } => names::ERROR,
            Self::Warning { .. } => names::WARNING,
            Self::DispatchStarted => names::START_SENDING_REQUESTS,
            Self::DispatchStopped => names::STOP_SENDING_REQUESTS,
            Self::ActiveDrained => names::COMPLETE_ALL_ACTIVE_REQUESTS,
        }
    }
}

type Listeners<E> = HashMap<String, Vec<(ListenerId, Arc<ListenerFn<E>>)>>;

struct Inner<E> {
    listeners: Mutex<Listeners<E>>,
    downstream: Mutex<Vec<Weak<Inner<E>>>>,
    next_id: AtomicU64,
}

/// Named-event emitter handle. Clones share the same listeners and edges.
pub struct EventEmitter<E: Event> {
    inner: Arc<Inner<E>>,
}

impl<E: Event> EventEmitter<E> {
    /// Create an emitter with no listeners and no downstream edges.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                listeners: Mutex::new(HashMap::new()),
                downstream: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register `listener` for `name`.
    pub fn on(&self, name: &str, listener: impl Fn(&E) + Send + Sync + 'static) -> ListenerId {
        self.on_each(&[name], listener)
    }

    /// Register a fallible `listener` for `name`.
    ///
    /// A failure does not stop other listeners or forwarding; it is returned
    /// from `emit` afterwards.
    pub fn try_on(
        &self,
        name: &str,
        listener: impl Fn(&E) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> ListenerId {
        self.register(&[name], false, Arc::new(listener))
    }

    /// Register `listener` once for each distinct name in `names`.
    pub fn on_each(
        &self,
        names: &[&str],
        listener: impl Fn(&E) + Send + Sync + 'static,
    ) -> ListenerId {
        self.register(names, false, wrap(listener))
    }

    /// Register `listener` once per entry of `names`, repeats included.
    pub fn on_each_with_duplicates(
        &self,
        names: &[&str],
        listener: impl Fn(&E) + Send + Sync + 'static,
    ) -> ListenerId {
        self.register(names, true, wrap(listener))
    }

    fn register(
        &self,
        names: &[&str],
        allow_duplicates: bool,
        listener: Arc<ListenerFn<E>>,
    ) -> ListenerId {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut seen = HashSet::new();
        let mut listeners = lock(&self.inner.listeners);
        for name in names {
            if !allow_duplicates && !seen.insert(*name) {
                continue;
            }
            listeners
                .entry((*name).to_string())
                .or_default()
                .push((id, listener.clone()));
        }
        id
    }

    /// Remove registration `id` from `name`.
    pub fn off(&self, name: &str, id: ListenerId) {
        let mut listeners = lock(&self.inner.listeners);
        if let Some(entries) = listeners.get_mut(name) {
            entries.retain(|(lid, _)| *lid != id);
            if entries.is_empty() {
                listeners.remove(name);
            }
        }
    }

    /// Remove registration `id` from every name.
    pub fn off_all(&self, id: ListenerId) {
        let mut listeners = lock(&self.inner.listeners);
        listeners.retain(|_, entries| {
            entries.retain(|(lid, _)| *lid != id);
            !entries.is_empty()
        });
    }

    /// Number of listeners registered for `name`.
    pub fn listener_count(&self, name: &str) -> usize {
        lock(&self.inner.listeners).get(name).map_or(0, Vec::len)
    }

    /// Forward every event emitted here to `other` as well.
    pub fn pipe(&self, other: &EventEmitter<E>) {
        let mut downstream = lock(&self.inner.downstream);
        downstream.retain(|w| w.strong_count() > 0);
        let target = Arc::downgrade(&other.inner);
        if !downstream.iter().any(|w| w.ptr_eq(&target)) {
            downstream.push(target);
        }
    }

    /// Stop forwarding to `other`.
    pub fn unpipe(&self, other: &EventEmitter<E>) {
        let target = Arc::downgrade(&other.inner);
        lock(&self.inner.downstream).retain(|w| w.strong_count() > 0 && !w.ptr_eq(&target));
    }

    /// Returns true if events are forwarded to `other`.
    pub fn is_piped_to(&self, other: &EventEmitter<E>) -> bool {
        let target = Arc::downgrade(&other.inner);
        lock(&self.inner.downstream).iter().any(|w| w.ptr_eq(&target))
    }

    /// Emit `event` to local listeners, then to every downstream emitter.
    pub fn emit(&self, event: &E) -> anyhow::Result<()> {
        let mut visited = HashSet::new();
        emit_visited(&self.inner, event, &mut visited)
    }

    /// Wait for the first emission of `name` that satisfies `predicate`.
    ///
    /// The listener is registered before this method returns and removed as
    /// soon as it fires, or when the returned future is dropped.
    pub fn wait_for_event<P>(
        &self,
        name: &str,
        predicate: P,
    ) -> impl Future<Output = Result<E>> + Send + 'static
    where
        P: Fn(&E) -> bool + Send + Sync + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let weak = Arc::downgrade(&self.inner);
        let owned_name = name.to_string();
        let slot: Arc<Mutex<Option<ListenerId>>> = Arc::new(Mutex::new(None));

        let listener_slot = slot.clone();
        let listener_name = owned_name.clone();
        let id = self.on(name, move |event| {
            if !predicate(event) {
                return;
            }
            if let Some(tx) = lock(&tx).take() {
                let _ = tx.send(event.clone());
            }
            if let (Some(inner), Some(id)) = (weak.upgrade(), *lock(&listener_slot)) {
                EventEmitter { inner }.off(&listener_name, id);
            }
        });
        *lock(&slot) = Some(id);

        let guard = ListenerGuard {
            emitter: Arc::downgrade(&self.inner),
            name: owned_name,
            id,
        };
        async move {
            let _guard = guard;
            rx.await.map_err(|_| RestError::Abandoned)
        }
    }

    /// Wait for the next emission of `name`.
    pub fn wait_for(&self, name: &str) -> impl Future<Output = Result<E>> + Send + 'static {
        self.wait_for_event(name, |_| true)
    }
}

impl EventEmitter<RestEvent> {
    /// Emit an `error` event.
    pub fn emit_error(&self, id: Option<RequestId>, error: RestError) -> anyhow::Result<()> {
        self.emit(&RestEvent::Error { id, error })
    }

    /// Emit a `warning` event.
    pub fn emit_warning(
        &self,
        id: Option<RequestId>,
        message: impl Into<String>,
    ) -> anyhow::Result<()> {
        self.emit(&RestEvent::Warning {
            id,
            message: message.into(),
        })
    }
}

fn wrap<E: Event>(listener: impl Fn(&E) + Send + Sync + 'static) -> Arc<ListenerFn<E>> {
    Arc::new(move |event: &E| {
        listener(event);
        Ok(())
    })
}

fn emit_visited<E: Event>(
    inner: &Arc<Inner<E>>,
    event: &E,
    visited: &mut HashSet<usize>,
) -> anyhow::Result<()> {
    if !visited.insert(Arc::as_ptr(inner) as usize) {
        return Ok(());
    }

    let snapshot: Vec<Arc<ListenerFn<E>>> = lock(&inner.listeners)
        .get(event.name())
        .map(|entries| entries.iter().map(|(_, l)| l.clone()).collect())
        .unwrap_or_default();

    let mut first_error = None;
    for listener in snapshot {
        if let Err(err) = listener(event) {
            first_error.get_or_insert(err);
        }
    }

    let downstream: Vec<Arc<Inner<E>>> = lock(&inner.downstream)
        .iter()
        .filter_map(Weak::upgrade)
        .collect();
    for target in downstream {
        if let Err(err) = emit_visited(&target, event, visited) {
            first_error.get_or_insert(err);
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

struct ListenerGuard<E: Event> {
    emitter: Weak<Inner<E>>,
    name: String,
    id: ListenerId,
}

impl<E: Event> Drop for ListenerGuard<E> {
    fn drop(&mut self) {
        if let Some(inner) = self.emitter.upgrade() {
            EventEmitter { inner }.off(&self.name, self.id);
        }
    }
}

impl<E: Event> Clone for EventEmitter<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E: Event> Default for EventEmitter<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Event> std::fmt::Debug for EventEmitter<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let listeners: usize = lock(&self.inner.listeners).values().map(Vec::len).sum();
        let downstream = lock(&self.inner.downstream)
            .iter()
            .filter(|w| w.strong_count() > 0)
            .count();
        f.debug_struct("EventEmitter")
            .field("listeners", &listeners)
            .field("downstream", &downstream)
            .finish()
    }
}
