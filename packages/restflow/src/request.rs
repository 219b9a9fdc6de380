//! A self-contained REST request with its own event emitter.
//!
//! # Lifecycle
//!
//! ```text
//! Created -> Started -> Data* -> (Error | ErrorIgnored) -> Complete
//! ```
//!
//! [`Request::send`] emits `request_start`, performs up to `retry_budget`
//! attempts, emits `request_data` with the parsed body on success and always
//! finishes with exactly one `request_complete`, even when the `send` future
//! is dropped mid-flight.
//!
//! Transport-class failures (`Transport`, `Timeout`) are retried while
//! attempts remain; each retried failure is emitted as
//! `request_error_ignored`. A final failure that matches the request's
//! [`IgnorePolicy`] is also downgraded to `request_error_ignored`; anything
//! else is recorded on the [`RequestHandle`], emitted as `error` and returned.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use futures::StreamExt;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{RestError, Result};
use crate::events::{EventEmitter, RestEvent};
use crate::hooks::{DefaultHooks, RequestHooks};
use crate::sync::{lock, SignalCell, Wait};
use crate::transport::{RequestOptions, Transport};

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(0);

/// Unique, monotonically assigned request identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl RequestId {
    fn next() -> Self {
        Self(NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Wrap a raw id. Ids built this way are not guaranteed unique.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// HTTP method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Method {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

impl std::str::FromStr for Method {
    type Err = RestError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "PATCH" => Ok(Self::Patch),
            "DELETE" => Ok(Self::Delete),
            other => Err(RestError::validation(format!("unsupported method: {other}"))),
        }
    }
}

/// Request body.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    /// Sent as-is.
    Text(String),
    /// Serialized to JSON; sets `content-type: application/json` unless given.
    Json(Value),
}

/// Decides which final failures are downgraded to `request_error_ignored`.
#[derive(Clone, Default)]
pub enum IgnorePolicy {
    /// Never ignore.
    #[default]
    None,
    /// Ignore failures carrying one of these HTTP statuses.
    Codes(HashSet<u16>),
    /// Ignore failures the predicate accepts.
    Predicate(Arc<dyn Fn(&RestError) -> bool + Send + Sync>),
}

impl IgnorePolicy {
    pub fn codes(codes: impl IntoIterator<Item = u16>) -> Self {
        Self::Codes(codes.into_iter().collect())
    }

    pub fn predicate(predicate: impl Fn(&RestError) -> bool + Send + Sync + 'static) -> Self {
        Self::Predicate(Arc::new(predicate))
    }

    /// Returns true if `error` should be ignored.
    pub fn ignores(&self, error: &RestError) -> bool {
        match self {
            Self::None => false,
            Self::Codes(codes) => error.status_code().is_some_and(|s| codes.contains(&s)),
            Self::Predicate(predicate) => predicate(error),
        }
    }
}

impl fmt::Debug for IgnorePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Codes(codes) => f.debug_tuple("Codes").field(codes).finish(),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

#[derive(Default)]
struct HandleState {
    /// Closed once `request_complete` has been emitted.
    complete: SignalCell<()>,
    error: Mutex<Option<RestError>>,
}

/// Cheap view of a request that stays valid after the request moved into
/// the scheduler.
#[derive(Clone)]
pub struct RequestHandle {
    id: RequestId,
    events: EventEmitter<RestEvent>,
    state: Arc<HandleState>,
}

impl RequestHandle {
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// The request's own emitter.
    pub fn events(&self) -> &EventEmitter<RestEvent> {
        &self.events
    }

    /// Returns true once `request_complete` has been emitted and every
    /// listener has run.
    pub fn is_complete(&self) -> bool {
        self.state.complete.is_closed()
    }

    /// Resolves once the request is complete, see [`is_complete`](Self::is_complete).
    pub fn wait_complete(&self) -> Wait<()> {
        self.state.complete.wait()
    }

    /// The genuine failure of the request, if any.
    pub fn error(&self) -> Option<RestError> {
        lock(&self.state.error).clone()
    }
}

impl fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestHandle")
            .field("id", &self.id)
            .field("complete", &self.is_complete())
            .finish()
    }
}

/// A REST request.
pub struct Request {
    id: RequestId,
    target: String,
    method: Method,
    params: BTreeMap<String, Value>,
    headers: BTreeMap<String, String>,
    body: Option<Body>,
    timeout: Option<Duration>,
    ignore_policy: IgnorePolicy,
    retry_budget: u32,
    hooks: Arc<dyn RequestHooks>,
    events: EventEmitter<RestEvent>,
    state: Arc<HandleState>,
}

impl Request {
    pub fn new(method: Method, target: impl Into<String>) -> Self {
        Self {
            id: RequestId::next(),
            target: target.into(),
            method,
            params: BTreeMap::new(),
            headers: BTreeMap::new(),
            body: None,
            timeout: None,
            ignore_policy: IgnorePolicy::None,
            retry_budget: 1,
            hooks: Arc::new(DefaultHooks),
            events: EventEmitter::new(),
            state: Arc::new(HandleState::default()),
        }
    }

    pub fn get(target: impl Into<String>) -> Self {
        Self::new(Method::Get, target)
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(Body::Text(body.into()));
        self
    }

    pub fn with_json(mut self, body: Value) -> Self {
        self.body = Some(Body::Json(body));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_ignore_policy(mut self, policy: IgnorePolicy) -> Self {
        self.ignore_policy = policy;
        self
    }

    /// Shorthand for [`IgnorePolicy::Codes`].
    pub fn ignore_status(self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.with_ignore_policy(IgnorePolicy::codes(codes))
    }

    /// Maximum number of attempts; values below one are raised to one.
    pub fn with_retry_budget(mut self, attempts: u32) -> Self {
        self.retry_budget = attempts.max(1);
        self
    }

    pub fn with_hooks(mut self, hooks: impl RequestHooks) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn params(&self) -> &BTreeMap<String, Value> {
        &self.params
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn body(&self) -> Option<&Body> {
        self.body.as_ref()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn ignore_policy(&self) -> &IgnorePolicy {
        &self.ignore_policy
    }

    pub fn retry_budget(&self) -> u32 {
        self.retry_budget
    }

    pub fn hooks(&self) -> &dyn RequestHooks {
        self.hooks.as_ref()
    }

    /// The request's own emitter.
    pub fn events(&self) -> &EventEmitter<RestEvent> {
        &self.events
    }

    pub fn handle(&self) -> RequestHandle {
        RequestHandle {
            id: self.id,
            events: self.events.clone(),
            state: self.state.clone(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state.complete.is_closed()
    }

    /// Fill in params and headers the request does not set itself.
    pub(crate) fn merge_defaults(
        &mut self,
        params: &BTreeMap<String, Value>,
        headers: &BTreeMap<String, String>,
    ) {
        for (name, value) in params {
            self.params
                .entry(name.clone())
                .or_insert_with(|| value.clone());
        }
        for (name, value) in headers {
            self.headers
                .entry(name.clone())
                .or_insert_with(|| value.clone());
        }
    }

    /// Run the request to completion.
    ///
    /// Returns `Ok(Some(value))` on success, `Ok(None)` when the final failure
    /// was ignored, and `Err` for a genuine failure (which has already been
    /// emitted as `error`).
    pub async fn send(&self, transport: &dyn Transport) -> Result<Option<Value>> {
        let _complete = CompleteGuard { request: self };
        self.report("request_start", self.hooks.emit_start(self));

        let mut attempt = 1;
        let outcome = loop {
            match self.attempt(transport).await {
                Ok(value) => break Ok(value),
                Err(err) if err.is_transport() && attempt < self.retry_budget => {
                    debug!(
                        request_id = %self.id,
                        attempt,
                        error = %err,
                        "{}retrying request",
                        self.hooks.log_header(self)
                    );
                    self.report(
                        "request_error_ignored",
                        self.hooks.emit_error_ignored(self, &err),
                    );
                    attempt += 1;
                }
                Err(err) => break Err(err),
            }
        };

        match outcome {
            Ok(value) => {
                self.report("request_data", self.hooks.emit_data(self, value.clone()));
                Ok(Some(value))
            }
            Err(err) if self.ignore_policy.ignores(&err) => {
                debug!(
                    request_id = %self.id,
                    status = ?err.status_code(),
                    error = %err,
                    "{}ignoring request error",
                    self.hooks.log_header(self)
                );
                self.report(
                    "request_error_ignored",
                    self.hooks.emit_error_ignored(self, &err),
                );
                Ok(None)
            }
            Err(err) => {
                warn!(
                    request_id = %self.id,
                    attempt,
                    status = ?err.status_code(),
                    error = %err,
                    "{}request failed",
                    self.hooks.log_header(self)
                );
                *lock(&self.state.error) = Some(err.clone());
                self.report("error", self.events.emit_error(Some(self.id), err.clone()));
                Err(err)
            }
        }
    }

    async fn attempt(&self, transport: &dyn Transport) -> Result<Value> {
        let options = self.hooks.compose_options(self).await?;
        let timeout = options.timeout;
        tokio::time::timeout(timeout, self.exchange(transport, options))
            .await
            .map_err(|_| RestError::Timeout(timeout))?
    }

    async fn exchange(&self, transport: &dyn Transport, options: RequestOptions) -> Result<Value> {
        let mut response = transport.execute(options).await?;

        let mut buffer = BytesMut::new();
        while let Some(chunk) = response.body.next().await {
            self.hooks.parse_chunk(self, &mut buffer, chunk?)?;
        }

        if !response.is_success() {
            return Err(status_error(response.status, &buffer));
        }

        self.hooks
            .parse_body(self, buffer.freeze())
            .map_err(|err| match err {
                RestError::Service { .. } => err,
                other => RestError::service(other.to_string()),
            })
    }

    fn report(&self, event: &str, result: anyhow::Result<()>) {
        if let Err(e) = result {
            warn!(
                request_id = %self.id,
                event,
                error = %RestError::Listener(e.to_string()),
                "{}event listener failed",
                self.hooks.log_header(self)
            );
        }
    }
}

/// Transport error for a non-2xx status, using the body's `message` field
/// when the service sent one.
fn status_error(status: u16, body: &[u8]) -> RestError {
    let message = serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| format!("HTTP {status}"));
    RestError::status(status, message)
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("target", &self.target)
            .field("retry_budget", &self.retry_budget)
            .field("ignore_policy", &self.ignore_policy)
            .finish_non_exhaustive()
    }
}

/// Emits `request_complete` when `send` returns or is dropped.
struct CompleteGuard<'a> {
    request: &'a Request,
}

impl Drop for CompleteGuard<'_> {
    fn drop(&mut self) {
        let request = self.request;
        request.report("request_complete", request.hooks.emit_complete(request));
        request.state.complete.close(());
    }
}
