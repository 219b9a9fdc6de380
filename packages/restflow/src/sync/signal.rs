//! A resettable one-shot broadcast gate.
//!
//! A [`SignalCell`] is either **Open** (waiters suspend) or **Closed**
//! (holding a value or a failure). Closing or failing an Open cell resolves
//! every pending waiter with the same payload in that one transition; later
//! waits resolve immediately from the stored payload until the cell is
//! reopened with [`SignalCell::set`].
//!
//! ```ignore
//! let gate = SignalCell::new();
//! let wait = gate.wait();      // registered now, resolved later
//! gate.close(42);
//! assert_eq!(wait.await?, 42);
//! assert_eq!(gate.wait().await?, 42); // closed: immediate
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use super::lock;
use crate::error::{RestError, Result};

enum CellState<T> {
    Open(Vec<oneshot::Sender<Result<T>>>),
    Closed(Result<T>),
}

/// A resettable broadcast value/error gate.
pub struct SignalCell<T> {
    state: Mutex<CellState<T>>,
}

impl<T: Clone> SignalCell<T> {
    /// Create an Open cell.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CellState::Open(Vec::new())),
        }
    }

    /// Create a cell that is already Closed with `value`.
    pub fn closed(value: T) -> Self {
        Self {
            state: Mutex::new(CellState::Closed(Ok(value))),
        }
    }

    /// Reopen the cell, discarding the stored value or error.
    ///
    /// Waiters already registered on an Open cell stay registered.
    pub fn set(&self) {
        let mut state = lock(&self.state);
        if matches!(*state, CellState::Closed(_)) {
            *state = CellState::Open(Vec::new());
        }
    }

    /// Close the cell with `value`, resolving every pending waiter with it.
    pub fn close(&self, value: T) {
        self.resolve(Ok(value));
    }

    /// Close the cell with `error`, failing every pending waiter with it.
    pub fn fail(&self, error: RestError) {
        self.resolve(Err(error));
    }

    fn resolve(&self, outcome: Result<T>) {
        let mut state = lock(&self.state);
        let previous = std::mem::replace(&mut *state, CellState::Closed(outcome.clone()));
        if let CellState::Open(waiters) = previous {
            for waiter in waiters {
                // A dropped receiver is a cancelled wait.
                let _ = waiter.send(outcome.clone());
            }
        }
    }

    /// Wait for the cell to be Closed.
    ///
    /// Registration happens when this method is called, not when the returned
    /// future is first polled, so a `close` between the two is not missed.
    pub fn wait(&self) -> Wait<T> {
        let mut state = lock(&self.state);
        match &mut *state {
            CellState::Closed(outcome) => Wait {
                inner: WaitInner::Ready(Some(outcome.clone())),
            },
            CellState::Open(waiters) => {
                waiters.retain(|w| !w.is_closed());
                let (tx, rx) = oneshot::channel();
                waiters.push(tx);
                Wait {
                    inner: WaitInner::Pending(rx),
                }
            }
        }
    }

    /// Returns true while the cell is Open.
    pub fn is_open(&self) -> bool {
        matches!(*lock(&self.state), CellState::Open(_))
    }

    /// Returns true while the cell is Closed (with a value or an error).
    pub fn is_closed(&self) -> bool {
        !self.is_open()
    }

    /// The stored value, if the cell is Closed successfully.
    pub fn value(&self) -> Option<T> {
        match &*lock(&self.state) {
            CellState::Closed(Ok(value)) => Some(value.clone()),
            _ => None,
        }
    }

    /// The stored error, if the cell is Closed with a failure.
    pub fn error(&self) -> Option<RestError> {
        match &*lock(&self.state) {
            CellState::Closed(Err(err)) => Some(err.clone()),
            _ => None,
        }
    }

    /// Number of waiters currently suspended on an Open cell.
    pub fn waiter_count(&self) -> usize {
        match &*lock(&self.state) {
            CellState::Open(waiters) => waiters.iter().filter(|w| !w.is_closed()).count(),
            CellState::Closed(_) => 0,
        }
    }
}

impl<T: Clone> Default for SignalCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for SignalCell<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &*lock(&self.state) {
            CellState::Open(_) => "open",
            CellState::Closed(Ok(_)) => "closed",
            CellState::Closed(Err(_)) => "failed",
        };
        f.debug_struct("SignalCell").field("state", &state).finish()
    }
}

enum WaitInner<T> {
    Ready(Option<Result<T>>),
    Pending(oneshot::Receiver<Result<T>>),
}

/// Future returned by [`SignalCell::wait`].
pub struct Wait<T> {
    inner: WaitInner<T>,
}

// The payload is moved out, never pinned.
impl<T> Unpin for Wait<T> {}

impl<T> Future for Wait<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().inner {
            WaitInner::Ready(outcome) => {
                Poll::Ready(outcome.take().unwrap_or(Err(RestError::Abandoned)))
            }
            WaitInner::Pending(rx) => Pin::new(rx)
                .poll(cx)
                .map(|received| received.unwrap_or(Err(RestError::Abandoned))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_on_closed_returns_immediately() {
        let cell = SignalCell::closed("ready");
        assert_eq!(cell.wait().await.unwrap(), "ready");

        cell.close("again");
        assert_eq!(cell.wait().await.unwrap(), "again");
    }

    #[tokio::test]
    async fn test_wait_on_failed_reraises() {
        let cell: SignalCell<u32> = SignalCell::new();
        cell.fail(RestError::transport("boom"));

        for _ in 0..2 {
            let err = cell.wait().await.unwrap_err();
            assert!(matches!(err, RestError::Transport { .. }));
        }
        assert!(cell.error().is_some());
        assert!(cell.value().is_none());
    }

    #[tokio::test]
    async fn test_wait_on_open_resolves_with_next_close() {
        let cell = Arc::new(SignalCell::new());
        let waiter = {
            let cell = cell.clone();
            tokio::spawn(async move { cell.wait().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        cell.close(7);
        assert_eq!(waiter.await.unwrap().unwrap(), 7);
    }

    #[tokio::test]
    async fn test_registration_happens_at_call_time() {
        let cell = SignalCell::new();
        let wait = cell.wait();
        cell.close(1);
        cell.set();
        // The earlier wait got the close that happened before it was polled.
        assert_eq!(wait.await.unwrap(), 1);
        assert!(cell.is_open());
    }

    #[tokio::test]
    async fn test_broadcast_to_all_waiters() {
        let cell = Arc::new(SignalCell::new());
        let waiters: Vec<_> = (0..5)
            .map(|_| {
                let cell = cell.clone();
                tokio::spawn(async move { cell.wait().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(cell.waiter_count(), 5);
        cell.close("shared".to_string());

        for waiter in waiters {
            assert_eq!(waiter.await.unwrap().unwrap(), "shared");
        }
        assert_eq!(cell.waiter_count(), 0);
    }

    #[tokio::test]
    async fn test_fail_broadcasts_to_all_waiters() {
        let cell: SignalCell<()> = SignalCell::new();
        let a = cell.wait();
        let b = cell.wait();
        cell.fail(RestError::validation("nope"));

        assert!(matches!(a.await, Err(RestError::Validation(_))));
        assert!(matches!(b.await, Err(RestError::Validation(_))));
    }

    #[tokio::test]
    async fn test_set_clears_stored_payload() {
        let cell = SignalCell::closed(3);
        cell.set();
        assert!(cell.is_open());
        assert!(cell.value().is_none());

        let wait = cell.wait();
        cell.close(4);
        assert_eq!(wait.await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_set_on_open_keeps_waiters() {
        let cell = SignalCell::new();
        let wait = cell.wait();
        cell.set();
        cell.close("kept");
        assert_eq!(wait.await.unwrap(), "kept");
    }

    #[tokio::test]
    async fn test_dropped_cell_abandons_waiters() {
        let cell: SignalCell<u8> = SignalCell::new();
        let wait = cell.wait();
        drop(cell);
        assert!(matches!(wait.await, Err(RestError::Abandoned)));
    }
}
