//! Multicast asynchronous queue with single-slot backpressure.
//!
//! Producers push items with [`AsyncQueue::enqueue`]; every consumer created
//! by [`AsyncQueue::subscribe`] receives every item pushed while it is
//! attached, exactly once and in order.
//!
//! # Flow control
//!
//! A single pump task moves items from the buffer to the subscribers. Before
//! broadcasting the next item it waits on the shared *advance* gate, which
//! only closes once every attached subscriber has taken the current item.
//! One slow consumer therefore throttles delivery to all of them.
//!
//! All gate and subscriber-cell transitions happen under the queue's state
//! lock, so the "everyone took it" check and the gate close are atomic.
//!
//! # Termination
//!
//! - [`AsyncQueue::stop`] enqueues a stop marker behind the pending items;
//!   consumers end when they reach it and never observe it.
//! - [`AsyncQueue::raise`] fails the queue; every consumer yields the error
//!   once and ends, and the pump halts.
//!
//! ```ignore
//! let queue = AsyncQueue::new();
//! let mut consumer = queue.subscribe();
//! queue.enqueue(1);
//! queue.enqueue(2);
//! queue.stop();
//! while let Some(item) = consumer.next().await {
//!     println!("{}", item?);
//! }
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use tracing::{debug, warn};

use crate::error::{RestError, Result};
use crate::sync::{lock, SignalCell};

/// A buffered entry: a user item or the stop marker.
#[derive(Debug, Clone)]
enum Slot<T> {
    Item(T),
    Stop,
}

struct Subscriber<T> {
    id: u64,
    cell: Arc<SignalCell<Slot<T>>>,
}

struct QueueState<T> {
    buffer: VecDeque<Slot<T>>,
    subscribers: Vec<Subscriber<T>>,
    pumping: bool,
    failure: Option<RestError>,
    last_failure: Option<DateTime<Utc>>,
    next_subscriber: u64,
}

struct Shared<T> {
    state: Mutex<QueueState<T>>,
    /// Closed means the pump may broadcast the next item.
    advance: SignalCell<()>,
}

/// Multicast queue handle. Clones share the same buffer and subscribers.
pub struct AsyncQueue<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Clone + Send + 'static> AsyncQueue<T> {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::with_items(std::iter::empty())
    }

    /// Create a queue whose buffer starts with `items`.
    pub fn with_items(items: impl IntoIterator<Item = T>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState {
                    buffer: items.into_iter().map(Slot::Item).collect(),
                    subscribers: Vec::new(),
                    pumping: false,
                    failure: None,
                    last_failure: None,
                    next_subscriber: 0,
                }),
                advance: SignalCell::closed(()),
            }),
        }
    }

    /// Append `item` to the tail of the queue.
    pub fn enqueue(&self, item: T) {
        lock(&self.shared.state).buffer.push_back(Slot::Item(item));
        self.shared.ensure_pump();
    }

    /// Insert `item` at the head of the queue, ahead of everything pending.
    pub fn enqueue_front(&self, item: T) {
        lock(&self.shared.state).buffer.push_front(Slot::Item(item));
        self.shared.ensure_pump();
    }

    /// End every consumer once the items enqueued so far are delivered.
    pub fn stop(&self) {
        lock(&self.shared.state).buffer.push_back(Slot::Stop);
        self.shared.ensure_pump();
    }

    /// Fail the queue: halts the pump and fails every waiting consumer.
    pub fn raise(&self, error: RestError) {
        let mut state = lock(&self.shared.state);
        debug!(error = %error, subscribers = state.subscribers.len(), "queue raised");
        state.last_failure = Some(Utc::now());
        state.failure = Some(error.clone());
        if self.shared.advance.is_open() {
            self.shared.advance.fail(error.clone());
        }
        for subscriber in &state.subscribers {
            if subscriber.cell.is_open() {
                subscriber.cell.fail(error.clone());
            }
        }
    }

    /// Attach a new consumer.
    ///
    /// The consumer is attached when this method is called, so items enqueued
    /// before the stream is first polled are not missed. Dropping the stream
    /// detaches it.
    pub fn subscribe(&self) -> BoxStream<'static, Result<T>> {
        let consumer = Consumer::attach(self.shared.clone());
        self.shared.ensure_pump();
        stream::unfold(Some(consumer), |consumer| async move {
            let consumer = consumer?;
            match consumer.next_item().await {
                Some(Ok(item)) => Some((Ok(item), Some(consumer))),
                Some(Err(err)) => Some((Err(err), None)),
                None => None,
            }
        })
        .boxed()
    }

    /// The next item the pump will deliver, if any.
    pub fn peek(&self) -> Option<T> {
        match lock(&self.shared.state).buffer.front() {
            Some(Slot::Item(item)) => Some(item.clone()),
            _ => None,
        }
    }

    /// Number of buffered entries, a pending stop marker included.
    pub fn len(&self) -> usize {
        lock(&self.shared.state).buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every buffered entry that has not been delivered yet.
    pub fn clear(&self) {
        lock(&self.shared.state).buffer.clear();
    }

    /// Number of attached consumers.
    pub fn subscriber_count(&self) -> usize {
        lock(&self.shared.state).subscribers.len()
    }

    /// The queue failure, if [`raise`](Self::raise) was called.
    pub fn failure(&self) -> Option<RestError> {
        lock(&self.shared.state).failure.clone()
    }

    /// When the queue last failed.
    pub fn last_failure(&self) -> Option<DateTime<Utc>> {
        lock(&self.shared.state).last_failure
    }

    /// Returns true if the queue failed after `instant`.
    pub fn failed_after(&self, instant: DateTime<Utc>) -> bool {
        self.last_failure().is_some_and(|at| at > instant)
    }
}

impl<T: Clone + Send + 'static> Shared<T> {
    /// Start the pump unless it is already running or has nothing to do.
    fn ensure_pump(self: &Arc<Self>) {
        let mut state = lock(&self.state);
        if state.pumping
            || state.buffer.is_empty()
            || state.subscribers.is_empty()
            || state.failure.is_some()
        {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("no tokio runtime, queue pump deferred");
            return;
        };
        state.pumping = true;
        runtime.spawn(self.clone().pump());
    }

    async fn pump(self: Arc<Self>) {
        loop {
            let gate = {
                let mut state = lock(&self.state);
                if state.buffer.is_empty()
                    || state.subscribers.is_empty()
                    || state.failure.is_some()
                {
                    state.pumping = false;
                    return;
                }
                self.advance.wait()
            };

            if let Err(err) = gate.await {
                debug!(error = %err, "queue pump halted");
                lock(&self.state).pumping = false;
                return;
            }

            let mut state = lock(&self.state);
            if state.subscribers.is_empty() || state.failure.is_some() {
                continue;
            }
            let Some(slot) = state.buffer.pop_front() else {
                continue;
            };
            self.advance.set();
            for subscriber in &state.subscribers {
                subscriber.cell.close(slot.clone());
            }
        }
    }

    /// Close the advance gate if no attached subscriber still holds an item.
    fn release_gate_if_drained(&self, state: &QueueState<T>) {
        if state.failure.is_none()
            && self.advance.is_open()
            && state.subscribers.iter().all(|s| s.cell.is_open())
        {
            self.advance.close(());
        }
    }
}

/// One attached consumer; detaches on drop.
struct Consumer<T: Clone + Send + 'static> {
    shared: Arc<Shared<T>>,
    id: u64,
    cell: Arc<SignalCell<Slot<T>>>,
}

impl<T: Clone + Send + 'static> Consumer<T> {
    fn attach(shared: Arc<Shared<T>>) -> Self {
        let cell = Arc::new(SignalCell::new());
        let id = {
            let mut state = lock(&shared.state);
            let id = state.next_subscriber;
            state.next_subscriber += 1;
            state.subscribers.push(Subscriber {
                id,
                cell: cell.clone(),
            });
            id
        };
        Self { shared, id, cell }
    }

    /// `None` once the stop marker arrives.
    async fn next_item(&self) -> Option<Result<T>> {
        if let Some(err) = lock(&self.shared.state).failure.clone() {
            return Some(Err(err));
        }

        let slot = match self.cell.wait().await {
            Ok(slot) => slot,
            Err(err) => return Some(Err(err)),
        };

        let state = lock(&self.shared.state);
        if let Some(err) = state.failure.clone() {
            return Some(Err(err));
        }
        match slot {
            Slot::Stop => None,
            Slot::Item(item) => {
                self.cell.set();
                self.shared.release_gate_if_drained(&state);
                Some(Ok(item))
            }
        }
    }
}

impl<T: Clone + Send + 'static> Drop for Consumer<T> {
    fn drop(&mut self) {
        let mut state = lock(&self.shared.state);
        state.subscribers.retain(|s| s.id != self.id);
        self.shared.release_gate_if_drained(&state);
    }
}

impl<T> Clone for AsyncQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Default for AsyncQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> FromIterator<T> for AsyncQueue<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self::with_items(iter)
    }
}

impl<T> std::fmt::Debug for AsyncQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.shared.state);
        f.debug_struct("AsyncQueue")
            .field("buffered", &state.buffer.len())
            .field("subscribers", &state.subscribers.len())
            .field("failed", &state.failure.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn drain(mut consumer: BoxStream<'static, Result<i32>>) -> Result<Vec<i32>> {
        let mut items = Vec::new();
        while let Some(item) = consumer.next().await {
            items.push(item?);
        }
        Ok(items)
    }

    #[tokio::test]
    async fn test_two_consumers_see_all_items_in_order() {
        let queue = AsyncQueue::new();
        let a = tokio::spawn(drain(queue.subscribe()));
        let b = tokio::spawn(drain(queue.subscribe()));

        queue.enqueue(1);
        queue.enqueue(2);
        queue.enqueue(3);
        queue.stop();

        assert_eq!(a.await.unwrap().unwrap(), vec![1, 2, 3]);
        assert_eq!(b.await.unwrap().unwrap(), vec![1, 2, 3]);
        assert_eq!(queue.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_items_enqueued_before_first_poll_are_delivered() {
        let queue = AsyncQueue::new();
        let consumer = queue.subscribe();
        queue.enqueue(10);
        queue.enqueue(20);
        queue.stop();

        assert_eq!(drain(consumer).await.unwrap(), vec![10, 20]);
    }

    #[tokio::test]
    async fn test_items_wait_for_a_subscriber() {
        let queue: AsyncQueue<i32> = [1, 2].into_iter().collect();
        queue.stop();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.peek(), Some(1));

        assert_eq!(drain(queue.subscribe()).await.unwrap(), vec![1, 2]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_enqueue_front_jumps_the_line() {
        let queue = AsyncQueue::new();
        queue.enqueue(2);
        queue.enqueue_front(1);
        queue.stop();

        assert_eq!(drain(queue.subscribe()).await.unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_slow_consumer_does_not_lose_items() {
        let queue = AsyncQueue::new();
        let fast = tokio::spawn(drain(queue.subscribe()));
        let mut slow_stream = queue.subscribe();
        let slow = tokio::spawn(async move {
            let mut items = Vec::new();
            while let Some(item) = slow_stream.next().await {
                items.push(item.unwrap());
                tokio::time::sleep(Duration::from_millis(3)).await;
            }
            items
        });

        for i in 0..10 {
            queue.enqueue(i);
        }
        queue.stop();

        let expected: Vec<i32> = (0..10).collect();
        assert_eq!(fast.await.unwrap().unwrap(), expected);
        assert_eq!(slow.await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_raise_fails_waiting_consumers() {
        let queue: AsyncQueue<i32> = AsyncQueue::new();
        let a = tokio::spawn(drain(queue.subscribe()));
        let b = tokio::spawn(drain(queue.subscribe()));
        tokio::time::sleep(Duration::from_millis(5)).await;

        let before = Utc::now() - chrono::Duration::seconds(1);
        queue.raise(RestError::transport("upstream gone"));

        assert!(matches!(a.await.unwrap(), Err(RestError::Transport { .. })));
        assert!(matches!(b.await.unwrap(), Err(RestError::Transport { .. })));
        assert!(queue.failed_after(before));
        assert!(queue.failure().is_some());
    }

    #[tokio::test]
    async fn test_raise_halts_pump() {
        let queue = AsyncQueue::new();
        let consumer = queue.subscribe();
        queue.raise(RestError::service("bad payload"));
        queue.enqueue(1);

        let result = drain(consumer).await;
        assert!(matches!(result, Err(RestError::Service { .. })));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_consumer_yields_error_once_then_ends() {
        let queue: AsyncQueue<i32> = AsyncQueue::new();
        let mut consumer = queue.subscribe();
        queue.raise(RestError::transport("x"));

        assert!(consumer.next().await.unwrap().is_err());
        assert!(consumer.next().await.is_none());
    }

    #[tokio::test]
    async fn test_dropped_consumer_does_not_stall_others() {
        let queue = AsyncQueue::new();
        let dropped = queue.subscribe();
        let kept = tokio::spawn(drain(queue.subscribe()));

        queue.enqueue(1);
        tokio::time::sleep(Duration::from_millis(5)).await;
        drop(dropped);

        queue.enqueue(2);
        queue.stop();
        assert_eq!(kept.await.unwrap().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_peek_stops_at_stop_marker() {
        let queue: AsyncQueue<i32> = AsyncQueue::new();
        queue.stop();
        queue.enqueue(9);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.peek(), None);
    }

    #[tokio::test]
    async fn test_clear_discards_buffer() {
        let queue = AsyncQueue::with_items([1, 2, 3]);
        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(queue.peek(), None);
        assert!(queue.last_failure().is_none());
    }
}
