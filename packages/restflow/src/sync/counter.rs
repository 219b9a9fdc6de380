//! A bounded-concurrency counter built from a [`SignalCell`] gate.
//!
//! `acquire` adds a token to the inflight set once there is room; `release`
//! removes it and, when room appears, closes the gate. Closing the gate wakes
//! *every* waiter and they race to re-check capacity. There is no FIFO
//! fairness and no anti-starvation guarantee: under sustained contention a
//! waiter can lose the race repeatedly.

use std::collections::HashSet;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Mutex;

use super::{lock, SignalCell};

/// Counting gate over a set of unique tokens.
pub struct BoundedCounter<K> {
    capacity: NonZeroUsize,
    inflight: Mutex<HashSet<K>>,
    /// Closed means "room available".
    gate: SignalCell<()>,
}

impl<K: Eq + Hash> BoundedCounter<K> {
    /// Create a counter admitting at most `capacity` tokens at once.
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            capacity,
            inflight: Mutex::new(HashSet::new()),
            gate: SignalCell::closed(()),
        }
    }

    /// Wait until there is room, then add `token` to the inflight set.
    ///
    /// Acquiring a token that is already inflight does not take a second slot.
    pub async fn acquire(&self, token: K) {
        loop {
            // Gate transitions happen under the inflight lock so a release
            // cannot land between the capacity check and the registration.
            let wait = {
                let mut inflight = lock(&self.inflight);
                if inflight.contains(&token) {
                    return;
                }
                if inflight.len() < self.capacity.get() {
                    inflight.insert(token);
                    return;
                }
                if self.gate.is_closed() {
                    self.gate.set();
                }
                self.gate.wait()
            };
            // The gate is never failed; a wake-up only means "check again".
            let _ = wait.await;
        }
    }

    /// Add `token` if there is room right now. A token that is already
    /// inflight succeeds without taking a slot.
    pub fn try_acquire(&self, token: K) -> bool {
        let mut inflight = lock(&self.inflight);
        if inflight.contains(&token) {
            return true;
        }
        if inflight.len() < self.capacity.get() {
            inflight.insert(token);
            true
        } else {
            false
        }
    }

    /// Acquire a slot that is released when the returned permit is dropped.
    pub async fn acquire_permit(&self, token: K) -> Permit<'_, K>
    where
        K: Clone,
    {
        self.acquire(token.clone()).await;
        Permit {
            counter: self,
            token: Some(token),
        }
    }

    /// Remove `token`; wakes all waiters when room becomes available.
    ///
    /// Returns false if the token was not inflight.
    pub fn release(&self, token: &K) -> bool {
        let mut inflight = lock(&self.inflight);
        let removed = inflight.remove(token);
        if inflight.len() < self.capacity.get() {
            self.gate.close(());
        }
        removed
    }

    /// Returns true if `token` currently holds a slot.
    pub fn contains(&self, token: &K) -> bool {
        lock(&self.inflight).contains(token)
    }

    /// Number of tokens currently inflight.
    pub fn len(&self) -> usize {
        lock(&self.inflight).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity.get()
    }

    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }
}

impl<K> std::fmt::Debug for BoundedCounter<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedCounter")
            .field("capacity", &self.capacity)
            .field("inflight", &lock(&self.inflight).len())
            .finish()
    }
}

/// RAII slot in a [`BoundedCounter`].
pub struct Permit<'a, K: Eq + Hash> {
    counter: &'a BoundedCounter<K>,
    token: Option<K>,
}

impl<K: Eq + Hash> Drop for Permit<'_, K> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            self.counter.release(&token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn cap(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    #[tokio::test]
    async fn test_acquire_under_capacity_is_immediate() {
        let counter = BoundedCounter::new(cap(2));
        counter.acquire(1).await;
        counter.acquire(2).await;
        assert_eq!(counter.len(), 2);
        assert!(counter.is_full());
        assert!(!counter.try_acquire(3));
    }

    #[tokio::test]
    async fn test_release_unblocks_waiter() {
        let counter = Arc::new(BoundedCounter::new(cap(1)));
        counter.acquire("a").await;

        let waiter = {
            let counter = counter.clone();
            tokio::spawn(async move { counter.acquire("b").await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        assert!(!counter.contains(&"b"));

        assert!(counter.release(&"a"));
        waiter.await.unwrap();
        assert!(counter.contains(&"b"));
        assert_eq!(counter.len(), 1);
    }

    #[tokio::test]
    async fn test_release_unknown_token() {
        let counter: BoundedCounter<u32> = BoundedCounter::new(cap(1));
        assert!(!counter.release(&9));
        assert!(counter.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_token_takes_one_slot() {
        let counter = BoundedCounter::new(cap(2));
        counter.acquire(5).await;
        counter.acquire(5).await;
        assert_eq!(counter.len(), 1);

        counter.acquire(6).await;
        assert!(counter.is_full());
        tokio::time::timeout(Duration::from_millis(100), counter.acquire(5))
            .await
            .expect("re-acquiring an inflight token must not wait");
        assert!(counter.try_acquire(6));
        assert!(!counter.try_acquire(7));
        assert_eq!(counter.len(), 2);
    }

    #[tokio::test]
    async fn test_permit_releases_on_drop() {
        let counter = BoundedCounter::new(cap(1));
        {
            let _permit = counter.acquire_permit(1).await;
            assert!(counter.is_full());
        }
        assert!(counter.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_never_exceeds_capacity() {
        let counter = Arc::new(BoundedCounter::new(cap(3)));
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..40)
            .map(|i| {
                let counter = counter.clone();
                let current = current.clone();
                let peak = peak.clone();
                tokio::spawn(async move {
                    counter.acquire(i).await;
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    assert!(counter.len() <= 3);
                    tokio::time::sleep(Duration::from_millis(fastrand::u64(1..5))).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    counter.release(&i);
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 1);
        assert!(counter.is_empty());
    }
}
