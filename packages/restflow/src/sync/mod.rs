//! Asynchronous synchronization primitives.
//!
//! - [`SignalCell`] - a resettable broadcast gate carrying a value or a failure
//! - [`BoundedCounter`] - a broadcast-and-recheck counting gate built on it

mod counter;
mod signal;

pub use counter::{BoundedCounter, Permit};
pub use signal::{SignalCell, Wait};

use std::sync::{Mutex, MutexGuard};

/// Lock a mutex, recovering the guard if a previous holder panicked.
///
/// No user callback ever runs while one of these locks is held, so the data
/// behind a poisoned lock is still consistent.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!("mutex was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}
