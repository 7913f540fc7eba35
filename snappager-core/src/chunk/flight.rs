//! Single-flight initialization of one cached value.

use std::sync::{Arc, Mutex, MutexGuard};

/// A slot filled at most once by a fallible initializer.
///
/// Concurrent callers of [`SingleFlight::get_or_try_init`] coalesce: one runs
/// the initializer while the others wait for its outcome. A failed
/// initialization leaves the slot empty so the next caller retries.
#[derive(Debug)]
pub struct SingleFlight<T> {
    slot: Mutex<Option<Arc<T>>>,
}

impl<T> SingleFlight<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Arc<T>>> {
        // The slot only ever holds a finished value, so a panic in some
        // initializer cannot leave it half-written.
        match self.slot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// The value, if some caller already produced it.
    pub fn get(&self) -> Option<Arc<T>> {
        self.lock().clone()
    }

    /// Return the value, running `init` if no caller has produced it yet.
    pub fn get_or_try_init<E>(&self, init: impl FnOnce() -> Result<T, E>) -> Result<Arc<T>, E> {
        let mut slot = self.lock();
        if let Some(value) = slot.as_ref() {
            return Ok(Arc::clone(value));
        }

        let value = Arc::new(init()?);
        *slot = Some(Arc::clone(&value));
        Ok(value)
    }
}

impl<T> Default for SingleFlight<T> {
    fn default() -> Self {
        Self::new()
    }
}
