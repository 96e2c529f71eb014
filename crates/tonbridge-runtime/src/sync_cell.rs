//! Minimal mutex-guarded cell.

use parking_lot::Mutex;

/// A value behind a mutex, accessed only through [`SyncCell::with`] so that
/// every read-modify-write happens inside a single critical section.
///
/// Used for the timer table, the SSE session table, the abort registry and
/// other state shared between the context thread and background tasks.
pub struct SyncCell<T> {
    inner: Mutex<T>,
}

impl<T> SyncCell<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.inner.lock())
    }
}

impl<T: Default> Default for SyncCell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_modify_write_is_one_section() {
        let cell = SyncCell::new(0u32);
        let id = cell.with(|n| {
            *n += 1;
            *n
        });
        assert_eq!(id, 1);
        assert_eq!(cell.with(|n| *n), 1);
    }
}
