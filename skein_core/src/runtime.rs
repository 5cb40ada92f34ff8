//! Scheduling shims for the host runtime.
//!
//! The aggregator was designed against a cooperative, one-thread-per-core
//! scheduler. Rendered on OS threads, its two scheduling needs are a
//! full/empty rendezvous cell and a way to yield between background sends.

use parking_lot::{Condvar, Mutex};

/// A single-slot synchronization cell with full/empty semantics.
///
/// `fill` blocks while the cell is full, then writes and marks it full;
/// `take` blocks until it is full, then empties it. One writer and one
/// reader at a time.
pub struct FullEmpty<T> {
    slot: Mutex<Option<T>>,
    available: Condvar,
}

impl<T> Default for FullEmpty<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FullEmpty<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            available: Condvar::new(),
        }
    }

    /// Write `value`, waiting for the cell to be empty first.
    pub fn fill(&self, value: T) {
        let mut slot = self.slot.lock();
        while slot.is_some() {
            self.available.wait(&mut slot);
        }
        *slot = Some(value);
        self.available.notify_all();
    }

    /// Take the value, waiting for the cell to be full first.
    pub fn take(&self) -> T {
        let mut slot = self.slot.lock();
        loop {
            if let Some(value) = slot.take() {
                self.available.notify_all();
                return value;
            }
            self.available.wait(&mut slot);
        }
    }

    /// Non-blocking read of the full/empty state.
    pub fn is_full(&self) -> bool {
        self.slot.lock().is_some()
    }
}

/// Give other runnable work a chance between sends.
#[inline]
pub fn yield_now() {
    std::thread::yield_now();
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn take_blocks_until_filled() {
        let cell = Arc::new(FullEmpty::<u32>::new());
        let reader = {
            let cell = Arc::clone(&cell);
            std::thread::spawn(move || cell.take())
        };
        std::thread::sleep(Duration::from_millis(20));
        cell.fill(7);
        assert_eq!(reader.join().unwrap(), 7);
        assert!(!cell.is_full());
    }

    #[test]
    fn fill_waits_for_empty() {
        let cell = Arc::new(FullEmpty::<u32>::new());
        cell.fill(1);
        let writer = {
            let cell = Arc::clone(&cell);
            std::thread::spawn(move || cell.fill(2))
        };
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cell.take(), 1);
        writer.join().unwrap();
        assert_eq!(cell.take(), 2);
    }
}
