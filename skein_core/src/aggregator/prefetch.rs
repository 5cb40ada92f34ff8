//! Per-destination prefetch ring.
//!
//! A fixed ring of `{running_size: u16, pointer: i48}` samples, one per
//! recent insert, packed the same way as the list word. Entry `k` records
//! the running serialized-byte total and record pointer that were current
//! when the message at list position `k mod D` went in. The enqueue path
//! reads it to estimate the aggregate size in O(1) without walking the
//! list; the send path reads it as a cache-warming hint.
//!
//! Slots are relaxed atomics: the writer is whichever producer's CAS
//! installed that count, and readers treat the contents as hints. A stale
//! sample can only delay a capacity flush by one insert, never corrupt the
//! list. Pointers read from the ring may dangle after a grab and are never
//! dereferenced.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::message::Message;

#[inline]
fn pack(size: u16, pointer: *mut Message) -> u64 {
    let addr = pointer as usize as i64;
    debug_assert_eq!((addr << 16) >> 16, addr, "pointer not representable in 48 bits");
    ((addr << 16) as u64) | size as u64
}

pub(crate) struct PrefetchRing {
    slots: Box<[AtomicU64]>,
}

impl PrefetchRing {
    pub fn new(distance: usize) -> Self {
        let slots = (0..distance).map(|_| AtomicU64::new(0)).collect();
        Self { slots }
    }

    #[inline]
    fn slot(&self, count: usize) -> &AtomicU64 {
        &self.slots[count % self.slots.len()]
    }

    /// Running serialized-size total remembered for list position `count`.
    #[inline]
    pub fn size_at(&self, count: usize) -> u16 {
        self.slot(count).load(Ordering::Relaxed) as u16
    }

    /// Oldest remembered record pointer for list position `count`. Hint
    /// only — may dangle.
    #[inline]
    pub fn pointer_at(&self, count: usize) -> *mut Message {
        ((self.slot(count).load(Ordering::Relaxed) as i64) >> 16) as usize as *mut Message
    }

    /// Record the sample for the insert that took list position `count`.
    #[inline]
    pub fn store(&self, count: usize, size: u16, pointer: *mut Message) {
        self.slot(count).store(pack(size, pointer), Ordering::Relaxed);
    }
}
