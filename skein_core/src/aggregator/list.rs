//! The packed per-destination list word.
//!
//! A single 64-bit atomic carries both the list length (low 16 bits) and the
//! head pointer (high 48 bits, sign-extended on read). Producers hand lists
//! off with one CAS on the whole word; separate count/pointer updates would
//! admit torn states. The pointer field relies on canonical-form virtual
//! addresses, which hold on the 64-bit platforms we target.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::message::Message;

/// Raw value of an empty word: count 0, pointer null.
pub(crate) const EMPTY_WORD: u64 = 0;

/// Pack a count and head pointer into one word.
#[inline]
pub(crate) fn pack(count: u16, head: *mut Message) -> u64 {
    let addr = head as usize as i64;
    // Canonical 48-bit addresses survive the 16-bit shift round trip.
    debug_assert_eq!((addr << 16) >> 16, addr, "pointer not representable in 48 bits");
    ((addr << 16) as u64) | count as u64
}

/// Count field of a packed word.
#[inline]
pub(crate) fn count_of(word: u64) -> u16 {
    word as u16
}

/// Head pointer of a packed word, sign-extended back to 64 bits.
#[inline]
pub(crate) fn head_of(word: u64) -> *mut Message {
    ((word as i64) >> 16) as usize as *mut Message
}

/// Atomic cell holding one packed list word.
#[derive(Default)]
pub(crate) struct ListWord(AtomicU64);

impl ListWord {
    pub fn new() -> Self {
        Self(AtomicU64::new(EMPTY_WORD))
    }

    /// Snapshot the word.
    #[inline]
    pub fn load(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.load() == EMPTY_WORD
    }

    /// Atomically take the whole list, leaving the word empty.
    #[inline]
    pub fn grab(&self) -> u64 {
        self.0.swap(EMPTY_WORD, Ordering::AcqRel)
    }

    /// One CAS attempt: `old` → `new`. On failure returns the fresh value.
    /// Strong variant: a failure always means another producer progressed.
    #[inline]
    pub fn try_swap(&self, old: u64, new: u64) -> Result<(), u64> {
        self.0
            .compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
    }
}

/// Reverse a chain in place, returning the new head.
///
/// The grabbed list is newest-first; reversal restores insertion order
/// before serialization.
///
/// # Safety
///
/// `head` must be null or the head of an exclusively-owned chain.
pub(crate) unsafe fn reverse_chain(mut head: *mut Message) -> *mut Message {
    let mut prev: *mut Message = std::ptr::null_mut();
    while !head.is_null() {
        let next = (*head).next;
        (*head).next = prev;
        prev = head;
        head = next;
    }
    prev
}

/// Length of a chain. Used by asserts and tests; O(n).
///
/// # Safety
///
/// `head` must be null or the head of an exclusively-owned chain.
pub(crate) unsafe fn chain_len(mut head: *mut Message) -> usize {
    let mut n = 0;
    while !head.is_null() {
        n += 1;
        head = (*head).next;
    }
    n
}

#[cfg(test)]
mod tests {
    use std::ptr;
    use std::sync::Arc;

    use super::*;

    fn raw_message() -> *mut Message {
        Box::into_raw(Message::new(0, 0, vec![1, 2, 3]).unwrap())
    }

    fn free(m: *mut Message) {
        drop(unsafe { Box::from_raw(m) });
    }

    #[test]
    fn pack_roundtrips_heap_pointers() {
        let m = raw_message();
        let word = pack(17, m);
        assert_eq!(count_of(word), 17);
        assert_eq!(head_of(word), m);
        free(m);
    }

    #[test]
    fn pack_sign_extends_high_half_addresses() {
        // Kernel-half canonical address; packed and unpacked, never followed.
        let fake = 0xFFFF_8000_0000_1234usize as *mut Message;
        let word = pack(3, fake);
        assert_eq!(head_of(word), fake);
        assert_eq!(count_of(word), 3);
    }

    #[test]
    fn empty_word_is_null_and_zero() {
        assert_eq!(count_of(EMPTY_WORD), 0);
        assert!(head_of(EMPTY_WORD).is_null());
        assert_eq!(pack(0, ptr::null_mut()), EMPTY_WORD);
    }

    #[test]
    fn grab_empties_the_word() {
        let cell = ListWord::new();
        let m = raw_message();
        cell.try_swap(EMPTY_WORD, pack(1, m)).unwrap();

        let taken = cell.grab();
        assert_eq!(count_of(taken), 1);
        assert_eq!(head_of(taken), m);
        assert!(cell.is_empty());
        free(m);
    }

    /// CAS-push in the enqueue style; count must always equal chain length.
    fn push(cell: &ListWord, m: *mut Message) {
        loop {
            let old = cell.load();
            unsafe { (*m).next = head_of(old) };
            let new = pack(count_of(old) + 1, m);
            if cell.try_swap(old, new).is_ok() {
                return;
            }
        }
    }

    #[test]
    fn count_tracks_chain_length_under_contention() {
        let cell = Arc::new(ListWord::new());
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let cell = Arc::clone(&cell);
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        push(&cell, raw_message());
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        let word = cell.grab();
        assert_eq!(count_of(word), 2000);
        assert_eq!(unsafe { chain_len(head_of(word)) }, 2000);

        let mut head = head_of(word);
        while !head.is_null() {
            let next = unsafe { (*head).next };
            free(head);
            head = next;
        }
    }

    #[test]
    fn reverse_restores_insertion_order() {
        let cell = ListWord::new();
        let msgs: Vec<_> = (0..5).map(|_| raw_message()).collect();
        for &m in &msgs {
            push(&cell, m);
        }

        let head = unsafe { reverse_chain(head_of(cell.grab())) };
        let mut walk = head;
        for &expected in &msgs {
            assert_eq!(walk, expected);
            walk = unsafe { (*walk).next };
        }
        assert!(walk.is_null());

        for m in msgs {
            free(m);
        }
    }
}
