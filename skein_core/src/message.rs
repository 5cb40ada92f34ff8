//! Message records and the receive-side deserializer registry.
//!
//! A [`Message`] is the unit the aggregator moves: a destination core, a
//! deserializer id, and an opaque payload blob. Enqueued messages are
//! chained through their intrusive `next` slot into a per-destination
//! lock-free list; the `prefetch` slot remembers an older record as a
//! cache-warming hint for the send-path walk.
//!
//! On the receive side, dispatch is decoupled from types: a
//! [`DeserializerRegistry`] maps the 16-bit id carried in each wire record
//! to a handler that consumes the payload bytes. The registry is populated
//! at init and identical on every core.

use std::collections::HashMap;
use std::ptr;

use parking_lot::RwLock;

use crate::error::{SkeinError, SkeinResult};
use crate::topology::Core;
use crate::wire::RECORD_HEADER_BYTES;

/// Identifies a registered deserializer on the wire.
pub type DeserializerId = u16;

/// A message owned by the aggregator from enqueue until serialization.
#[derive(Debug)]
pub struct Message {
    pub(crate) destination: Core,
    pub(crate) deserializer: DeserializerId,
    pub(crate) payload: Vec<u8>,
    /// Intrusive link to the next (older) record in a destination list.
    pub(crate) next: *mut Message,
    /// Oldest remembered record at insert time. Hint only, may dangle after
    /// a grab; never dereferenced for correctness.
    pub(crate) prefetch: *mut Message,
}

// SAFETY: ownership of a record moves between threads (producer to
// flusher) through the packed word's CAS; the intrusive pointers are only
// followed by the single thread that detached the containing list, and the
// acquire/release pairs on the word order those accesses.
unsafe impl Send for Message {}

impl Message {
    /// Create a message bound for `destination`. The payload is the opaque
    /// blob the registered deserializer will receive on the far side.
    pub fn new(
        destination: Core,
        deserializer: DeserializerId,
        payload: Vec<u8>,
    ) -> SkeinResult<Box<Message>> {
        if payload.len() > u16::MAX as usize {
            return Err(SkeinError::Oversized {
                size: payload.len(),
                limit: u16::MAX as usize,
                path: "wire record payload",
            });
        }
        Ok(Box::new(Message {
            destination,
            deserializer,
            payload,
            next: ptr::null_mut(),
            prefetch: ptr::null_mut(),
        }))
    }

    #[inline]
    pub fn destination(&self) -> Core {
        self.destination
    }

    #[inline]
    pub fn deserializer(&self) -> DeserializerId {
        self.deserializer
    }

    /// Exact bytes this message occupies in a send buffer.
    #[inline]
    pub fn serialized_size(&self) -> usize {
        RECORD_HEADER_BYTES + self.payload.len()
    }
}

/// Handler invoked with a record's payload in active-message context.
///
/// Handlers must not block, must not allocate unboundedly, and must not
/// enqueue to their own core's aggregator (use the immediate path instead).
pub type DeserializerFn = Box<dyn Fn(&[u8]) + Send + Sync>;

/// Receive-side dispatch table: deserializer id → handler.
#[derive(Default)]
pub struct DeserializerRegistry {
    table: RwLock<HashMap<DeserializerId, DeserializerFn>>,
}

impl DeserializerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `id`. Replaces any previous registration.
    pub fn register<F>(&self, id: DeserializerId, handler: F)
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.table.write().insert(id, Box::new(handler));
    }

    /// Dispatch one payload. An unknown id is a wire-level fault.
    pub fn dispatch(&self, id: DeserializerId, payload: &[u8]) -> SkeinResult<()> {
        let table = self.table.read();
        match table.get(&id) {
            Some(handler) => {
                handler(payload);
                Ok(())
            }
            None => Err(SkeinError::UnknownDeserializer(id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn serialized_size_includes_header() {
        let m = Message::new(0, 7, vec![0u8; 96]).unwrap();
        assert_eq!(m.serialized_size(), 96 + RECORD_HEADER_BYTES);
    }

    #[test]
    fn rejects_payload_beyond_u16() {
        let err = Message::new(0, 7, vec![0u8; (u16::MAX as usize) + 1]).unwrap_err();
        assert!(matches!(err, SkeinError::Oversized { .. }));
    }

    #[test]
    fn registry_dispatches_by_id() {
        let registry = DeserializerRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        registry.register(3, move |payload| {
            assert_eq!(payload, b"abc");
            h.fetch_add(1, Ordering::Relaxed);
        });

        registry.dispatch(3, b"abc").unwrap();
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn unknown_id_is_an_error() {
        let registry = DeserializerRegistry::new();
        assert!(matches!(
            registry.dispatch(42, b""),
            Err(SkeinError::UnknownDeserializer(42))
        ));
    }
}
