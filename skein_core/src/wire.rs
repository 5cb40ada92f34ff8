//! Wire format shared by sender and receiver.
//!
//! A send buffer is a dense concatenation of self-describing records:
//!
//! ```text
//! { deserializer_id: u16 LE, payload_size: u16 LE, payload[payload_size] }
//! ```
//!
//! The serializer walks an insertion-ordered message chain and packs records
//! until the byte cap; the deaggregator walks a received buffer and
//! dispatches each record through the registry. Both sides must agree on
//! this layout exactly — a walk that does not consume the advertised byte
//! count indicates corruption or a sender/receiver skew and is fatal.

use crate::error::{SkeinError, SkeinResult};
use crate::message::{DeserializerRegistry, Message};

/// Bytes of framing in front of every payload.
pub const RECORD_HEADER_BYTES: usize = 4;

/// Write one record at the start of `buf`. Caller guarantees capacity.
#[inline]
fn write_record(buf: &mut [u8], id: u16, payload: &[u8]) -> usize {
    let size = RECORD_HEADER_BYTES + payload.len();
    debug_assert!(buf.len() >= size);
    buf[0..2].copy_from_slice(&id.to_le_bytes());
    buf[2..4].copy_from_slice(&(payload.len() as u16).to_le_bytes());
    buf[4..size].copy_from_slice(payload);
    size
}

/// Serialize records from the chain at `*list` into `buf`, in chain order.
///
/// Stops *before* any record that would overrun `buf`, leaving `*list` at
/// the first unserialized record (null when the chain is exhausted).
/// Consumed records are released. Returns bytes written; `count_out`, when
/// present, receives the number of records consumed.
///
/// The caller passes the chain in insertion order (the grabbed list is
/// newest-first and must be reversed first — see `list::reverse_chain`).
///
/// # Safety
///
/// `*list` must be null or the head of an exclusively-owned chain of
/// records obtained from `Box<Message>`; no other thread may touch the
/// chain during the call.
pub(crate) unsafe fn aggregate_to_buffer(
    buf: &mut [u8],
    list: &mut *mut Message,
    mut count_out: Option<&mut usize>,
) -> usize {
    let mut cursor = 0usize;
    let mut consumed = 0usize;

    while !list.is_null() {
        let record = *list;
        let size = (*record).serialized_size();
        if cursor + size > buf.len() {
            break;
        }
        write_record(
            &mut buf[cursor..],
            (*record).deserializer,
            &(*record).payload,
        );
        cursor += size;
        consumed += 1;
        *list = (*record).next;
        // Serialization completes the aggregator's claim on the record.
        drop(Box::from_raw(record));
    }

    if let Some(count) = count_out.as_deref_mut() {
        *count = consumed;
    }
    cursor
}

/// Walk a received buffer, dispatching every record in order.
///
/// The walk must consume exactly `buf.len()` bytes. Returns the number of
/// records dispatched.
pub fn deaggregate_buffer(buf: &[u8], registry: &DeserializerRegistry) -> SkeinResult<usize> {
    let mut cursor = 0usize;
    let mut dispatched = 0usize;

    while cursor < buf.len() {
        let (id, payload, next) = read_record(buf, cursor)?;
        registry.dispatch(id, payload)?;
        dispatched += 1;
        cursor = next;
    }

    debug_assert_eq!(cursor, buf.len());
    Ok(dispatched)
}

/// Fast path for a buffer holding exactly one record.
pub fn deaggregate_first(buf: &[u8], registry: &DeserializerRegistry) -> SkeinResult<()> {
    let (id, payload, next) = read_record(buf, 0)?;
    if next != buf.len() {
        return Err(SkeinError::wire(format!(
            "single-record buffer has {} trailing bytes",
            buf.len() - next
        )));
    }
    registry.dispatch(id, payload)
}

fn read_record(buf: &[u8], cursor: usize) -> SkeinResult<(u16, &[u8], usize)> {
    if cursor + RECORD_HEADER_BYTES > buf.len() {
        return Err(SkeinError::wire(format!(
            "truncated record header at offset {} of {}",
            cursor,
            buf.len()
        )));
    }
    let id = u16::from_le_bytes([buf[cursor], buf[cursor + 1]]);
    let size = u16::from_le_bytes([buf[cursor + 2], buf[cursor + 3]]) as usize;
    let start = cursor + RECORD_HEADER_BYTES;
    let end = start + size;
    if end > buf.len() {
        return Err(SkeinError::wire(format!(
            "record payload of {} bytes overruns buffer ({} of {} remain)",
            size,
            buf.len() - start,
            buf.len()
        )));
    }
    Ok((id, &buf[start..end], end))
}

#[cfg(test)]
mod tests {
    use std::ptr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;

    /// Build an insertion-ordered chain out of payloads; returns the head.
    fn chain(payloads: &[&[u8]]) -> *mut Message {
        let mut head: *mut Message = ptr::null_mut();
        let mut tail: *mut Message = ptr::null_mut();
        for p in payloads {
            let m = Box::into_raw(Message::new(0, 9, p.to_vec()).unwrap());
            if head.is_null() {
                head = m;
            } else {
                unsafe { (*tail).next = m };
            }
            tail = m;
        }
        head
    }

    #[test]
    fn bytes_written_equal_sum_of_sizes() {
        let mut list = chain(&[b"aaaa", b"bb", b"cccccc"]);
        let mut buf = vec![0u8; 256];
        let mut count = 0usize;
        let wrote = unsafe { aggregate_to_buffer(&mut buf, &mut list, Some(&mut count)) };
        assert!(list.is_null());
        assert_eq!(count, 3);
        assert_eq!(wrote, 3 * RECORD_HEADER_BYTES + 4 + 2 + 6);
    }

    #[test]
    fn cap_stops_before_writing_and_leaves_residual() {
        // Five 100-byte records (96-byte payloads), 300-byte cap: two fit.
        let payload = [7u8; 96];
        let mut list = chain(&[&payload, &payload, &payload, &payload, &payload]);
        let mut buf = vec![0u8; 300];
        let mut count = 0usize;
        let wrote = unsafe { aggregate_to_buffer(&mut buf, &mut list, Some(&mut count)) };
        assert_eq!(wrote, 200);
        assert_eq!(count, 2);
        assert!(!list.is_null());

        // The residual three still serialize, in order, into 300 bytes.
        let wrote = unsafe { aggregate_to_buffer(&mut buf, &mut list, Some(&mut count)) };
        assert_eq!(wrote, 300);
        assert_eq!(count, 3);
        assert!(list.is_null());
    }

    #[test]
    fn roundtrip_preserves_order_and_payloads() {
        let mut list = chain(&[b"first", b"second", b"third"]);
        let mut buf = vec![0u8; 128];
        let wrote = unsafe { aggregate_to_buffer(&mut buf, &mut list, None) };

        let seen = Arc::new(Mutex::new(Vec::new()));
        let registry = DeserializerRegistry::new();
        let s = Arc::clone(&seen);
        registry.register(9, move |p| s.lock().unwrap().push(p.to_vec()));

        let n = deaggregate_buffer(&buf[..wrote], &registry).unwrap();
        assert_eq!(n, 3);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![b"first".to_vec(), b"second".to_vec(), b"third".to_vec()]
        );
    }

    #[test]
    fn truncated_buffer_is_fatal() {
        let mut list = chain(&[b"payload"]);
        let mut buf = vec![0u8; 64];
        let wrote = unsafe { aggregate_to_buffer(&mut buf, &mut list, None) };
        let registry = DeserializerRegistry::new();
        registry.register(9, |_| {});

        // Short by one byte: the walk must not line up.
        assert!(deaggregate_buffer(&buf[..wrote - 1], &registry).is_err());
    }

    #[test]
    fn first_rejects_trailing_bytes() {
        let mut list = chain(&[b"a", b"b"]);
        let mut buf = vec![0u8; 64];
        let wrote = unsafe { aggregate_to_buffer(&mut buf, &mut list, None) };
        let registry = DeserializerRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        registry.register(9, move |_| {
            h.fetch_add(1, Ordering::Relaxed);
        });

        assert!(deaggregate_first(&buf[..wrote], &registry).is_err());

        // Exactly one record is fine.
        let one = RECORD_HEADER_BYTES + 1;
        deaggregate_first(&buf[..one], &registry).unwrap();
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn zero_length_buffer_dispatches_nothing() {
        let registry = DeserializerRegistry::new();
        assert_eq!(deaggregate_buffer(&[], &registry).unwrap(), 0);
    }
}
