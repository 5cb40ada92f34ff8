//! Aggregator counters.
//!
//! Monotone relaxed counters; incrementing can never fail or block. The
//! cas/enqueue ratio measures producer contention on the packed words.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub(crate) struct AggregatorStats {
    /// Messages accepted by `enqueue`
    pub app_messages_enqueue: AtomicU64,
    /// Total CAS attempts across all enqueues
    pub app_messages_enqueue_cas: AtomicU64,
    /// Messages sent through the immediate path
    pub app_messages_immediate: AtomicU64,
    /// Flushes triggered by the size estimate crossing `target_size`
    pub rdma_capacity_flushes: AtomicU64,
    /// Flushes requested explicitly or shipped by the idle-flush task
    pub rdma_requested_flushes: AtomicU64,
}

impl AggregatorStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            app_messages_enqueue: self.app_messages_enqueue.load(Ordering::Relaxed),
            app_messages_enqueue_cas: self.app_messages_enqueue_cas.load(Ordering::Relaxed),
            app_messages_immediate: self.app_messages_immediate.load(Ordering::Relaxed),
            rdma_capacity_flushes: self.rdma_capacity_flushes.load(Ordering::Relaxed),
            rdma_requested_flushes: self.rdma_requested_flushes.load(Ordering::Relaxed),
        }
    }
}

/// Non-atomic snapshot of the aggregator counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub app_messages_enqueue: u64,
    pub app_messages_enqueue_cas: u64,
    pub app_messages_immediate: u64,
    pub rdma_capacity_flushes: u64,
    pub rdma_requested_flushes: u64,
}

impl StatsSnapshot {
    /// Total flush-initiated send operations.
    pub fn total_flushes(&self) -> u64 {
        self.rdma_capacity_flushes + self.rdma_requested_flushes
    }
}

#[inline]
pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}
