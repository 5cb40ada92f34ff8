//! Per-destination message aggregation.
//!
//! Producers enqueue small messages bound for remote cores; the aggregator
//! gathers them per destination in a lock-free intrusive list, ships a
//! concatenated buffer once the running size estimate crosses the
//! configured target (or on explicit flush), and walks received buffers on
//! the far side invoking each record's registered deserializer in order.
//!
//! The enqueue path is wait-free with respect to other producers: one CAS
//! on the destination's packed word per attempt, and any failed attempt
//! means another producer made progress. Producers whose insert crosses the
//! size target detach the whole list with the same CAS and ship it
//! themselves; everything else is picked up by an explicit `flush` or the
//! idle-flush task.

mod dest;
mod list;
mod prefetch;
mod stats;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

use crate::config::{AggregatorConfig, PrefetchStrategy};
use crate::error::{fatal, SkeinError, SkeinResult};
use crate::message::{DeserializerRegistry, Message};
use crate::runtime;
use crate::topology::{Core, Topology};
use crate::transport::{
    BufferRequest, BufferReply, SendBufferInfo, Transport, AM_BUFFER_ACK, AM_BUFFER_REPLY,
    AM_BUFFER_REQUEST, AM_DESERIALIZE_BUFFER, AM_DESERIALIZE_FIRST,
};
use crate::wire;

use dest::DestState;
use stats::{bump, AggregatorStats};

pub use stats::StatsSnapshot;

/// Immediate sends at or below this size serialize on the stack.
const IMMEDIATE_STACK_BYTES: usize = 256;

#[repr(align(16))]
struct ImmediateScratch([u8; IMMEDIATE_STACK_BYTES]);

/// One core's aggregation endpoint.
///
/// Create with [`Aggregator::init`] once the transport is up; tear down
/// with [`Aggregator::shutdown`] (or drop) after the job's final barrier.
pub struct Aggregator {
    inner: Arc<Inner>,
    idle_task: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    me: Core,
    topology: Topology,
    config: AggregatorConfig,
    transport: Arc<dyn Transport>,
    registry: Arc<DeserializerRegistry>,
    destinations: Box<[DestState]>,
    stats: AggregatorStats,
    flush_signal: Mutex<bool>,
    flush_cv: Condvar,
    shutdown: AtomicBool,
}

impl Aggregator {
    /// Bind an aggregator to `me`, allocate the destination table, register
    /// the active-message handlers, and spawn the idle-flush task.
    pub fn init(
        config: AggregatorConfig,
        me: Core,
        topology: Topology,
        transport: Arc<dyn Transport>,
        registry: Arc<DeserializerRegistry>,
    ) -> SkeinResult<Aggregator> {
        config.validate()?;
        topology.validate()?;
        if me >= topology.total_cores {
            return Err(SkeinError::BadDestination {
                destination: me,
                total_cores: topology.total_cores,
            });
        }
        if config.medium_cutoff > transport.medium_mtu() {
            return Err(SkeinError::config(format!(
                "medium_cutoff {} exceeds the transport MTU {}",
                config.medium_cutoff,
                transport.medium_mtu()
            )));
        }

        let destinations = (0..topology.total_cores)
            .map(|c| DestState::new(topology.representative_of(c), config.prefetch_distance))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let inner = Arc::new(Inner {
            me,
            topology,
            config,
            transport,
            registry,
            destinations,
            stats: AggregatorStats::default(),
            flush_signal: Mutex::new(false),
            flush_cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });

        Inner::register_handlers(&inner)?;

        let idle = {
            let weak = Arc::downgrade(&inner);
            std::thread::Builder::new()
                .name(format!("skein-idle-flush-{}", me))
                .spawn(move || Inner::idle_flush_loop(weak))
                .map_err(|e| SkeinError::transport(format!("failed to spawn idle-flush task: {}", e)))?
        };

        log::debug!(
            "core {}: aggregator up ({} cores, target_size {})",
            me,
            inner.topology.total_cores,
            inner.config.target_size
        );

        Ok(Aggregator {
            inner,
            idle_task: Mutex::new(Some(idle)),
        })
    }

    /// Queue `m` for aggregated delivery to its destination core.
    ///
    /// Wait-free against other producers. If this insert pushes the
    /// destination's size estimate past `target_size`, the caller detaches
    /// the whole list and ships it before returning.
    pub fn enqueue(&self, m: Box<Message>) -> SkeinResult<()> {
        let inner = &self.inner;
        if inner.shutdown.load(Ordering::Acquire) {
            return Err(SkeinError::ShutdownRace);
        }
        let core = m.destination;
        if core >= inner.topology.total_cores {
            return Err(SkeinError::BadDestination {
                destination: core,
                total_cores: inner.topology.total_cores,
            });
        }
        let size = m.serialized_size();
        if size > inner.config.target_size {
            return Err(SkeinError::Oversized {
                size,
                limit: inner.config.target_size,
                path: "aggregated enqueue",
            });
        }
        bump(&inner.stats.app_messages_enqueue);

        let dest = &inner.destinations[core as usize];
        let m = Box::into_raw(m);
        loop {
            let old = dest.list.load();
            let old_count = list::count_of(old) as usize;
            let count = old_count + 1;
            debug_assert!(count <= u16::MAX as usize);

            // O(1) aggregate estimate: our size plus the running total the
            // previous insert left in the ring.
            let estimate = size
                + if count > 1 {
                    dest.ring.size_at(old_count) as usize
                } else {
                    0
                };

            // SAFETY: `m` is unpublished until the CAS below succeeds, so
            // we are its only writer.
            unsafe {
                (*m).next = list::head_of(old);
                // The slot we are about to take holds the oldest pointer
                // this ring still remembers.
                (*m).prefetch = dest.ring.pointer_at(count);
            }

            if estimate >= inner.config.target_size {
                // Take the list ourselves. Detach under the send guard so
                // concurrent flushes to this destination ship in detach
                // order, which is what per-producer FIFO rests on.
                let _guard = dest.send_guard.lock();
                bump(&inner.stats.app_messages_enqueue_cas);
                if dest.list.try_swap(old, list::EMPTY_WORD).is_err() {
                    continue;
                }
                bump(&inner.stats.rdma_capacity_flushes);
                log::debug!(
                    "core {}: capacity flush to core {} at {} records / ~{} bytes",
                    inner.me,
                    core,
                    count,
                    estimate
                );
                return inner.dispatch_list(core, m);
            }

            bump(&inner.stats.app_messages_enqueue_cas);
            if dest.list.try_swap(old, list::pack(count as u16, m)).is_err() {
                continue;
            }
            dest.ring.store(count, estimate as u16, m);
            return Ok(());
        }
    }

    /// Serialize and send exactly one message, bypassing aggregation.
    ///
    /// Never touches per-destination state and never blocks, so it is safe
    /// from inside an active-message handler.
    pub fn send_immediate(&self, m: Box<Message>) -> SkeinResult<()> {
        let inner = &self.inner;
        if inner.shutdown.load(Ordering::Acquire) {
            return Err(SkeinError::ShutdownRace);
        }
        let core = m.destination;
        if core >= inner.topology.total_cores {
            return Err(SkeinError::BadDestination {
                destination: core,
                total_cores: inner.topology.total_cores,
            });
        }
        let size = m.serialized_size();
        if size > inner.transport.medium_mtu() {
            return Err(SkeinError::Oversized {
                size,
                limit: inner.transport.medium_mtu(),
                path: "immediate send",
            });
        }
        bump(&inner.stats.app_messages_immediate);

        let mut raw = Box::into_raw(m);
        if size <= IMMEDIATE_STACK_BYTES {
            let mut scratch = ImmediateScratch([0u8; IMMEDIATE_STACK_BYTES]);
            // SAFETY: `raw` is a single exclusively-owned record.
            let wrote = unsafe { wire::aggregate_to_buffer(&mut scratch.0[..size], &mut raw, None) };
            debug_assert_eq!(wrote, size);
            debug_assert!(raw.is_null());
            inner
                .transport
                .send_medium(core, AM_DESERIALIZE_FIRST, &scratch.0[..size])
        } else {
            let mut buf = vec![0u8; size];
            // SAFETY: as above.
            let wrote = unsafe { wire::aggregate_to_buffer(&mut buf, &mut raw, None) };
            debug_assert_eq!(wrote, size);
            inner.transport.send_medium(core, AM_DESERIALIZE_FIRST, &buf)
        }
    }

    /// Flush one destination synchronously on the caller.
    ///
    /// Returns whether anything was shipped. A flush of an empty
    /// destination is a no-op and does not touch the transport.
    pub fn flush(&self, core: Core) -> SkeinResult<bool> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(SkeinError::ShutdownRace);
        }
        if core >= self.inner.topology.total_cores {
            return Err(SkeinError::BadDestination {
                destination: core,
                total_cores: self.inner.topology.total_cores,
            });
        }
        let shipped = self.inner.flush_one(core)?;
        if shipped {
            bump(&self.inner.stats.rdma_requested_flushes);
        }
        Ok(shipped)
    }

    /// Wake the idle-flush task to drain any non-empty destination.
    pub fn idle_flush(&self) {
        self.inner.signal_flush();
    }

    /// Current counter values.
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn my_core(&self) -> Core {
        self.inner.me
    }

    pub fn total_cores(&self) -> Core {
        self.inner.topology.total_cores
    }

    /// Representative (lowest-numbered) core on `core`'s node.
    pub fn representative_of(&self, core: Core) -> Option<Core> {
        self.inner
            .destinations
            .get(core as usize)
            .map(|d| d.representative)
    }

    /// Drain every destination, stop the idle-flush task, and unregister
    /// the active-message handlers. Idempotent.
    pub fn shutdown(&self) -> SkeinResult<()> {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.signal_flush();
        if let Some(handle) = self.idle_task.lock().take() {
            if let Err(panic) = handle.join() {
                // The idle task only panics on bugs; re-raise on the caller
                // instead of swallowing it.
                std::panic::resume_unwind(panic);
            }
        }
        for core in 0..self.inner.topology.total_cores {
            self.inner.flush_one(core)?;
        }
        for id in [
            AM_DESERIALIZE_BUFFER,
            AM_DESERIALIZE_FIRST,
            AM_BUFFER_REQUEST,
            AM_BUFFER_REPLY,
            AM_BUFFER_ACK,
        ] {
            self.inner.transport.unregister_handler(id)?;
        }
        log::debug!("core {}: aggregator down", self.inner.me);
        Ok(())
    }
}

impl Drop for Aggregator {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::error!("core {}: teardown failed: {}", self.inner.me, e);
        }
    }
}

impl Inner {
    fn register_handlers(inner: &Arc<Inner>) -> SkeinResult<()> {
        let t = Arc::clone(&inner.transport);

        let w = Arc::downgrade(inner);
        t.register_handler(
            AM_DESERIALIZE_BUFFER,
            Box::new(move |src, payload| with_inner(&w, |i| i.on_deserialize_buffer(src, payload))),
        )?;

        let w = Arc::downgrade(inner);
        t.register_handler(
            AM_DESERIALIZE_FIRST,
            Box::new(move |src, payload| with_inner(&w, |i| i.on_deserialize_first(src, payload))),
        )?;

        let w = Arc::downgrade(inner);
        t.register_handler(
            AM_BUFFER_REQUEST,
            Box::new(move |src, payload| with_inner(&w, |i| i.on_buffer_request(src, payload))),
        )?;

        let w = Arc::downgrade(inner);
        t.register_handler(
            AM_BUFFER_REPLY,
            Box::new(move |src, payload| with_inner(&w, |i| i.on_buffer_reply(src, payload))),
        )?;

        let w = Arc::downgrade(inner);
        t.register_handler(
            AM_BUFFER_ACK,
            Box::new(move |src, payload| with_inner(&w, |i| i.on_buffer_ack(src, payload))),
        )?;

        Ok(())
    }

    // --- receive side -----------------------------------------------------
    //
    // Wire-format mismatches and rendezvous-protocol faults at these
    // boundaries are fatal to the whole job: `fatal!` aborts the process
    // rather than unwinding one dispatcher thread.

    fn on_deserialize_buffer(&self, src: Core, payload: &[u8]) {
        match wire::deaggregate_buffer(payload, &self.registry) {
            Ok(n) => log::trace!("core {}: dispatched {} records from core {}", self.me, n, src),
            Err(e) => fatal!("core {}: buffer walk from core {} failed: {}", self.me, src, e),
        }
    }

    fn on_deserialize_first(&self, src: Core, payload: &[u8]) {
        if let Err(e) = wire::deaggregate_first(payload, &self.registry) {
            fatal!("core {}: single-record walk from core {} failed: {}", self.me, src, e);
        }
    }

    fn on_buffer_request(&self, src: Core, payload: &[u8]) {
        let request: BufferRequest = match bincode::deserialize(payload) {
            Ok(r) => r,
            Err(e) => fatal!("core {}: corrupt buffer request from core {}: {}", self.me, src, e),
        };
        debug_assert_eq!(request.from, src);
        let info = match self.transport.expose(request.nbytes as usize) {
            Ok(info) => info,
            Err(e) => fatal!("core {}: failed to expose {} bytes: {}", self.me, request.nbytes, e),
        };
        let reply = BufferReply { info };
        let encoded = bincode::serialize(&reply).expect("buffer reply encodes");
        if let Err(e) = self.transport.send_medium(request.from, AM_BUFFER_REPLY, &encoded) {
            fatal!("core {}: failed to answer buffer request: {}", self.me, e);
        }
    }

    fn on_buffer_reply(&self, src: Core, payload: &[u8]) {
        let reply: BufferReply = match bincode::deserialize(payload) {
            Ok(r) => r,
            Err(e) => fatal!("core {}: corrupt buffer reply from core {}: {}", self.me, src, e),
        };
        // Wakes the sender parked in the rendezvous for `src`.
        self.destinations[src as usize].rendezvous.fill(reply.info);
    }

    fn on_buffer_ack(&self, src: Core, payload: &[u8]) {
        let info: SendBufferInfo = match bincode::deserialize(payload) {
            Ok(i) => i,
            Err(e) => fatal!("core {}: corrupt buffer ack from core {}: {}", self.me, src, e),
        };
        let buf = match self.transport.claim(info.ack) {
            Ok(buf) => buf,
            Err(e) => fatal!("core {}: ack for unknown buffer: {}", self.me, e),
        };
        let start = info.offset as usize;
        let end = start + info.actual_size as usize;
        if end > buf.len() {
            fatal!(
                "core {}: ack claims {} bytes at offset {} of a {}-byte buffer",
                self.me,
                info.actual_size,
                info.offset,
                buf.len()
            );
        }
        match wire::deaggregate_buffer(&buf[start..end], &self.registry) {
            Ok(n) => log::trace!("core {}: dispatched {} aggregated records from core {}", self.me, n, src),
            Err(e) => fatal!("core {}: buffer walk from core {} failed: {}", self.me, src, e),
        }
    }

    // --- send side --------------------------------------------------------

    /// Grab and ship one destination if it has anything outstanding.
    fn flush_one(&self, core: Core) -> SkeinResult<bool> {
        let dest = &self.destinations[core as usize];
        if dest.list.is_empty() {
            return Ok(false);
        }
        // Grab under the guard so concurrent flushes ship in grab order.
        let _guard = dest.send_guard.lock();
        let head = list::head_of(dest.list.grab());
        if head.is_null() {
            return Ok(false);
        }
        self.dispatch_list(core, head)?;
        Ok(true)
    }

    /// Serialize and transmit an exclusively-owned list. Caller holds the
    /// destination's send guard.
    fn dispatch_list(&self, core: Core, head: *mut Message) -> SkeinResult<()> {
        // SAFETY: the chain was atomically detached from the shared word;
        // this thread is its only owner.
        let mut ordered = unsafe { list::reverse_chain(head) };
        let total = unsafe { self.chain_bytes(ordered) };

        let result = if total <= self.config.medium_cutoff {
            // SAFETY: exclusive ownership as above.
            unsafe { self.ship_medium(core, &mut ordered, total) }
        } else {
            // SAFETY: exclusive ownership as above.
            unsafe { self.ship_rdma(core, &mut ordered, total) }
        };

        if result.is_err() {
            // Transport errors are fatal to the job; release whatever was
            // not serialized so teardown paths stay leak-free.
            unsafe { free_chain(ordered) };
        }
        result
    }

    /// Whole-list walk for the exact byte total, warming the cache with the
    /// ring's prefetch hints along the way.
    ///
    /// # Safety
    ///
    /// `cur` must be null or an exclusively-owned chain head.
    unsafe fn chain_bytes(&self, mut cur: *mut Message) -> usize {
        let mut total = 0usize;
        while !cur.is_null() {
            prefetch_hint((*cur).prefetch, self.config.prefetch_strategy);
            total += (*cur).serialized_size();
            cur = (*cur).next;
        }
        total
    }

    /// Small aggregate: one medium AM, no rendezvous round trip.
    ///
    /// # Safety
    ///
    /// `list` must point at an exclusively-owned, insertion-ordered chain.
    unsafe fn ship_medium(&self, core: Core, list: &mut *mut Message, total: usize) -> SkeinResult<()> {
        let mut buf = vec![0u8; total];
        let wrote = wire::aggregate_to_buffer(&mut buf, list, None);
        debug_assert_eq!(wrote, total);
        debug_assert!(list.is_null());
        self.transport.send_medium(core, AM_DESERIALIZE_BUFFER, &buf)
    }

    /// Rendezvous + one-sided write. If the buffer cap bites, the residual
    /// is requeued behind the grab point and the idle task follows up.
    ///
    /// # Safety
    ///
    /// `list` must point at an exclusively-owned, insertion-ordered chain.
    unsafe fn ship_rdma(&self, core: Core, list: &mut *mut Message, total: usize) -> SkeinResult<()> {
        let dest = &self.destinations[core as usize];
        let chunk = total.min(self.config.max_buffer_size);

        let request = BufferRequest {
            from: self.me,
            nbytes: chunk as u64,
        };
        self.transport
            .send_medium(core, AM_BUFFER_REQUEST, &bincode::serialize(&request)?)?;

        // Cooperative wait for the peer to allocate and publish a buffer.
        let info = dest.rendezvous.take();

        let mut buf = vec![0u8; chunk];
        let mut count = 0usize;
        let wrote = wire::aggregate_to_buffer(&mut buf, list, Some(&mut count));
        debug_assert!(wrote > 0, "buffer cap below a single record");

        self.transport.put(core, info.buffer, &buf[..wrote])?;
        let signal = SendBufferInfo {
            ack: info.ack,
            offset: 0,
            actual_size: wrote as u32,
        };
        self.transport
            .send_medium(core, AM_BUFFER_ACK, &bincode::serialize(&signal)?)?;
        log::debug!(
            "core {}: shipped {} records ({} bytes) to core {}",
            self.me,
            count,
            wrote,
            core
        );

        if !list.is_null() {
            let residual = std::mem::replace(list, std::ptr::null_mut());
            let n = list::chain_len(residual);
            self.requeue_residual(core, residual, n);
            self.signal_flush();
        }
        Ok(())
    }

    /// Splice a not-yet-serialized sub-list back into `core`'s word.
    ///
    /// The residual predates everything enqueued since the grab, so the
    /// next grab-and-reverse must serialize it first. Anything already in
    /// the word (or racing in while we splice) is newer and is folded in
    /// ahead of the residual by grabbing it; the combined chain is only
    /// installed onto an empty word.
    fn requeue_residual(&self, core: Core, residual: *mut Message, count: usize) {
        if residual.is_null() {
            return;
        }
        let dest = &self.destinations[core as usize];

        // SAFETY: residual chain is exclusively owned until published.
        let mut head = unsafe { list::reverse_chain(residual) };
        let mut total = count;

        loop {
            let grabbed = dest.list.grab();
            let newer = list::head_of(grabbed);
            if !newer.is_null() {
                // Everything grabbed was enqueued after the residual's
                // batch: it stays in front (newer) in the stored chain.
                // SAFETY: the grabbed chain is exclusively owned.
                unsafe {
                    let mut tail = newer;
                    while !(*tail).next.is_null() {
                        tail = (*tail).next;
                    }
                    (*tail).next = head;
                }
                head = newer;
                total += list::count_of(grabbed) as usize;
            }
            debug_assert!(total <= u16::MAX as usize);
            if dest
                .list
                .try_swap(list::EMPTY_WORD, list::pack(total as u16, head))
                .is_ok()
            {
                return;
            }
            // A producer slipped in between the grab and the install; fold
            // its messages in too.
        }
    }

    // --- idle flush -------------------------------------------------------

    fn signal_flush(&self) {
        let mut signal = self.flush_signal.lock();
        *signal = true;
        self.flush_cv.notify_all();
    }

    /// Body of the long-lived idle-flush task: wait for a signal, drain
    /// every non-empty destination, yield between sends.
    fn idle_flush_loop(weak: Weak<Inner>) {
        loop {
            let inner = match weak.upgrade() {
                Some(inner) => inner,
                None => return,
            };

            {
                let mut signal = inner.flush_signal.lock();
                while !*signal && !inner.shutdown.load(Ordering::Acquire) {
                    inner.flush_cv.wait(&mut signal);
                }
                *signal = false;
            }
            let stopping = inner.shutdown.load(Ordering::Acquire);

            for core in 0..inner.topology.total_cores {
                match inner.flush_one(core) {
                    Ok(true) => {
                        bump(&inner.stats.rdma_requested_flushes);
                        runtime::yield_now();
                    }
                    Ok(false) => {}
                    // A transport error is fatal to the job; dying quietly
                    // here would leave flushing stopped with nobody told.
                    Err(e) => fatal!("core {}: idle flush to core {} failed: {}", inner.me, core, e),
                }
            }

            if stopping {
                return;
            }
        }
    }
}

fn with_inner(weak: &Weak<Inner>, f: impl FnOnce(&Inner)) {
    // A dead Weak means the aggregator is mid-teardown; the message is a
    // teardown straggler and is dropped with the rest of the job.
    if let Some(inner) = weak.upgrade() {
        f(&inner);
    }
}

#[inline]
fn prefetch_hint(p: *mut Message, strategy: PrefetchStrategy) {
    if p.is_null() {
        return;
    }
    #[cfg(target_arch = "x86_64")]
    {
        use std::arch::x86_64::{_mm_prefetch, _MM_HINT_NTA, _MM_HINT_T0};
        // SAFETY: prefetch performs no memory access and cannot fault, so a
        // stale hint pointer is harmless.
        unsafe {
            match strategy {
                PrefetchStrategy::NonTemporal => _mm_prefetch::<{ _MM_HINT_NTA }>(p as *const i8),
                PrefetchStrategy::L1 => _mm_prefetch::<{ _MM_HINT_T0 }>(p as *const i8),
                PrefetchStrategy::None => {}
            }
        }
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        let _ = strategy;
    }
}

/// Release an exclusively-owned chain.
///
/// # Safety
///
/// `head` must be null or the head of a chain no other thread can reach.
unsafe fn free_chain(mut head: *mut Message) {
    while !head.is_null() {
        let next = (*head).next;
        drop(Box::from_raw(head));
        head = next;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use crate::transport::loopback::LoopbackFabric;

    use super::*;

    fn wait_until(cond: impl Fn() -> bool) {
        for _ in 0..1000 {
            if cond() {
                return;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        panic!("condition not reached within 1s");
    }

    /// Two-core harness: returns (fabric, sender, receiver, received log).
    fn pair(
        config: AggregatorConfig,
    ) -> (
        LoopbackFabric,
        Aggregator,
        Aggregator,
        Arc<StdMutex<Vec<Vec<u8>>>>,
    ) {
        let fabric = LoopbackFabric::new(2);
        let received = Arc::new(StdMutex::new(Vec::new()));
        let registry = Arc::new(DeserializerRegistry::new());
        let log = Arc::clone(&received);
        registry.register(1, move |payload| log.lock().unwrap().push(payload.to_vec()));

        let topo = Topology::single_node(2);
        let a = Aggregator::init(
            config.clone(),
            0,
            topo,
            Arc::new(fabric.endpoint(0).unwrap()),
            Arc::clone(&registry),
        )
        .unwrap();
        let b = Aggregator::init(config, 1, topo, Arc::new(fabric.endpoint(1).unwrap()), registry)
            .unwrap();
        (fabric, a, b, received)
    }

    fn msg(dest: Core, serialized_size: usize) -> Box<Message> {
        Message::new(dest, 1, vec![0xAB; serialized_size - wire::RECORD_HEADER_BYTES]).unwrap()
    }

    #[test]
    fn chain_length_matches_enqueue_count() {
        let (_fabric, a, _b, _received) = pair(AggregatorConfig::default());
        for _ in 0..7 {
            a.enqueue(msg(1, 100)).unwrap();
        }
        let word = a.inner.destinations[1].list.load();
        assert_eq!(list::count_of(word), 7);
        assert_eq!(unsafe { list::chain_len(list::head_of(word)) }, 7);
        a.flush(1).unwrap();
    }

    #[test]
    fn message_at_target_size_flushes_on_its_own_enqueue() {
        let config = AggregatorConfig {
            target_size: 100,
            medium_cutoff: 100,
            ..Default::default()
        };
        let (_fabric, a, _b, received) = pair(config);
        a.enqueue(msg(1, 100)).unwrap();

        let stats = a.stats();
        assert_eq!(stats.rdma_capacity_flushes, 1);
        wait_until(|| received.lock().unwrap().len() == 1);
        assert!(a.inner.destinations[1].list.is_empty());
    }

    #[test]
    fn oversized_message_is_rejected() {
        let (_fabric, a, _b, _received) = pair(AggregatorConfig::default());
        let err = a.enqueue(msg(1, 4097)).unwrap_err();
        assert!(matches!(err, SkeinError::Oversized { .. }));
        assert_eq!(a.stats().app_messages_enqueue, 0);
    }

    #[test]
    fn out_of_range_destination_is_rejected() {
        let (_fabric, a, _b, _received) = pair(AggregatorConfig::default());
        assert!(matches!(
            a.enqueue(msg(9, 100)),
            Err(SkeinError::BadDestination { .. })
        ));
    }

    #[test]
    fn empty_flush_is_a_noop() {
        let (_fabric, a, _b, _received) = pair(AggregatorConfig::default());
        assert!(!a.flush(1).unwrap());
        let stats = a.stats();
        assert_eq!(stats.total_flushes(), 0);
    }

    #[test]
    fn enqueue_after_shutdown_is_a_race() {
        let (_fabric, a, _b, _received) = pair(AggregatorConfig::default());
        a.shutdown().unwrap();
        assert!(matches!(a.enqueue(msg(1, 100)), Err(SkeinError::ShutdownRace)));
        assert!(matches!(a.send_immediate(msg(1, 100)), Err(SkeinError::ShutdownRace)));
    }

    #[test]
    fn single_producer_cas_ratio_is_one() {
        let (_fabric, a, _b, _received) = pair(AggregatorConfig::default());
        for _ in 0..20 {
            a.enqueue(msg(1, 50)).unwrap();
        }
        let stats = a.stats();
        assert_eq!(stats.app_messages_enqueue, 20);
        assert_eq!(stats.app_messages_enqueue_cas, 20);
        a.flush(1).unwrap();
    }

    /// Residual handling: a serializer capped at 300 bytes consumes two of
    /// five 104-byte records (100-byte payloads plus headers); requeueing
    /// the rest and flushing delivers all five, in order.
    #[test]
    fn capped_serializer_leaves_requeueable_residual() {
        let (_fabric, a, _b, received) = pair(AggregatorConfig::default());

        for i in 0..5u8 {
            let mut payload = vec![0u8; 100];
            payload[0] = i;
            a.enqueue(Message::new(1, 1, payload).unwrap()).unwrap();
        }

        let dest = &a.inner.destinations[1];
        let guard = dest.send_guard.lock();
        let mut ordered = unsafe { list::reverse_chain(list::head_of(dest.list.grab())) };
        let mut buf = vec![0u8; 300];
        let mut count = 0usize;
        let wrote = unsafe { wire::aggregate_to_buffer(&mut buf, &mut ordered, Some(&mut count)) };
        assert_eq!((wrote, count), (208, 2));
        drop(guard);

        // Hand-deliver the first chunk, then requeue and flush the rest.
        wire::deaggregate_buffer(&buf[..wrote], &a.inner.registry).unwrap();
        let residual_len = unsafe { list::chain_len(ordered) };
        assert_eq!(residual_len, 3);
        a.inner.requeue_residual(1, ordered, residual_len);
        a.flush(1).unwrap();

        wait_until(|| received.lock().unwrap().len() == 5);
        let received = received.lock().unwrap();
        for (i, payload) in received.iter().enumerate() {
            assert_eq!(payload[0], i as u8);
        }
    }

    #[test]
    fn requeued_residual_serializes_before_newer_messages() {
        let (_fabric, a, _b, received) = pair(AggregatorConfig::default());

        // Residual r0, r1 detached, then newer n2 enqueued before requeue.
        for i in 0..2u8 {
            let mut payload = vec![0u8; 60];
            payload[0] = i;
            a.enqueue(Message::new(1, 1, payload).unwrap()).unwrap();
        }
        let head = list::head_of(a.inner.destinations[1].list.grab());
        let ordered = unsafe { list::reverse_chain(head) };

        let mut payload = vec![0u8; 60];
        payload[0] = 2;
        a.enqueue(Message::new(1, 1, payload).unwrap()).unwrap();

        a.inner.requeue_residual(1, ordered, 2);
        a.flush(1).unwrap();

        wait_until(|| received.lock().unwrap().len() == 3);
        let received = received.lock().unwrap();
        assert_eq!(
            received.iter().map(|p| p[0]).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[test]
    fn immediate_send_skips_destination_state() {
        let (_fabric, a, _b, received) = pair(AggregatorConfig::default());
        a.send_immediate(msg(1, 64)).unwrap();

        wait_until(|| received.lock().unwrap().len() == 1);
        assert!(a.inner.destinations[1].list.is_empty());
        assert_eq!(a.stats().app_messages_immediate, 1);
        assert_eq!(a.stats().app_messages_enqueue, 0);
    }

    #[test]
    fn representative_follows_topology() {
        let fabric = LoopbackFabric::new(4);
        let registry = Arc::new(DeserializerRegistry::new());
        let topo = Topology {
            total_cores: 4,
            cores_per_node: 2,
        };
        let a = Aggregator::init(
            AggregatorConfig::default(),
            0,
            topo,
            Arc::new(fabric.endpoint(0).unwrap()),
            registry,
        )
        .unwrap();
        assert_eq!(a.representative_of(1), Some(0));
        assert_eq!(a.representative_of(2), Some(2));
        assert_eq!(a.representative_of(3), Some(2));
        assert_eq!(a.representative_of(9), None);
    }
}
