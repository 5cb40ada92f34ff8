//! In-process loopback fabric.
//!
//! Connects N cores inside one process for tests, demos, and single-node
//! jobs. Each core gets a dedicated dispatcher thread draining an ordered
//! queue of active messages, which reproduces the single-threaded
//! handler-execution guarantee of the real fabric. One-sided writes land in
//! a per-core registry of exposed buffers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};

use crate::error::{SkeinError, SkeinResult};
use crate::topology::Core;

use super::{AmHandler, HandlerId, ReceiveBufferInfo, RemoteBuffer, RemoteCell, Transport};

const DEFAULT_MTU: usize = 8 * 1024;

enum Envelope {
    Am {
        src: Core,
        handler: HandlerId,
        payload: Vec<u8>,
    },
    Stop,
}

struct Endpoint {
    handlers: RwLock<HashMap<HandlerId, AmHandler>>,
    /// Exposed landing buffers for one-sided writes, keyed by token.
    buffers: Mutex<HashMap<u64, Vec<u8>>>,
    next_token: AtomicU64,
    tx: Sender<Envelope>,
}

struct FabricShared {
    endpoints: Vec<Endpoint>,
    mtu: usize,
}

impl FabricShared {
    fn endpoint(&self, core: Core) -> SkeinResult<&Endpoint> {
        self.endpoints
            .get(core as usize)
            .ok_or(SkeinError::BadDestination {
                destination: core,
                total_cores: self.endpoints.len() as u32,
            })
    }
}

/// The in-process fabric. Dropping it stops every dispatcher thread.
pub struct LoopbackFabric {
    shared: Arc<FabricShared>,
    dispatchers: Vec<JoinHandle<()>>,
}

impl LoopbackFabric {
    /// Build a fabric of `total_cores` endpoints with the default MTU.
    pub fn new(total_cores: Core) -> Self {
        Self::with_mtu(total_cores, DEFAULT_MTU)
    }

    pub fn with_mtu(total_cores: Core, mtu: usize) -> Self {
        let mut endpoints = Vec::with_capacity(total_cores as usize);
        let mut rxs: Vec<Receiver<Envelope>> = Vec::with_capacity(total_cores as usize);
        for _ in 0..total_cores {
            let (tx, rx) = unbounded();
            endpoints.push(Endpoint {
                handlers: RwLock::new(HashMap::new()),
                buffers: Mutex::new(HashMap::new()),
                next_token: AtomicU64::new(1),
                tx,
            });
            rxs.push(rx);
        }

        let shared = Arc::new(FabricShared { endpoints, mtu });
        let dispatchers = rxs
            .into_iter()
            .enumerate()
            .map(|(core, rx)| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("skein-am-{}", core))
                    .spawn(move || dispatch_loop(core as Core, rx, shared))
                    .expect("failed to spawn AM dispatcher")
            })
            .collect();

        Self { shared, dispatchers }
    }

    /// The endpoint handle for `core`, to hand to that core's aggregator.
    pub fn endpoint(&self, core: Core) -> SkeinResult<LoopbackTransport> {
        self.shared.endpoint(core)?;
        Ok(LoopbackTransport {
            core,
            shared: Arc::clone(&self.shared),
        })
    }
}

impl Drop for LoopbackFabric {
    fn drop(&mut self) {
        for endpoint in &self.shared.endpoints {
            let _ = endpoint.tx.send(Envelope::Stop);
        }
        for handle in self.dispatchers.drain(..) {
            if let Err(panic) = handle.join() {
                // A dispatcher died mid-job (a registered handler panicked).
                // Re-raise on the owner so the failure is observable; if we
                // are already unwinding this escalates to an abort, which is
                // the right end state for a broken fabric.
                std::panic::resume_unwind(panic);
            }
        }
    }
}

fn dispatch_loop(core: Core, rx: Receiver<Envelope>, shared: Arc<FabricShared>) {
    while let Ok(envelope) = rx.recv() {
        match envelope {
            Envelope::Stop => break,
            Envelope::Am {
                src,
                handler,
                payload,
            } => {
                let endpoint = &shared.endpoints[core as usize];
                let handlers = endpoint.handlers.read();
                match handlers.get(&handler) {
                    Some(h) => h(src, &payload),
                    None => {
                        // A message with no handler is lost; the job is
                        // broken, but teardown races land here too.
                        log::error!(
                            "core {}: dropping AM {:#06x} from core {} ({} bytes): no handler",
                            core,
                            handler,
                            src,
                            payload.len()
                        );
                    }
                }
            }
        }
    }
}

/// One core's endpoint on the loopback fabric.
pub struct LoopbackTransport {
    core: Core,
    shared: Arc<FabricShared>,
}

impl LoopbackTransport {
    pub fn core(&self) -> Core {
        self.core
    }
}

impl Transport for LoopbackTransport {
    fn register_handler(&self, id: HandlerId, handler: AmHandler) -> SkeinResult<()> {
        let endpoint = self.shared.endpoint(self.core)?;
        endpoint.handlers.write().insert(id, handler);
        Ok(())
    }

    fn unregister_handler(&self, id: HandlerId) -> SkeinResult<()> {
        let endpoint = self.shared.endpoint(self.core)?;
        endpoint.handlers.write().remove(&id);
        Ok(())
    }

    fn send_medium(&self, dest: Core, handler: HandlerId, payload: &[u8]) -> SkeinResult<()> {
        if payload.len() > self.shared.mtu {
            return Err(SkeinError::Oversized {
                size: payload.len(),
                limit: self.shared.mtu,
                path: "medium active message",
            });
        }
        let endpoint = self.shared.endpoint(dest)?;
        endpoint
            .tx
            .send(Envelope::Am {
                src: self.core,
                handler,
                payload: payload.to_vec(),
            })
            .map_err(|_| SkeinError::transport(format!("core {} dispatcher is gone", dest)))
    }

    fn put(&self, dest: Core, buffer: RemoteBuffer, payload: &[u8]) -> SkeinResult<()> {
        let endpoint = self.shared.endpoint(dest)?;
        let mut buffers = endpoint.buffers.lock();
        let landing = buffers.get_mut(&buffer.0).ok_or_else(|| {
            SkeinError::transport(format!("put into unknown buffer {} on core {}", buffer.0, dest))
        })?;
        if payload.len() > landing.len() {
            return Err(SkeinError::transport(format!(
                "put of {} bytes overruns {}-byte buffer {}",
                payload.len(),
                landing.len(),
                buffer.0
            )));
        }
        landing[..payload.len()].copy_from_slice(payload);
        Ok(())
    }

    fn expose(&self, nbytes: usize) -> SkeinResult<ReceiveBufferInfo> {
        let endpoint = self.shared.endpoint(self.core)?;
        let token = endpoint.next_token.fetch_add(1, Ordering::Relaxed);
        endpoint.buffers.lock().insert(token, vec![0u8; nbytes]);
        Ok(ReceiveBufferInfo {
            buffer: RemoteBuffer(token),
            ack: RemoteCell(token),
        })
    }

    fn claim(&self, cell: RemoteCell) -> SkeinResult<Vec<u8>> {
        let endpoint = self.shared.endpoint(self.core)?;
        endpoint.buffers.lock().remove(&cell.0).ok_or_else(|| {
            SkeinError::transport(format!("claim of unknown buffer {} on core {}", cell.0, self.core))
        })
    }

    fn medium_mtu(&self) -> usize {
        self.shared.mtu
    }
}
