//! Transport contract.
//!
//! The aggregator drives the network through two initiator primitives — a
//! medium active message with an inlined payload, and a one-sided remote
//! write into an exposed buffer — plus handler registration under stable
//! 16-bit identifiers. The underlying fabric is assumed reliable; a
//! transport error is fatal to the job and is never retried here.

pub mod loopback;

use serde::{Deserialize, Serialize};

use crate::error::SkeinResult;
use crate::topology::Core;

/// Stable active-message handler identifier.
pub type HandlerId = u16;

/// Walk a full aggregated buffer, dispatching every record.
pub const AM_DESERIALIZE_BUFFER: HandlerId = 0x0010;
/// Fast path for a buffer holding exactly one record.
pub const AM_DESERIALIZE_FIRST: HandlerId = 0x0011;
/// Rendezvous: sender announces it wants a receive buffer of N bytes.
pub const AM_BUFFER_REQUEST: HandlerId = 0x0012;
/// Rendezvous: receiver publishes the allocated buffer back to the sender.
pub const AM_BUFFER_REPLY: HandlerId = 0x0013;
/// Sender signals the payload landed; receiver walks and frees the buffer.
pub const AM_BUFFER_ACK: HandlerId = 0x0014;

/// Handle to a buffer exposed for one-sided writes on a remote core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteBuffer(pub u64);

/// Handle to the rendezvous ack cell paired with an exposed buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteCell(pub u64);

/// Published by the receiver once it has allocated a landing buffer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ReceiveBufferInfo {
    pub buffer: RemoteBuffer,
    pub ack: RemoteCell,
}

/// Sent to the ack cell once the payload is in place.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SendBufferInfo {
    pub ack: RemoteCell,
    pub offset: u32,
    pub actual_size: u32,
}

/// Rendezvous request frame: "core `from` wants to land `nbytes` here".
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub(crate) struct BufferRequest {
    pub from: Core,
    pub nbytes: u64,
}

/// Rendezvous reply frame carrying the allocated buffer handles.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub(crate) struct BufferReply {
    pub info: ReceiveBufferInfo,
}

/// Active-message handler. Runs on the destination core's dispatch context
/// with the source core and the inlined payload; must not block.
pub type AmHandler = Box<dyn Fn(Core, &[u8]) + Send + Sync>;

/// One core's endpoint on the fabric.
pub trait Transport: Send + Sync {
    /// Register `handler` under `id`. Handlers survive until the endpoint
    /// is torn down; registering twice replaces.
    fn register_handler(&self, id: HandlerId, handler: AmHandler) -> SkeinResult<()>;

    /// Remove a handler registration.
    fn unregister_handler(&self, id: HandlerId) -> SkeinResult<()>;

    /// Send a medium active message with an inlined payload. Payloads are
    /// limited to [`Transport::medium_mtu`] bytes. Never blocks.
    fn send_medium(&self, dest: Core, handler: HandlerId, payload: &[u8]) -> SkeinResult<()>;

    /// One-sided remote write of `payload` into an exposed buffer on
    /// `dest`, complete on return.
    fn put(&self, dest: Core, buffer: RemoteBuffer, payload: &[u8]) -> SkeinResult<()>;

    /// Expose a local landing buffer of `nbytes` for remote writes.
    fn expose(&self, nbytes: usize) -> SkeinResult<ReceiveBufferInfo>;

    /// Reclaim an exposed buffer, returning its contents. The handle is
    /// dead afterwards.
    fn claim(&self, cell: RemoteCell) -> SkeinResult<Vec<u8>>;

    /// Largest payload `send_medium` accepts.
    fn medium_mtu(&self) -> usize;
}
