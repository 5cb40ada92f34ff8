//! Per-destination aggregation state.

use parking_lot::Mutex;

use crate::runtime::FullEmpty;
use crate::topology::Core;
use crate::transport::ReceiveBufferInfo;

use super::list::ListWord;
use super::prefetch::PrefetchRing;

/// Everything one peer core needs on the send side.
///
/// Cache-line aligned so neighboring destinations never share a line.
/// The whole table is allocated at init and lives until teardown.
#[repr(align(64))]
pub(crate) struct DestState {
    /// Packed count + head of the outstanding message list.
    pub list: ListWord,
    /// Running-size samples for O(1) aggregate estimation.
    pub ring: PrefetchRing,
    /// Lowest-numbered core on the peer's node.
    pub representative: Core,
    /// Rendezvous cell the peer's buffer reply lands in.
    pub rendezvous: FullEmpty<ReceiveBufferInfo>,
    /// Serializes in-flight sends to this peer: one rendezvous at a time,
    /// and grabs happen in send order.
    pub send_guard: Mutex<()>,
}

impl DestState {
    pub fn new(representative: Core, prefetch_distance: usize) -> Self {
        Self {
            list: ListWord::new(),
            ring: PrefetchRing::new(prefetch_distance),
            representative,
            rendezvous: FullEmpty::new(),
            send_guard: Mutex::new(()),
        }
    }
}
