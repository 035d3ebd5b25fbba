//! Device-facing and host-facing seams
//!
//! The engine never touches registers itself. The admin channel, the
//! per-queue submission/completion interfaces and the host stack are
//! traits so the same engine runs against real hardware or against the
//! simulated device in `test_util`.

use std::fmt;

use crate::buffer::{DmaAddr, MappedSegment};
use crate::error::{AdminError, HwError};
use crate::flags::ResetReason;
use crate::packet::{InboundPacket, OffloadHints, RxMeta};

/// Device-assigned queue handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HwQueueId(pub u32);

impl fmt::Display for HwQueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hwq-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Tx,
    Rx,
}

/// What the device reports about itself after init.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    pub max_queues: u16,
    pub max_segments_per_packet: u16,
    /// Bytes of packet header the device wants inline in the descriptor.
    /// Zero when the device reads headers from host memory.
    pub header_push_size: u16,
    pub supports_offloads: bool,
    /// Descriptors the device accepts between doorbells, if limited.
    pub max_tx_burst: Option<u16>,
    pub max_mtu: u32,
}

/// One transmit request as written to the submission queue.
#[derive(Debug)]
pub struct TxDescriptor<'a> {
    pub req_id: u16,
    /// Header bytes pushed inline (empty if the device does not want any).
    pub header: &'a [u8],
    /// Remaining data, mapped for device reads.
    pub segments: &'a [MappedSegment],
    pub total_len: u32,
    pub offload: OffloadHints,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxCompletion {
    pub req_id: u16,
}

/// One receive completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxCompletion {
    /// Data landed in the buffer posted with `req_id`.
    Buffer {
        req_id: u16,
        len: u32,
        /// Extra shift of the data start, only meaningful on the first
        /// descriptor of a packet.
        pkt_offset: u16,
        last: bool,
        meta: RxMeta,
    },
    /// Packet boundary carrying no buffer.
    EndOfPacket { meta: RxMeta },
}

/// Transmit submission and completion queue pair.
pub trait TxQueueHw: Send {
    fn id(&self) -> HwQueueId;

    /// Write the descriptors for one request.
    ///
    /// Returns the number of hardware descriptors consumed.
    fn write(&mut self, desc: &TxDescriptor<'_>) -> Result<u16, HwError>;

    fn doorbell(&mut self);

    fn poll_completion(&mut self) -> Option<TxCompletion>;

    /// Acknowledge `descriptors` processed hardware descriptors.
    fn ack(&mut self, descriptors: u32);

    /// Re-enable the queue pair's interrupt with the given delays.
    fn unmask_interrupt(&mut self, rx_usecs: u32, tx_usecs: u32);
}

/// Receive submission and completion queue pair.
pub trait RxQueueHw: Send {
    fn id(&self) -> HwQueueId;

    fn post(&mut self, req_id: u16, addr: DmaAddr, len: u32) -> Result<(), HwError>;

    fn doorbell(&mut self);

    fn poll_completion(&mut self) -> Option<RxCompletion>;

    /// Completions are waiting that have not been polled.
    fn has_pending(&self) -> bool;
}

pub enum HwQueue {
    Tx(Box<dyn TxQueueHw>),
    Rx(Box<dyn RxQueueHw>),
}

impl HwQueue {
    pub fn id(&self) -> HwQueueId {
        match self {
            HwQueue::Tx(q) => q.id(),
            HwQueue::Rx(q) => q.id(),
        }
    }
}

/// Device management channel.
pub trait AdminChannel: Send + Sync {
    fn init(&self) -> Result<(), AdminError>;

    fn read_capabilities(&self) -> Result<Capabilities, AdminError>;

    fn create_queue(
        &self,
        direction: Direction,
        size: u16,
        numa_hint: Option<u32>,
    ) -> Result<HwQueue, AdminError>;

    fn destroy_queue(&self, id: HwQueueId);

    fn set_mtu(&self, mtu: u32) -> Result<(), AdminError>;

    fn is_running(&self) -> bool;

    /// Tell the device to reset itself.
    fn reset(&self, reason: ResetReason);

    fn shutdown(&self);
}

/// Upper layer that consumes received packets and completion events.
pub trait HostStack: Send + Sync {
    fn deliver(&self, packet: InboundPacket);

    /// Transmit completions reaped on `qid`.
    fn completed(&self, _qid: u16, _packets: u64, _bytes: u64) {}

    /// A stopped transmit queue has room again.
    fn tx_wake(&self, _qid: u16) {}

    /// The engine wants `qid` polled even though no interrupt fired.
    fn schedule_poll(&self, _qid: u16) {}
}
