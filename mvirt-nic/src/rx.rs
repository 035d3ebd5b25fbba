//! Receive engine
//!
//! Owned by the poll callback of its queue pair, so nothing in here locks.
//! Each posted buffer is a pool page stored in the slot named by its
//! request id. Completions reference those ids; a packet may span several
//! of them and is only acted on once the device marks the last one.
//!
//! After a packet is handled its ids go back to the free pool. Pages that
//! were not handed upward (drops, short copies, corrupt packets) stay in
//! their slot and are posted again by the next refill without touching
//! the allocator.

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::buffer::{MAX_SGL, PagePool, RxPage};
use crate::error::{AllocError, ProtocolViolation};
use crate::filter::{self, FastPath, FilterProgram, FilterSlot};
use crate::flags::{DeviceFlags, ResetReason};
use crate::hw::{HostStack, HwQueueId, RxCompletion, RxQueueHw};
use crate::packet::{InboundPacket, RxBody, RxChecksum, RxFrag, RxMeta};
use crate::queue::QueuePair;
use crate::ring::{Cursor, DescriptorRing, RingError};
use crate::stats::{QueueCounter, QueueStats};

#[derive(Debug, Clone, Copy)]
pub struct RxParams {
    pub headroom: usize,
    pub copybreak: usize,
    pub max_segments: usize,
    /// Refill once more than this many slots are empty.
    pub refill_threshold: u16,
    pub max_offset_shift: u16,
    /// Interface MTU. Copybreak never exceeds it.
    pub mtu: u32,
}

/// Work done by one `poll` call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RxPoll {
    /// Packets delivered to the host.
    pub packets: u32,
    pub bytes: u64,
    /// Packets consumed from the ring, including drops and forwards.
    pub processed: u32,
}

/// Progress of the packet being assembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reassembly {
    /// More descriptors belong to this packet.
    Incomplete,
    /// All descriptors of a packet arrived.
    Complete { descs: usize, meta: RxMeta },
    /// Packet is unusable; its buffers are recycled.
    Dropped { descs: usize },
}

#[derive(Debug, Clone, Copy, Default)]
struct PendingDesc {
    req_id: u16,
    len: u32,
    pkt_offset: u16,
}

pub struct RxEngine {
    qid: u16,
    params: RxParams,
    ring: DescriptorRing,
    slots: Box<[Option<RxPage>]>,
    hw: Box<dyn RxQueueHw>,
    pool: PagePool,
    pending: [PendingDesc; MAX_SGL],
    pending_len: usize,
    pending_corrupt: bool,
    flags: Arc<DeviceFlags>,
    stats: Arc<QueueStats>,
    filter: Arc<FilterSlot>,
}

impl RxEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        qid: u16,
        size: u16,
        hw: Box<dyn RxQueueHw>,
        params: RxParams,
        pool: PagePool,
        flags: Arc<DeviceFlags>,
        stats: Arc<QueueStats>,
        filter: Arc<FilterSlot>,
    ) -> Result<Self, RingError> {
        let ring = DescriptorRing::new(size)?;
        let slots = (0..size).map(|_| None).collect();
        Ok(Self {
            qid,
            params: RxParams {
                max_segments: params.max_segments.min(MAX_SGL),
                ..params
            },
            ring,
            slots,
            hw,
            pool,
            pending: [PendingDesc::default(); MAX_SGL],
            pending_len: 0,
            pending_corrupt: false,
            flags,
            stats,
            filter,
        })
    }

    #[inline]
    pub fn qid(&self) -> u16 {
        self.qid
    }

    pub fn hw_id(&self) -> HwQueueId {
        self.hw.id()
    }

    /// Frames up to this length are copied out of their page.
    #[inline]
    pub fn copybreak(&self) -> usize {
        self.params.copybreak.min(self.params.mtu as usize)
    }

    pub fn set_mtu(&mut self, mtu: u32) {
        debug!(qid = self.qid, mtu, "Rx ring MTU updated");
        self.params.mtu = mtu;
    }

    /// Buffers currently owned by the device.
    #[inline]
    pub fn posted(&self) -> u16 {
        self.ring.outstanding()
    }

    /// Slots that can take a new buffer.
    #[inline]
    pub fn refillable(&self) -> u16 {
        self.ring.capacity() - self.ring.ids_in_flight() as u16
    }

    #[inline]
    pub fn capacity(&self) -> u16 {
        self.ring.capacity()
    }

    /// The device reported completions that have not been polled.
    #[inline]
    pub fn has_pending(&self) -> bool {
        self.hw.has_pending()
    }

    /// Post up to `n` buffers. Returns how many were posted.
    ///
    /// Stops at the first allocation or posting failure; the rest is
    /// retried by a later refill.
    pub fn refill(&mut self, n: u16) -> u16 {
        let mut filled = 0;
        while filled < n {
            let Some(req_id) = self.ring.peek_id() else {
                break;
            };
            let slot = &mut self.slots[req_id as usize];

            if slot.is_none() {
                match self.pool.allocate(self.params.headroom) {
                    Ok(page) => *slot = Some(page),
                    Err(AllocError::Exhausted) => {
                        self.stats.inc(QueueCounter::RxPageAllocFail);
                        break;
                    }
                    Err(AllocError::Dma(_)) => {
                        self.stats.inc(QueueCounter::RxDmaMappingErr);
                        break;
                    }
                }
            }

            let Some((addr, len)) = slot
                .as_ref()
                .and_then(|page| page.dma_addr().map(|a| (a, page.buffer_len() as u32)))
            else {
                // Page lost its mapping; give it back and allocate fresh.
                *slot = None;
                continue;
            };

            if let Err(e) = self.hw.post(req_id, addr, len) {
                warn!(qid = self.qid, req_id, error = %e, "Failed to post rx buffer");
                break;
            }

            // Peeked id is the one acquired.
            let _ = self.ring.acquire_id();
            if self.ring.advance(Cursor::Produce, 1).is_err() {
                error!(qid = self.qid, "Rx ring accounting diverged");
                self.flags.request_reset(ResetReason::DriverInvalidState);
                break;
            }
            filled += 1;
        }

        if filled < n {
            self.stats.inc(QueueCounter::RxRefillPartial);
            debug!(qid = self.qid, requested = n, filled, "Partial rx refill");
        }
        if filled > 0 {
            self.hw.doorbell();
        }
        filled
    }

    /// Receive up to `budget` packets.
    ///
    /// Packets that are still incomplete when the device runs out of
    /// completions are carried over to the next call.
    pub fn poll(
        &mut self,
        budget: u32,
        host: &dyn HostStack,
        redirect: &[Arc<QueuePair>],
    ) -> Result<RxPoll, ProtocolViolation> {
        let mut done = RxPoll::default();
        let program = self.filter.current();

        let mut processed = 0;
        while processed < budget {
            let Some(completion) = self.hw.poll_completion() else {
                break;
            };
            match self.reassemble(completion) {
                Ok(Reassembly::Incomplete) => continue,
                Ok(Reassembly::Dropped { descs }) => {
                    self.recycle(descs);
                    processed += 1;
                }
                Ok(Reassembly::Complete { descs, meta }) => {
                    let handled =
                        self.handle_packet(descs, meta, program.as_deref(), host, redirect);
                    if let Some(bytes) = handled {
                        done.packets += 1;
                        done.bytes += bytes as u64;
                    }
                    processed += 1;
                }
                Err(violation) => {
                    let reason = match violation {
                        ProtocolViolation::TooManyRxDescs { .. } => ResetReason::TooManyRxDescs,
                        ProtocolViolation::ImpossibleRxLength { .. } => {
                            ResetReason::DriverInvalidState
                        }
                        _ => ResetReason::InvalidRxReqId,
                    };
                    error!(qid = self.qid, %violation, "Rx protocol violation");
                    self.flags.request_reset(reason);
                    return Err(violation);
                }
            }
        }

        done.processed = processed;

        let empty = self.refillable();
        if empty > self.params.refill_threshold {
            self.refill(empty);
        }
        Ok(done)
    }

    /// Account one completion against the packet being assembled.
    pub fn reassemble(&mut self, completion: RxCompletion) -> Result<Reassembly, ProtocolViolation> {
        let (req_id, len, pkt_offset, last, meta) = match completion {
            RxCompletion::EndOfPacket { meta } => {
                if self.pending_len == 0 {
                    // Device reported work but no descriptors.
                    self.stats.inc(QueueCounter::RxCorrupt);
                    return Ok(Reassembly::Dropped { descs: 0 });
                }
                return Ok(self.finish(meta));
            }
            RxCompletion::Buffer {
                req_id,
                len,
                pkt_offset,
                last,
                meta,
            } => (req_id, len, pkt_offset, last, meta),
        };

        let qid = self.qid;
        let duplicate = self.pending[..self.pending_len]
            .iter()
            .any(|d| d.req_id == req_id);
        let live = self.ring.is_in_flight(req_id)
            && self
                .slots
                .get(req_id as usize)
                .is_some_and(Option::is_some);
        if !live || duplicate {
            self.stats.inc(QueueCounter::RxBadReqId);
            return Err(ProtocolViolation::InvalidRxReqId { qid, req_id });
        }

        if self.pending_len >= self.params.max_segments {
            self.stats.inc(QueueCounter::RxBadDescNum);
            return Err(ProtocolViolation::TooManyRxDescs {
                qid,
                max: self.params.max_segments,
            });
        }

        let page_size = self.pool.page_size();
        if len as usize > page_size {
            return Err(ProtocolViolation::ImpossibleRxLength {
                qid,
                len,
                size: page_size,
            });
        }

        if self.ring.advance(Cursor::Consume, 1).is_err() {
            self.stats.inc(QueueCounter::RxBadReqId);
            return Err(ProtocolViolation::InvalidRxReqId { qid, req_id });
        }

        let first = self.pending_len == 0;
        let shift = if first { pkt_offset } else { 0 };
        let room = page_size - self.params.headroom;
        if shift > self.params.max_offset_shift || len as usize + shift as usize > room {
            self.pending_corrupt = true;
        }

        self.pending[self.pending_len] = PendingDesc {
            req_id,
            len,
            pkt_offset: shift,
        };
        self.pending_len += 1;

        if last {
            Ok(self.finish(meta))
        } else {
            Ok(Reassembly::Incomplete)
        }
    }

    fn finish(&mut self, meta: RxMeta) -> Reassembly {
        let descs = self.pending_len;
        if std::mem::take(&mut self.pending_corrupt) {
            self.stats.inc(QueueCounter::RxCorrupt);
            warn!(qid = self.qid, descs, "Dropping corrupt rx packet");
            return Reassembly::Dropped { descs };
        }
        Reassembly::Complete { descs, meta }
    }

    /// Return the ids of the pending packet, leaving pages in their slots.
    fn recycle(&mut self, descs: usize) {
        for d in &self.pending[..descs] {
            let _ = self.ring.release_id(d.req_id);
        }
        self.pending_len = 0;
    }

    fn handle_packet(
        &mut self,
        descs: usize,
        meta: RxMeta,
        program: Option<&FilterProgram>,
        host: &dyn HostStack,
        redirect: &[Arc<QueuePair>],
    ) -> Option<usize> {
        let pending = self.pending;
        let first = pending[0];
        let mut offset = self.params.headroom + first.pkt_offset as usize;
        let mut len = first.len as usize;

        if let Some(program) = program {
            if descs > 1 {
                // Filter programs only see single-buffer frames.
                self.stats.inc(QueueCounter::FilterDrop);
                self.recycle(descs);
                return None;
            }
            let slot = &mut self.slots[first.req_id as usize];
            match filter::execute(program, self.qid, slot, offset, len, redirect, &self.stats) {
                FastPath::Consumed => {
                    self.recycle(descs);
                    return None;
                }
                FastPath::Pass { offset: o, len: l } => {
                    offset = o;
                    len = l;
                }
            }
        }

        if meta.checksum == RxChecksum::Bad {
            self.stats.inc(QueueCounter::RxCsumBad);
        }

        let body = if descs == 1 && len <= self.copybreak() {
            let Some(page) = self.slots[first.req_id as usize].as_ref() else {
                self.recycle(descs);
                return None;
            };
            self.stats.inc(QueueCounter::RxCopybreak);
            RxBody::Copied(page.as_slice()[offset..offset + len].to_vec())
        } else {
            let mut frags = Vec::with_capacity(descs);
            for (i, d) in pending[..descs].iter().enumerate() {
                let Some(mut page) = self.slots[d.req_id as usize].take() else {
                    continue;
                };
                page.unmap();
                let (o, l) = if i == 0 {
                    (offset, len)
                } else {
                    (self.params.headroom, d.len as usize)
                };
                frags.push(RxFrag::new(page, o, l));
            }
            RxBody::Pages(frags)
        };
        self.recycle(descs);

        let packet = InboundPacket {
            qid: self.qid,
            body,
            meta,
        };
        let bytes = packet.len();
        self.stats.inc(QueueCounter::RxPackets);
        self.stats.add(QueueCounter::RxBytes, bytes as u64);
        host.deliver(packet);
        Some(bytes)
    }

    /// Release every buffer without waiting for the device.
    pub fn flush(&mut self) -> usize {
        let mut released = 0;
        for slot in self.slots.iter_mut() {
            if slot.take().is_some() {
                released += 1;
            }
        }
        self.pending_len = 0;
        self.pending_corrupt = false;
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::IdentityMapper;
    use crate::filter::Verdict;
    use crate::flags::{ADMIN_UP, DEVICE_RUNNING, RESET_REQUESTED};
    use crate::test_util::{RecordingHost, SimRx};

    struct Fixture {
        engine: RxEngine,
        hw: SimRx,
        pool: PagePool,
        mapper: Arc<IdentityMapper>,
        flags: Arc<DeviceFlags>,
        stats: Arc<QueueStats>,
        filter: Arc<FilterSlot>,
        host: RecordingHost,
    }

    fn fixture(size: u16, pages: usize) -> Fixture {
        let hw = SimRx::new(2, size);
        let mapper = Arc::new(IdentityMapper::new());
        let pool = PagePool::new(pages, 4096, mapper.clone()).unwrap();
        let flags = Arc::new(DeviceFlags::new());
        flags.set(DEVICE_RUNNING | ADMIN_UP);
        let stats = Arc::new(QueueStats::new());
        let filter = Arc::new(FilterSlot::new());
        let engine = RxEngine::new(
            0,
            size,
            hw.queue(),
            RxParams {
                headroom: 256,
                copybreak: 256,
                max_segments: 4,
                refill_threshold: 2,
                max_offset_shift: 64,
                mtu: 1500,
            },
            pool.clone(),
            flags.clone(),
            stats.clone(),
            filter.clone(),
        )
        .unwrap();
        Fixture {
            engine,
            hw,
            pool,
            mapper,
            flags,
            stats,
            filter,
            host: RecordingHost::new(),
        }
    }

    fn frame(len: usize) -> Vec<u8> {
        (0..len).map(|i| i as u8).collect()
    }

    #[test]
    fn test_refill_posts_buffers() {
        let mut f = fixture(8, 16);
        assert_eq!(f.engine.refill(8), 8);
        assert_eq!(f.engine.posted(), 8);
        assert_eq!(f.hw.posted(), 8);
        assert_eq!(f.hw.doorbells(), 1);
        assert_eq!(f.mapper.live_mappings(), 8);
    }

    #[test]
    fn test_refill_partial_on_exhaustion() {
        let mut f = fixture(8, 5);
        assert_eq!(f.engine.refill(8), 5);
        assert_eq!(f.engine.posted(), 5);
        assert_eq!(f.stats.get(QueueCounter::RxRefillPartial), 1);
        assert_eq!(f.stats.get(QueueCounter::RxPageAllocFail), 1);
    }

    #[test]
    fn test_large_packet_handed_upward() {
        let mut f = fixture(8, 16);
        f.engine.refill(8);
        let data = frame(1000);
        assert!(f.hw.receive(&data));
        let polled = f.engine.poll(64, &f.host, &[]).unwrap();
        assert_eq!(polled.packets, 1);
        let packets = f.host.take();
        assert_eq!(packets.len(), 1);
        assert!(!packets[0].is_copied());
        assert_eq!(packets[0].to_vec(), data);
        // page left the ring unmapped and is held by the packet
        assert_eq!(f.mapper.live_mappings(), 7);
        assert_eq!(f.pool.available(), 8);
        drop(packets);
        assert_eq!(f.pool.available(), 9);
    }

    #[test]
    fn test_short_packet_copied_and_page_recycled() {
        let mut f = fixture(8, 16);
        f.engine.refill(8);
        let allocations = f.pool.allocations();
        f.hw.receive(&frame(60));
        f.engine.poll(64, &f.host, &[]).unwrap();
        let packets = f.host.take();
        assert!(packets[0].is_copied());
        assert_eq!(packets[0].len(), 60);
        assert_eq!(f.stats.get(QueueCounter::RxCopybreak), 1);
        assert_eq!(f.pool.allocations(), allocations);
        assert_eq!(f.pool.available(), 8);
    }

    #[test]
    fn test_multi_descriptor_packet() {
        let mut f = fixture(8, 16);
        f.engine.refill(8);
        let data = frame(3840 * 2 + 100);
        assert!(f.hw.receive(&data));
        f.engine.poll(64, &f.host, &[]).unwrap();
        let packets = f.host.take();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].to_vec(), data);
    }

    #[test]
    fn test_packet_split_across_polls() {
        let mut f = fixture(8, 16);
        f.engine.refill(8);
        let data = frame(3840 + 500);
        f.hw.receive(&data);
        // first descriptor only
        let comps = f.hw.take_completions();
        f.hw.inject(comps[0]);
        assert_eq!(f.engine.poll(64, &f.host, &[]).unwrap().packets, 0);
        f.hw.inject(comps[1]);
        assert_eq!(f.engine.poll(64, &f.host, &[]).unwrap().packets, 1);
        assert_eq!(f.host.take()[0].to_vec(), data);
    }

    #[test]
    fn test_overlong_segment_is_packet_local() {
        let mut f = fixture(8, 16);
        f.engine.refill(8);
        f.hw.inject(RxCompletion::Buffer {
            req_id: 7,
            len: 3900,
            pkt_offset: 0,
            last: true,
            meta: RxMeta::default(),
        });
        f.hw.receive(&frame(100));
        let polled = f.engine.poll(64, &f.host, &[]).unwrap();
        assert_eq!(polled.packets, 1);
        assert_eq!(f.stats.get(QueueCounter::RxCorrupt), 1);
        assert!(!f.flags.test(RESET_REQUESTED));
    }

    #[test]
    fn test_offset_beyond_limit_is_corrupt() {
        let mut f = fixture(8, 16);
        f.engine.refill(8);
        f.hw.inject(RxCompletion::Buffer {
            req_id: 0,
            len: 100,
            pkt_offset: 65,
            last: true,
            meta: RxMeta::default(),
        });
        f.engine.poll(64, &f.host, &[]).unwrap();
        assert_eq!(f.stats.get(QueueCounter::RxCorrupt), 1);
        assert!(f.host.take().is_empty());
    }

    #[test]
    fn test_offset_within_limit_shifts_data() {
        let mut f = fixture(8, 16);
        f.engine.refill(8);
        let data = frame(600);
        assert!(f.hw.receive_at(&data, 32));
        f.engine.poll(64, &f.host, &[]).unwrap();
        assert_eq!(f.host.take()[0].to_vec(), data);
    }

    #[test]
    fn test_empty_packet_is_dropped() {
        let mut f = fixture(8, 16);
        f.engine.refill(8);
        f.hw.inject(RxCompletion::EndOfPacket {
            meta: RxMeta::default(),
        });
        f.engine.poll(64, &f.host, &[]).unwrap();
        assert_eq!(f.stats.get(QueueCounter::RxCorrupt), 1);
    }

    #[test]
    fn test_unposted_id_is_violation() {
        let mut f = fixture(8, 16);
        f.engine.refill(4);
        f.hw.inject(RxCompletion::Buffer {
            req_id: 6,
            len: 64,
            pkt_offset: 0,
            last: true,
            meta: RxMeta::default(),
        });
        let err = f.engine.poll(64, &f.host, &[]).unwrap_err();
        assert_eq!(err, ProtocolViolation::InvalidRxReqId { qid: 0, req_id: 6 });
        assert_eq!(f.flags.reset_reason(), Some(ResetReason::InvalidRxReqId));
    }

    #[test]
    fn test_too_many_descriptors_is_violation() {
        let mut f = fixture(8, 16);
        f.engine.refill(8);
        for req_id in 0..5 {
            f.hw.inject(RxCompletion::Buffer {
                req_id,
                len: 100,
                pkt_offset: 0,
                last: false,
                meta: RxMeta::default(),
            });
        }
        let err = f.engine.poll(64, &f.host, &[]).unwrap_err();
        assert!(matches!(err, ProtocolViolation::TooManyRxDescs { max: 4, .. }));
        assert_eq!(f.flags.reset_reason(), Some(ResetReason::TooManyRxDescs));
    }

    #[test]
    fn test_filter_drop_recycles_without_allocation() {
        let mut f = fixture(8, 16);
        f.engine.refill(8);
        f.filter
            .install(Some(FilterProgram::new("drop", |_| Verdict::Drop)));
        let allocations = f.pool.allocations();
        for _ in 0..20 {
            f.hw.receive(&frame(1200));
            f.engine.poll(64, &f.host, &[]).unwrap();
        }
        assert!(f.host.take().is_empty());
        assert_eq!(f.stats.get(QueueCounter::FilterDrop), 20);
        assert_eq!(f.pool.allocations(), allocations);
        assert_eq!(f.mapper.live_mappings(), 8);
    }

    #[test]
    fn test_filter_pass_with_adjusted_head() {
        let mut f = fixture(8, 16);
        f.engine.refill(8);
        f.filter.install(Some(FilterProgram::new("strip", |view| {
            view.adjust_head(14);
            Verdict::Pass
        })));
        let data = frame(800);
        f.hw.receive(&data);
        f.engine.poll(64, &f.host, &[]).unwrap();
        assert_eq!(f.host.take()[0].to_vec(), &data[14..]);
        assert_eq!(f.stats.get(QueueCounter::FilterPass), 1);
    }

    #[test]
    fn test_filter_redirect_to_missing_queue_aborts() {
        let mut f = fixture(8, 16);
        f.engine.refill(8);
        f.filter.install(Some(FilterProgram::new("tx", |_| Verdict::Transmit)));
        f.hw.receive(&frame(500));
        f.engine.poll(64, &f.host, &[]).unwrap();
        assert_eq!(f.stats.get(QueueCounter::FilterAborted), 1);
        assert_eq!(f.mapper.live_mappings(), 8);
        assert_eq!(f.pool.allocations(), 8);
    }

    #[test]
    fn test_flush_returns_pages() {
        let mut f = fixture(8, 16);
        f.engine.refill(8);
        assert_eq!(f.engine.flush(), 8);
        assert_eq!(f.pool.available(), 16);
        assert_eq!(f.mapper.live_mappings(), 0);
    }
}
