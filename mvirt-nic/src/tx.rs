//! Transmit engine
//!
//! One `TxEngine` per hardware TX queue. Submission may come from any
//! thread, so the ring, its request ids and the doorbell batching state
//! live behind one mutex. The `stopped` flag is read lock-free by the host
//! to decide whether to keep handing packets down.
//!
//! Slot lifecycle:
//! 1. `submit` maps the packet, takes a request id and writes descriptors
//! 2. The device completes the request id, in any order
//! 3. `reap` validates the id, unmaps, releases the id and drops the packet

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering, fence};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use crate::buffer::{DmaMapper, SegmentList};
use crate::error::{DmaError, HwError, ProtocolViolation, TxError};
use crate::flags::{ADMIN_UP, DeviceFlags, FAILED, ResetReason};
use crate::hw::{HwQueueId, TxDescriptor, TxQueueHw};
use crate::packet::{Frame, OffloadHints, OutboundPacket};
use crate::ring::{Cursor, DescriptorRing, RingError};
use crate::stats::{QueueCounter, QueueStats};

/// Largest inline header a device may ask for.
pub const MAX_HEADER_PUSH: usize = 256;

/// Limits negotiated with the device.
#[derive(Debug, Clone, Copy)]
pub struct TxParams {
    pub max_segments: usize,
    pub header_push: usize,
    pub burst_limit: Option<u16>,
}

impl TxParams {
    /// Free slots below which the queue stops, and at which it wakes.
    #[inline]
    pub fn wake_threshold(&self) -> u16 {
        self.max_segments as u16 + 2
    }
}

/// Result of a submission that did not fail.
#[derive(Debug)]
pub enum TxOutcome {
    /// Packet is on the ring. `stopped` tells the host to pause this queue
    /// until it is woken.
    Queued { stopped: bool },
    /// Ring is full or the device is not accepting traffic. The packet is
    /// handed back untouched.
    Busy(OutboundPacket),
}

/// Completions processed by one `reap` call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Reaped {
    pub packets: u32,
    pub bytes: u64,
    /// The queue went from stopped to running.
    pub woke: bool,
}

/// Requests outstanding longer than the timeout.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MissingScan {
    pub missed: u32,
    /// A request outlived the stall limit although interrupts fired after
    /// it was submitted.
    pub stalled: bool,
    /// A request outlived the stall limit and the queue never saw an
    /// interrupt.
    pub no_interrupt: bool,
}

/// Anything that can occupy a TX slot.
trait Payload: Sized {
    fn len(&self) -> usize;
    /// Segments left to map once the first `skip` bytes are pushed inline.
    fn mapped_segments(&self, skip: usize) -> usize;
    fn offload(&self) -> OffloadHints;
    fn copy_prefix(&self, out: &mut [u8]) -> usize;
    fn map(&self, mapper: &dyn DmaMapper, skip: usize) -> Result<SegmentList, DmaError>;
    fn into_slot(self) -> SlotPayload;
}

impl Payload for OutboundPacket {
    fn len(&self) -> usize {
        OutboundPacket::len(self)
    }

    fn mapped_segments(&self, skip: usize) -> usize {
        skip_prefix(self.segments(), skip)
            .filter(|s| !s.is_empty())
            .count()
    }

    fn offload(&self) -> OffloadHints {
        self.offload
    }

    fn copy_prefix(&self, out: &mut [u8]) -> usize {
        OutboundPacket::copy_prefix(self, out)
    }

    fn map(&self, mapper: &dyn DmaMapper, skip: usize) -> Result<SegmentList, DmaError> {
        SegmentList::map(mapper, skip_prefix(self.segments(), skip))
    }

    fn into_slot(self) -> SlotPayload {
        SlotPayload::Packet(self)
    }
}

impl Payload for Frame {
    fn len(&self) -> usize {
        Frame::len(self)
    }

    fn mapped_segments(&self, skip: usize) -> usize {
        usize::from(skip < self.len())
    }

    fn offload(&self) -> OffloadHints {
        OffloadHints::default()
    }

    fn copy_prefix(&self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.len());
        out[..n].copy_from_slice(&self.data()[..n]);
        n
    }

    fn map(&self, mapper: &dyn DmaMapper, skip: usize) -> Result<SegmentList, DmaError> {
        SegmentList::map(mapper, skip_prefix(std::iter::once(self.data()), skip))
    }

    fn into_slot(self) -> SlotPayload {
        SlotPayload::Frame(self)
    }
}

/// Drop the first `skip` bytes of a slice sequence, across slice borders.
fn skip_prefix<'a>(
    slices: impl Iterator<Item = &'a [u8]>,
    mut skip: usize,
) -> impl Iterator<Item = &'a [u8]> {
    slices.map(move |s| {
        let n = skip.min(s.len());
        skip -= n;
        &s[n..]
    })
}

#[allow(dead_code)]
enum SlotPayload {
    Packet(OutboundPacket),
    Frame(Frame),
}

struct TxSlot {
    /// Held until completion so the mapped memory stays valid.
    _payload: SlotPayload,
    segs: SegmentList,
    hw_descs: u16,
    bytes: u32,
    submitted_at: Instant,
    /// Queue interrupt count at submission.
    irq_mark: u64,
    reported_missing: bool,
}

enum Enqueued<P> {
    Queued { stopped: bool },
    Busy(P),
}

struct TxRing {
    ring: DescriptorRing,
    slots: Box<[Option<TxSlot>]>,
    hw: Box<dyn TxQueueHw>,
    /// Hardware descriptors written since the last doorbell.
    unflushed: u32,
    closed: bool,
}

pub struct TxEngine {
    qid: u16,
    params: TxParams,
    state: Mutex<TxRing>,
    stopped: AtomicBool,
    interrupts: Arc<AtomicU64>,
    flags: Arc<DeviceFlags>,
    stats: Arc<QueueStats>,
    mapper: Arc<dyn DmaMapper>,
}

impl TxEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        qid: u16,
        size: u16,
        hw: Box<dyn TxQueueHw>,
        params: TxParams,
        mapper: Arc<dyn DmaMapper>,
        flags: Arc<DeviceFlags>,
        stats: Arc<QueueStats>,
        interrupts: Arc<AtomicU64>,
    ) -> Result<Self, RingError> {
        let ring = DescriptorRing::new(size)?;
        let slots = (0..size).map(|_| None).collect();
        Ok(Self {
            qid,
            params: TxParams {
                header_push: params.header_push.min(MAX_HEADER_PUSH),
                ..params
            },
            state: Mutex::new(TxRing {
                ring,
                slots,
                hw,
                unflushed: 0,
                closed: false,
            }),
            stopped: AtomicBool::new(false),
            interrupts,
            flags,
            stats,
            mapper,
        })
    }

    #[inline]
    pub fn qid(&self) -> u16 {
        self.qid
    }

    /// Host should hold packets back until the queue is woken.
    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().unwrap().ring.ids_in_flight()
    }

    pub fn free_slots(&self) -> u16 {
        self.state.lock().unwrap().ring.free_slots()
    }

    pub fn capacity(&self) -> u16 {
        self.state.lock().unwrap().ring.capacity()
    }

    pub fn hw_id(&self) -> HwQueueId {
        self.state.lock().unwrap().hw.id()
    }

    /// Fragment layout the device cannot describe in one request.
    fn needs_linearize(&self, packet: &OutboundPacket) -> bool {
        let frags = packet.frags().iter().filter(|f| !f.is_empty()).count();
        let max = self.params.max_segments;
        frags > max || (frags == max && packet.head().len() >= self.params.header_push)
    }

    /// Queue a host packet.
    ///
    /// `more` says the host has further packets ready; the doorbell is
    /// deferred until it is false or the queue stops.
    pub fn submit(&self, mut packet: OutboundPacket, more: bool) -> Result<TxOutcome, TxError> {
        if self.flags.test(FAILED) {
            return Err(TxError::DeviceFailed);
        }
        if packet.is_empty() {
            return Err(TxError::Empty);
        }
        if !self.flags.accepting_traffic() {
            self.stats.inc(QueueCounter::TxBusy);
            return Ok(TxOutcome::Busy(packet));
        }

        if self.needs_linearize(&packet) {
            self.stats.inc(QueueCounter::TxLinearize);
            if let Err(e) = packet.linearize() {
                self.stats.inc(QueueCounter::TxLinearizeFailed);
                return Err(e);
            }
        }

        let mut ring = self.state.lock().unwrap();
        match self.enqueue(&mut ring, packet, more)? {
            Enqueued::Queued { stopped } => Ok(TxOutcome::Queued { stopped }),
            Enqueued::Busy(packet) => Ok(TxOutcome::Busy(packet)),
        }
    }

    /// Queue several frames under one lock acquisition.
    ///
    /// Frames that do not fit are dropped. Returns how many were queued.
    pub fn xmit_frames(&self, frames: impl IntoIterator<Item = Frame>, flush: bool) -> usize {
        if !self.flags.accepting_traffic() {
            return 0;
        }

        let mut ring = self.state.lock().unwrap();
        let mut sent = 0;
        for frame in frames {
            if frame.is_empty() {
                continue;
            }
            match self.enqueue(&mut ring, frame, true) {
                Ok(Enqueued::Queued { .. }) => sent += 1,
                Ok(Enqueued::Busy(_)) | Err(_) => break,
            }
        }
        if flush && ring.unflushed > 0 {
            self.ring_doorbell(&mut ring);
        }
        sent
    }

    fn enqueue<P: Payload>(
        &self,
        ring: &mut TxRing,
        payload: P,
        more: bool,
    ) -> Result<Enqueued<P>, TxError> {
        if ring.closed {
            return Ok(Enqueued::Busy(payload));
        }

        let mut header = [0u8; MAX_HEADER_PUSH];
        let pushed = payload.copy_prefix(&mut header[..self.params.header_push]);

        let needed = payload.mapped_segments(pushed);
        if needed > self.params.max_segments {
            return Err(TxError::TooManySegments {
                segments: needed,
                max: self.params.max_segments,
            });
        }
        if (ring.ring.free_slots() as usize) < needed + 2 {
            self.stats.inc(QueueCounter::TxBusy);
            self.stop();
            if ring.unflushed > 0 {
                self.ring_doorbell(ring);
            }
            return Ok(Enqueued::Busy(payload));
        }

        let mut segs = match payload.map(self.mapper.as_ref(), pushed) {
            Ok(segs) => segs,
            Err(e) => {
                self.stats.inc(QueueCounter::TxDmaMappingErr);
                return Err(e.into());
            }
        };

        let Some(req_id) = ring.ring.acquire_id() else {
            segs.unmap(self.mapper.as_ref());
            self.stats.inc(QueueCounter::TxBusy);
            self.stop();
            return Ok(Enqueued::Busy(payload));
        };

        let descs = segs.len() as u32 + u32::from(pushed > 0);
        if let Some(limit) = self.params.burst_limit
            && ring.unflushed > 0
            && ring.unflushed + descs > limit as u32
        {
            debug!(qid = self.qid, "Burst limit reached, ringing doorbell");
            self.ring_doorbell(ring);
        }

        let len = payload.len() as u32;
        let desc = TxDescriptor {
            req_id,
            header: &header[..pushed],
            segments: segs.as_slice(),
            total_len: len,
            offload: payload.offload(),
        };

        let hw_descs = match ring.hw.write(&desc) {
            Ok(n) => n,
            Err(e) => {
                segs.unmap(self.mapper.as_ref());
                let _ = ring.ring.release_id(req_id);
                self.stats.inc(QueueCounter::TxPrepareErr);
                if e == HwError::NoSpace {
                    self.stop();
                    return Ok(Enqueued::Busy(payload));
                }
                error!(qid = self.qid, error = %e, "Failed to prepare tx descriptors");
                self.flags.request_reset(ResetReason::DriverInvalidState);
                return Err(e.into());
            }
        };

        if let Err(e) = ring.ring.advance(Cursor::Produce, 1) {
            error!(qid = self.qid, error = %e, "Tx ring accounting diverged");
            self.flags.request_reset(ResetReason::DriverInvalidState);
        }
        ring.slots[req_id as usize] = Some(TxSlot {
            _payload: payload.into_slot(),
            segs,
            hw_descs,
            bytes: len,
            submitted_at: Instant::now(),
            irq_mark: self.interrupts.load(Ordering::Acquire),
            reported_missing: false,
        });
        ring.unflushed += hw_descs as u32;
        self.stats.inc(QueueCounter::TxPackets);
        self.stats.add(QueueCounter::TxBytes, len as u64);

        if ring.ring.free_slots() < self.params.wake_threshold() {
            self.stop();
        }
        let stopped = self.is_stopped();

        if stopped || !more {
            self.ring_doorbell(ring);
        }
        Ok(Enqueued::Queued { stopped })
    }

    fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            self.stats.inc(QueueCounter::TxQueueStop);
            debug!(qid = self.qid, "Tx queue stopped");
        }
    }

    fn ring_doorbell(&self, ring: &mut TxRing) {
        ring.hw.doorbell();
        ring.unflushed = 0;
        self.stats.inc(QueueCounter::TxDoorbells);
    }

    /// Process up to `budget` completions.
    ///
    /// A completion naming an id that is not in flight requests a reset
    /// and stops processing.
    pub fn reap(&self, budget: u32) -> Result<Reaped, ProtocolViolation> {
        let mut done = Reaped::default();
        let mut acked = 0u32;
        let mut violation = None;

        let mut ring = self.state.lock().unwrap();
        while done.packets < budget {
            let Some(completion) = ring.hw.poll_completion() else {
                break;
            };
            let req_id = completion.req_id;

            let slot = if ring.ring.is_in_flight(req_id) {
                ring.slots.get_mut(req_id as usize).and_then(Option::take)
            } else {
                None
            };
            let Some(mut slot) = slot else {
                self.stats.inc(QueueCounter::TxBadReqId);
                error!(qid = self.qid, req_id, "Invalid tx request id");
                violation = Some(ProtocolViolation::InvalidTxReqId {
                    qid: self.qid,
                    req_id,
                });
                break;
            };

            slot.segs.unmap(self.mapper.as_ref());
            acked += slot.hw_descs as u32;
            done.bytes += slot.bytes as u64;
            done.packets += 1;

            if ring.ring.release_id(req_id).is_err()
                || ring.ring.advance(Cursor::Consume, 1).is_err()
            {
                violation = Some(ProtocolViolation::InvalidTxReqId {
                    qid: self.qid,
                    req_id,
                });
                break;
            }
        }

        if acked > 0 {
            ring.hw.ack(acked);
        }

        // Pairs with the Release store in stop(): a submitter that stopped
        // the queue either sees the freed slots or its stop is seen here.
        fence(Ordering::SeqCst);
        if self.stopped.load(Ordering::Acquire)
            && !ring.closed
            && ring.ring.free_slots() >= self.params.wake_threshold()
            && self.flags.test(ADMIN_UP)
        {
            self.stopped.store(false, Ordering::Release);
            self.stats.inc(QueueCounter::TxQueueWakeup);
            done.woke = true;
        }
        drop(ring);

        self.stats.add(QueueCounter::TxCompleted, done.packets as u64);

        if let Some(v) = violation {
            self.flags.request_reset(ResetReason::InvalidTxReqId);
            return Err(v);
        }
        Ok(done)
    }

    /// Count requests outstanding longer than `timeout`.
    pub fn scan_missing(&self, now: Instant, timeout: Duration, stall_multiple: u32) -> MissingScan {
        let irq_now = self.interrupts.load(Ordering::Acquire);
        let stall_limit = timeout * stall_multiple;
        let mut scan = MissingScan::default();

        let mut ring = self.state.lock().unwrap();
        for (req_id, slot) in ring.slots.iter_mut().enumerate() {
            let Some(slot) = slot else { continue };
            let elapsed = now.saturating_duration_since(slot.submitted_at);
            if elapsed <= timeout {
                continue;
            }

            if elapsed > stall_limit {
                if irq_now == 0 {
                    scan.no_interrupt = true;
                } else if irq_now > slot.irq_mark {
                    scan.stalled = true;
                }
            }

            if !slot.reported_missing {
                slot.reported_missing = true;
                self.stats.inc(QueueCounter::TxMissedCompletions);
                warn!(
                    qid = self.qid,
                    req_id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Tx completion missing"
                );
            }
            scan.missed += 1;
        }
        scan
    }

    pub fn unmask_interrupt(&self, rx_usecs: u32, tx_usecs: u32) {
        self.state
            .lock()
            .unwrap()
            .hw
            .unmask_interrupt(rx_usecs, tx_usecs);
    }

    /// Close the ring and release every in-flight buffer without waiting
    /// for the device. Returns the number of requests dropped.
    pub fn flush(&self) -> usize {
        let mut ring = self.state.lock().unwrap();
        ring.closed = true;
        ring.unflushed = 0;

        let mut flushed = 0;
        for req_id in 0..ring.slots.len() {
            if let Some(mut slot) = ring.slots[req_id].take() {
                slot.segs.unmap(self.mapper.as_ref());
                let _ = ring.ring.release_id(req_id as u16);
                let _ = ring.ring.advance(Cursor::Consume, 1);
                flushed += 1;
            }
        }
        drop(ring);

        self.stopped.store(true, Ordering::Release);
        if flushed > 0 {
            debug!(qid = self.qid, flushed, "Tx ring flushed");
        }
        flushed
    }
}
