//! Simulated device
//!
//! `SimNic` implements the admin channel; `SimTx` and `SimRx` implement the
//! hardware queues it hands out. The simulated device "DMAs" through the
//! addresses produced by `IdentityMapper`, i.e. it reads and writes host
//! memory directly, so frames really travel through the engine's buffers.
//!
//! Nothing completes on its own. Tests decide when and in which order
//! requests complete, and can inject completions the engine never asked
//! for.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::buffer::{DmaAddr, MappedSegment};
use crate::error::{AdminError, HwError};
use crate::flags::ResetReason;
use crate::hw::{
    AdminChannel, Capabilities, Direction, HwQueue, HwQueueId, RxCompletion, RxQueueHw,
    TxCompletion, TxDescriptor, TxQueueHw,
};
use crate::packet::RxMeta;

// ============================================================================
// TX queue
// ============================================================================

#[derive(Debug)]
struct TxRecord {
    req_id: u16,
    header: Vec<u8>,
    segments: Vec<MappedSegment>,
}

impl TxRecord {
    /// Bytes the device would put on the wire.
    fn read(&self) -> Vec<u8> {
        let mut frame = self.header.clone();
        for seg in &self.segments {
            // SAFETY: the segment was mapped 1:1 over memory owned by the
            // engine's TX slot, which stays alive until the completion for
            // this request is reaped. Records are read before completing.
            let data =
                unsafe { std::slice::from_raw_parts(seg.addr.0 as *const u8, seg.len as usize) };
            frame.extend_from_slice(data);
        }
        frame
    }
}

#[derive(Debug)]
struct TxState {
    id: HwQueueId,
    size: u16,
    outstanding: VecDeque<TxRecord>,
    completions: VecDeque<TxCompletion>,
    doorbells: u64,
    acked: u64,
    unmasks: u64,
    last_moderation: Option<(u32, u32)>,
    last_segments: usize,
    last_header_len: usize,
    fail_next: Option<HwError>,
    destroyed: bool,
}

/// Simulated transmit queue. Clones share state; one clone goes to the
/// engine, the others stay with the test.
#[derive(Debug, Clone)]
pub struct SimTx {
    state: Arc<Mutex<TxState>>,
}

impl SimTx {
    pub fn new(id: u32, size: u16) -> Self {
        Self {
            state: Arc::new(Mutex::new(TxState {
                id: HwQueueId(id),
                size,
                outstanding: VecDeque::new(),
                completions: VecDeque::new(),
                doorbells: 0,
                acked: 0,
                unmasks: 0,
                last_moderation: None,
                last_segments: 0,
                last_header_len: 0,
                fail_next: None,
                destroyed: false,
            })),
        }
    }

    /// Handle for the engine.
    pub fn queue(&self) -> Box<dyn TxQueueHw> {
        Box::new(self.clone())
    }

    pub fn id(&self) -> HwQueueId {
        self.state.lock().unwrap().id
    }

    /// Complete the `n` oldest outstanding requests. Returns how many were
    /// completed.
    pub fn complete(&self, n: usize) -> usize {
        let mut state = self.state.lock().unwrap();
        let mut done = 0;
        while done < n {
            let Some(record) = state.outstanding.pop_front() else {
                break;
            };
            state.completions.push_back(TxCompletion {
                req_id: record.req_id,
            });
            done += 1;
        }
        done
    }

    /// Complete every outstanding request.
    pub fn complete_all(&self) -> usize {
        self.complete(usize::MAX)
    }

    /// Complete the given request ids in the given order.
    pub fn complete_ids(&self, ids: &[u16]) {
        let mut state = self.state.lock().unwrap();
        for &req_id in ids {
            if let Some(pos) = state.outstanding.iter().position(|r| r.req_id == req_id) {
                state.outstanding.remove(pos);
            }
            state.completions.push_back(TxCompletion { req_id });
        }
    }

    /// Post a completion the engine never submitted.
    pub fn inject_completion(&self, req_id: u16) {
        self.state
            .lock()
            .unwrap()
            .completions
            .push_back(TxCompletion { req_id });
    }

    /// Read up to `n` outstanding frames off the wire and complete them.
    pub fn take_frames(&self, n: usize) -> Vec<Vec<u8>> {
        let mut state = self.state.lock().unwrap();
        let mut frames = Vec::new();
        while frames.len() < n {
            let Some(record) = state.outstanding.pop_front() else {
                break;
            };
            frames.push(record.read());
            state.completions.push_back(TxCompletion {
                req_id: record.req_id,
            });
        }
        frames
    }

    pub fn outstanding(&self) -> usize {
        self.state.lock().unwrap().outstanding.len()
    }

    /// Request ids the device holds, oldest first.
    pub fn outstanding_ids(&self) -> Vec<u16> {
        let state = self.state.lock().unwrap();
        state.outstanding.iter().map(|r| r.req_id).collect()
    }

    pub fn doorbells(&self) -> u64 {
        self.state.lock().unwrap().doorbells
    }

    /// Hardware descriptors acknowledged by the engine.
    pub fn acked(&self) -> u64 {
        self.state.lock().unwrap().acked
    }

    pub fn unmasks(&self) -> u64 {
        self.state.lock().unwrap().unmasks
    }

    /// RX and TX delays of the last interrupt unmask.
    pub fn last_moderation(&self) -> Option<(u32, u32)> {
        self.state.lock().unwrap().last_moderation
    }

    /// Mapped segments in the last written request.
    pub fn last_segments(&self) -> usize {
        self.state.lock().unwrap().last_segments
    }

    /// Inline header bytes in the last written request.
    pub fn last_header_len(&self) -> usize {
        self.state.lock().unwrap().last_header_len
    }

    /// Make the next `write` fail with `err`.
    pub fn fail_next_write(&self, err: HwError) {
        self.state.lock().unwrap().fail_next = Some(err);
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.lock().unwrap().destroyed
    }

    fn destroy(&self) {
        let mut state = self.state.lock().unwrap();
        state.destroyed = true;
        state.outstanding.clear();
        state.completions.clear();
    }
}

impl TxQueueHw for SimTx {
    fn id(&self) -> HwQueueId {
        SimTx::id(self)
    }

    fn write(&mut self, desc: &TxDescriptor<'_>) -> Result<u16, HwError> {
        let mut state = self.state.lock().unwrap();
        if state.destroyed {
            return Err(HwError::QueueGone);
        }
        if let Some(err) = state.fail_next.take() {
            return Err(err);
        }
        if state.outstanding.len() >= state.size as usize {
            return Err(HwError::NoSpace);
        }
        let seg_bytes: u64 = desc.segments.iter().map(|s| s.len as u64).sum();
        if seg_bytes + desc.header.len() as u64 != desc.total_len as u64 {
            return Err(HwError::InvalidDescriptor("length mismatch"));
        }

        state.last_segments = desc.segments.len();
        state.last_header_len = desc.header.len();
        state.outstanding.push_back(TxRecord {
            req_id: desc.req_id,
            header: desc.header.to_vec(),
            segments: desc.segments.to_vec(),
        });
        Ok(desc.segments.len() as u16 + u16::from(!desc.header.is_empty()))
    }

    fn doorbell(&mut self) {
        self.state.lock().unwrap().doorbells += 1;
    }

    fn poll_completion(&mut self) -> Option<TxCompletion> {
        self.state.lock().unwrap().completions.pop_front()
    }

    fn ack(&mut self, descriptors: u32) {
        self.state.lock().unwrap().acked += descriptors as u64;
    }

    fn unmask_interrupt(&mut self, rx_usecs: u32, tx_usecs: u32) {
        let mut state = self.state.lock().unwrap();
        state.unmasks += 1;
        state.last_moderation = Some((rx_usecs, tx_usecs));
    }
}

// ============================================================================
// RX queue
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct PostedBuffer {
    req_id: u16,
    addr: DmaAddr,
    len: u32,
}

#[derive(Debug)]
struct RxState {
    id: HwQueueId,
    size: u16,
    posted: VecDeque<PostedBuffer>,
    completions: VecDeque<RxCompletion>,
    doorbells: u64,
    meta: RxMeta,
    destroyed: bool,
}

/// Simulated receive queue.
#[derive(Debug, Clone)]
pub struct SimRx {
    state: Arc<Mutex<RxState>>,
}

impl SimRx {
    pub fn new(id: u32, size: u16) -> Self {
        Self {
            state: Arc::new(Mutex::new(RxState {
                id: HwQueueId(id),
                size,
                posted: VecDeque::new(),
                completions: VecDeque::new(),
                doorbells: 0,
                meta: RxMeta::default(),
                destroyed: false,
            })),
        }
    }

    pub fn queue(&self) -> Box<dyn RxQueueHw> {
        Box::new(self.clone())
    }

    pub fn id(&self) -> HwQueueId {
        self.state.lock().unwrap().id
    }

    /// Buffers posted and not yet filled.
    pub fn posted(&self) -> usize {
        self.state.lock().unwrap().posted.len()
    }

    pub fn doorbells(&self) -> u64 {
        self.state.lock().unwrap().doorbells
    }

    /// Metadata attached to frames received from now on.
    pub fn set_meta(&self, meta: RxMeta) {
        self.state.lock().unwrap().meta = meta;
    }

    /// Receive `frame` into the oldest posted buffers.
    pub fn receive(&self, frame: &[u8]) -> bool {
        self.receive_at(frame, 0)
    }

    /// Receive `frame` with its first byte `pkt_offset` bytes into the
    /// first buffer. Returns false (and receives nothing) if the posted
    /// buffers cannot hold the frame.
    pub fn receive_at(&self, frame: &[u8], pkt_offset: u16) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.destroyed || frame.is_empty() {
            return false;
        }

        // Plan the split first so a frame is received whole or not at all.
        let mut chunks = Vec::new();
        let mut remaining = frame.len();
        for (i, buf) in state.posted.iter().enumerate() {
            if remaining == 0 {
                break;
            }
            let shift = if i == 0 { pkt_offset as usize } else { 0 };
            let room = (buf.len as usize).saturating_sub(shift);
            if room == 0 {
                return false;
            }
            let n = room.min(remaining);
            chunks.push((shift, n));
            remaining -= n;
        }
        if remaining > 0 {
            return false;
        }

        let meta = state.meta;
        let last_index = chunks.len() - 1;
        let mut consumed = 0;
        for (i, (shift, n)) in chunks.into_iter().enumerate() {
            let Some(buf) = state.posted.pop_front() else {
                return false;
            };
            // SAFETY: the buffer was mapped 1:1 over an RX page the engine
            // keeps in its slot until this completion is polled, and
            // shift + n never exceeds the posted length.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    frame[consumed..].as_ptr(),
                    (buf.addr.0 as *mut u8).add(shift),
                    n,
                );
            }
            consumed += n;
            state.completions.push_back(RxCompletion::Buffer {
                req_id: buf.req_id,
                len: n as u32,
                pkt_offset: shift as u16,
                last: i == last_index,
                meta,
            });
        }
        true
    }

    /// Drain completions without handing them to the engine.
    pub fn take_completions(&self) -> Vec<RxCompletion> {
        self.state.lock().unwrap().completions.drain(..).collect()
    }

    pub fn inject(&self, completion: RxCompletion) {
        self.state
            .lock()
            .unwrap()
            .completions
            .push_back(completion);
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.lock().unwrap().destroyed
    }

    fn destroy(&self) {
        let mut state = self.state.lock().unwrap();
        state.destroyed = true;
        state.posted.clear();
        state.completions.clear();
    }
}

impl RxQueueHw for SimRx {
    fn id(&self) -> HwQueueId {
        SimRx::id(self)
    }

    fn post(&mut self, req_id: u16, addr: DmaAddr, len: u32) -> Result<(), HwError> {
        let mut state = self.state.lock().unwrap();
        if state.destroyed {
            return Err(HwError::QueueGone);
        }
        if state.posted.len() >= state.size as usize {
            return Err(HwError::NoSpace);
        }
        state.posted.push_back(PostedBuffer { req_id, addr, len });
        Ok(())
    }

    fn doorbell(&mut self) {
        self.state.lock().unwrap().doorbells += 1;
    }

    fn poll_completion(&mut self) -> Option<RxCompletion> {
        self.state.lock().unwrap().completions.pop_front()
    }

    fn has_pending(&self) -> bool {
        !self.state.lock().unwrap().completions.is_empty()
    }
}

// ============================================================================
// Admin channel
// ============================================================================

#[derive(Debug)]
struct NicState {
    caps: Capabilities,
    next_id: u32,
    tx: Vec<SimTx>,
    rx: Vec<SimRx>,
    created: Vec<(Direction, u16)>,
    resets: Vec<ResetReason>,
    mtu: u32,
    queue_size_limit: Option<u16>,
    fail_init: bool,
    init_calls: u32,
}

/// Simulated adapter.
#[derive(Debug)]
pub struct SimNic {
    state: Mutex<NicState>,
    running: AtomicBool,
}

impl Default for SimNic {
    fn default() -> Self {
        Self::new()
    }
}

impl SimNic {
    pub fn new() -> Self {
        Self::with_capabilities(Capabilities {
            max_queues: 32,
            max_segments_per_packet: 17,
            header_push_size: 0,
            supports_offloads: true,
            max_tx_burst: None,
            max_mtu: 9216,
        })
    }

    pub fn with_capabilities(caps: Capabilities) -> Self {
        Self {
            state: Mutex::new(NicState {
                caps,
                next_id: 1,
                tx: Vec::new(),
                rx: Vec::new(),
                created: Vec::new(),
                resets: Vec::new(),
                mtu: 1500,
                queue_size_limit: None,
                fail_init: false,
                init_calls: 0,
            }),
            running: AtomicBool::new(false),
        }
    }

    pub fn set_capabilities(&self, caps: Capabilities) {
        self.state.lock().unwrap().caps = caps;
    }

    pub fn set_max_queues(&self, max_queues: u16) {
        self.state.lock().unwrap().caps.max_queues = max_queues;
    }

    /// Queues larger than `limit` fail with `NoMemory`.
    pub fn limit_queue_size(&self, limit: Option<u16>) {
        self.state.lock().unwrap().queue_size_limit = limit;
    }

    /// Make every following `init` fail.
    pub fn fail_init(&self, fail: bool) {
        self.state.lock().unwrap().fail_init = fail;
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    /// Live TX queue `i`, in creation order.
    pub fn tx(&self, i: usize) -> SimTx {
        self.state.lock().unwrap().tx[i].clone()
    }

    /// Live RX queue `i`, in creation order.
    pub fn rx(&self, i: usize) -> SimRx {
        self.state.lock().unwrap().rx[i].clone()
    }

    pub fn live_queues(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.tx.len() + state.rx.len()
    }

    /// Direction and size of every successful queue creation.
    pub fn created(&self) -> Vec<(Direction, u16)> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn resets(&self) -> Vec<ResetReason> {
        self.state.lock().unwrap().resets.clone()
    }

    pub fn mtu(&self) -> u32 {
        self.state.lock().unwrap().mtu
    }

    pub fn init_calls(&self) -> u32 {
        self.state.lock().unwrap().init_calls
    }

    /// Move up to `max` frames from TX queue `tx` onto RX queue `rx`.
    ///
    /// Frames the RX queue has no room for are lost, like on a wire.
    /// Returns the number of frames received.
    pub fn loopback(&self, tx: usize, rx: usize, max: usize) -> usize {
        let (txq, rxq) = {
            let state = self.state.lock().unwrap();
            match (state.tx.get(tx), state.rx.get(rx)) {
                (Some(t), Some(r)) => (t.clone(), r.clone()),
                _ => return 0,
            }
        };
        txq.take_frames(max)
            .iter()
            .filter(|frame| rxq.receive(frame))
            .count()
    }
}

impl AdminChannel for SimNic {
    fn init(&self) -> Result<(), AdminError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_init {
            return Err(AdminError::Timeout);
        }
        state.init_calls += 1;
        self.running.store(true, Ordering::Release);
        Ok(())
    }

    fn read_capabilities(&self) -> Result<Capabilities, AdminError> {
        if !self.running.load(Ordering::Acquire) {
            return Err(AdminError::NotRunning);
        }
        Ok(self.state.lock().unwrap().caps.clone())
    }

    fn create_queue(
        &self,
        direction: Direction,
        size: u16,
        _numa_hint: Option<u32>,
    ) -> Result<HwQueue, AdminError> {
        let mut state = self.state.lock().unwrap();
        if let Some(limit) = state.queue_size_limit
            && size > limit
        {
            return Err(AdminError::NoMemory);
        }
        let id = state.next_id;
        state.next_id += 1;
        state.created.push((direction, size));

        Ok(match direction {
            Direction::Tx => {
                let q = SimTx::new(id, size);
                state.tx.push(q.clone());
                HwQueue::Tx(q.queue())
            }
            Direction::Rx => {
                let q = SimRx::new(id, size);
                state.rx.push(q.clone());
                HwQueue::Rx(q.queue())
            }
        })
    }

    fn destroy_queue(&self, id: HwQueueId) {
        let mut state = self.state.lock().unwrap();
        if let Some(pos) = state.tx.iter().position(|q| q.id() == id) {
            state.tx.remove(pos).destroy();
        } else if let Some(pos) = state.rx.iter().position(|q| q.id() == id) {
            state.rx.remove(pos).destroy();
        }
    }

    fn set_mtu(&self, mtu: u32) -> Result<(), AdminError> {
        let mut state = self.state.lock().unwrap();
        if mtu > state.caps.max_mtu {
            return Err(AdminError::Rejected(format!("mtu {mtu}")));
        }
        state.mtu = mtu;
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn reset(&self, reason: ResetReason) {
        self.state.lock().unwrap().resets.push(reason);
    }

    fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
    }
}
