//! Host-side test doubles

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::buffer::{DmaAddr, DmaDirection, DmaMapper, IdentityMapper};
use crate::error::DmaError;
use crate::hw::HostStack;
use crate::packet::InboundPacket;

#[derive(Debug, Default)]
struct Recorded {
    delivered: Vec<InboundPacket>,
    completed_packets: u64,
    completed_bytes: u64,
    wakes: Vec<u16>,
    poll_requests: Vec<u16>,
}

/// Host stack that keeps everything it is handed.
#[derive(Debug, Default)]
pub struct RecordingHost {
    inner: Mutex<Recorded>,
}

impl RecordingHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Packets delivered since the last call.
    pub fn take(&self) -> Vec<InboundPacket> {
        std::mem::take(&mut self.inner.lock().unwrap().delivered)
    }

    pub fn delivered(&self) -> usize {
        self.inner.lock().unwrap().delivered.len()
    }

    /// Total (packets, bytes) reported as transmitted.
    pub fn completed(&self) -> (u64, u64) {
        let inner = self.inner.lock().unwrap();
        (inner.completed_packets, inner.completed_bytes)
    }

    pub fn wakes(&self) -> Vec<u16> {
        self.inner.lock().unwrap().wakes.clone()
    }

    pub fn poll_requests(&self) -> Vec<u16> {
        self.inner.lock().unwrap().poll_requests.clone()
    }
}

impl HostStack for RecordingHost {
    fn deliver(&self, packet: InboundPacket) {
        self.inner.lock().unwrap().delivered.push(packet);
    }

    fn completed(&self, _qid: u16, packets: u64, bytes: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.completed_packets += packets;
        inner.completed_bytes += bytes;
    }

    fn tx_wake(&self, qid: u16) {
        self.inner.lock().unwrap().wakes.push(qid);
    }

    fn schedule_poll(&self, qid: u16) {
        self.inner.lock().unwrap().poll_requests.push(qid);
    }
}

/// Identity mapper that can be told to fail.
#[derive(Debug, Default)]
pub struct FlakyMapper {
    inner: IdentityMapper,
    failures: AtomicUsize,
}

impl FlakyMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` mappings.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::Release);
    }

    pub fn live_mappings(&self) -> usize {
        self.inner.live_mappings()
    }
}

impl DmaMapper for FlakyMapper {
    fn map(&self, ptr: *const u8, len: usize, dir: DmaDirection) -> Result<DmaAddr, DmaError> {
        let failed = self
            .failures
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(DmaError::MappingFailed { len });
        }
        self.inner.map(ptr, len, dir)
    }

    fn unmap(&self, addr: DmaAddr, len: usize, dir: DmaDirection) {
        self.inner.unmap(addr, len, dir);
    }
}
