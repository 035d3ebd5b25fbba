//! Engine counters
//!
//! Counters are plain atomics indexed by enum so the data path pays one
//! relaxed fetch-add per event. Snapshots copy every value into a
//! serializable map for reporting.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use serde::Serialize;

use crate::flags::{DeviceState, ResetReason};

pub const QUEUE_COUNTER_COUNT: usize = 33;

/// Per queue pair counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum QueueCounter {
    TxPackets = 0,
    TxBytes = 1,
    TxBusy = 2,
    TxQueueStop = 3,
    TxQueueWakeup = 4,
    TxDoorbells = 5,
    TxLinearize = 6,
    TxLinearizeFailed = 7,
    TxDmaMappingErr = 8,
    TxPrepareErr = 9,
    TxBadReqId = 10,
    TxMissedCompletions = 11,
    TxCompleted = 12,
    RxPackets = 13,
    RxBytes = 14,
    RxCopybreak = 15,
    RxPageAllocFail = 16,
    RxDmaMappingErr = 17,
    RxRefillPartial = 18,
    RxBadReqId = 19,
    RxBadDescNum = 20,
    RxCorrupt = 21,
    RxCsumBad = 22,
    RxEmptyRing = 23,
    FilterPass = 24,
    FilterDrop = 25,
    FilterTx = 26,
    FilterRedirect = 27,
    FilterAborted = 28,
    Interrupts = 29,
    Polls = 30,
    UnmaskInterrupt = 31,
    PollComplete = 32,
}

const QUEUE_COUNTER_NAMES: [&str; QUEUE_COUNTER_COUNT] = [
    "tx_packets",
    "tx_bytes",
    "tx_busy",
    "tx_queue_stop",
    "tx_queue_wakeup",
    "tx_doorbells",
    "tx_linearize",
    "tx_linearize_failed",
    "tx_dma_mapping_err",
    "tx_prepare_err",
    "tx_bad_req_id",
    "tx_missed_completions",
    "tx_completed",
    "rx_packets",
    "rx_bytes",
    "rx_copybreak",
    "rx_page_alloc_fail",
    "rx_dma_mapping_err",
    "rx_refill_partial",
    "rx_bad_req_id",
    "rx_bad_desc_num",
    "rx_corrupt",
    "rx_csum_bad",
    "rx_empty_ring",
    "filter_pass",
    "filter_drop",
    "filter_tx",
    "filter_redirect",
    "filter_aborted",
    "interrupts",
    "polls",
    "unmask_interrupt",
    "poll_complete",
];

impl QueueCounter {
    pub fn name(self) -> &'static str {
        QUEUE_COUNTER_NAMES[self as usize]
    }
}

pub const DEVICE_COUNTER_COUNT: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum DeviceCounter {
    Resets = 0,
    ResetFailures = 1,
    ResetRequests = 2,
    WatchdogTicks = 3,
    KeepAlives = 4,
    InterfaceUp = 5,
    InterfaceDown = 6,
    RingSizeBackoff = 7,
}

const DEVICE_COUNTER_NAMES: [&str; DEVICE_COUNTER_COUNT] = [
    "resets",
    "reset_failures",
    "reset_requests",
    "watchdog_ticks",
    "keep_alives",
    "interface_up",
    "interface_down",
    "ring_size_backoff",
];

impl DeviceCounter {
    pub fn name(self) -> &'static str {
        DEVICE_COUNTER_NAMES[self as usize]
    }
}

/// Counters of one queue pair.
#[derive(Debug)]
pub struct QueueStats {
    counts: [AtomicU64; QUEUE_COUNTER_COUNT],
    /// Interval programmed at the last unmask.
    moderation_usecs: AtomicU32,
}

impl Default for QueueStats {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueStats {
    pub fn new() -> Self {
        Self {
            counts: std::array::from_fn(|_| AtomicU64::new(0)),
            moderation_usecs: AtomicU32::new(0),
        }
    }

    #[inline]
    pub fn inc(&self, counter: QueueCounter) {
        self.add(counter, 1);
    }

    #[inline]
    pub fn add(&self, counter: QueueCounter, delta: u64) {
        self.counts[counter as usize].fetch_add(delta, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self, counter: QueueCounter) -> u64 {
        self.counts[counter as usize].load(Ordering::Relaxed)
    }

    pub fn set_moderation(&self, usecs: u32) {
        self.moderation_usecs.store(usecs, Ordering::Relaxed);
    }

    pub fn moderation(&self) -> u32 {
        self.moderation_usecs.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> BTreeMap<&'static str, u64> {
        QUEUE_COUNTER_NAMES
            .iter()
            .zip(&self.counts)
            .map(|(name, c)| (*name, c.load(Ordering::Relaxed)))
            .collect()
    }
}

/// Device-wide counters.
#[derive(Debug)]
pub struct DeviceStats {
    counts: [AtomicU64; DEVICE_COUNTER_COUNT],
}

impl Default for DeviceStats {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceStats {
    pub fn new() -> Self {
        Self {
            counts: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    #[inline]
    pub fn inc(&self, counter: DeviceCounter) {
        self.counts[counter as usize].fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self, counter: DeviceCounter) -> u64 {
        self.counts[counter as usize].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> BTreeMap<&'static str, u64> {
        DEVICE_COUNTER_NAMES
            .iter()
            .zip(&self.counts)
            .map(|(name, c)| (*name, c.load(Ordering::Relaxed)))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub qid: u16,
    pub kind: &'static str,
    pub moderation_usecs: u32,
    pub counters: BTreeMap<&'static str, u64>,
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Serialize)]
pub struct CounterSnapshot {
    pub device_id: String,
    pub state: DeviceState,
    pub pending_reset: Option<ResetReason>,
    pub device: BTreeMap<&'static str, u64>,
    pub pool_available: usize,
    pub queues: Vec<QueueSnapshot>,
}

impl CounterSnapshot {
    /// Sum of one counter across all queues.
    pub fn total(&self, counter: QueueCounter) -> u64 {
        self.queues
            .iter()
            .map(|q| q.counters.get(counter.name()).copied().unwrap_or(0))
            .sum()
    }

    pub fn device(&self, counter: DeviceCounter) -> u64 {
        self.device.get(counter.name()).copied().unwrap_or(0)
    }
}
