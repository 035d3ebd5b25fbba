//! Queue pairs
//!
//! A queue pair bundles one TX engine with an optional RX engine and the
//! interrupt that serves both. IO queue pairs carry host traffic in both
//! directions; redirect queue pairs only transmit frames forwarded by the
//! filter or injected in bulk.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};

use crate::hw::HwQueueId;
use crate::moderation::ModerationEstimator;
use crate::rx::RxEngine;
use crate::stats::{QueueCounter, QueueSnapshot, QueueStats};
use crate::tx::TxEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Io,
    Redirect,
}

impl QueueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueKind::Io => "io",
            QueueKind::Redirect => "redirect",
        }
    }
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State only the poll callback touches.
pub struct PollState {
    pub rx: Option<RxEngine>,
    pub moderation: ModerationEstimator,
    /// Set by teardown; the queue is never polled again.
    pub halted: bool,
}

pub struct QueuePair {
    qid: u16,
    kind: QueueKind,
    tx: TxEngine,
    hw_ids: Vec<HwQueueId>,
    poll: Mutex<PollState>,
    stats: Arc<QueueStats>,
    interrupts: Arc<AtomicU64>,
    masked: AtomicBool,
    /// Watchdog ticks with pending RX work but no interrupt ever seen.
    pub(crate) no_interrupt_ticks: AtomicU32,
    /// Consecutive watchdog ticks with no posted RX buffer.
    pub(crate) empty_rx_ticks: AtomicU32,
}

impl QueuePair {
    pub fn new(
        qid: u16,
        kind: QueueKind,
        tx: TxEngine,
        rx: Option<RxEngine>,
        moderation: ModerationEstimator,
        stats: Arc<QueueStats>,
        interrupts: Arc<AtomicU64>,
    ) -> Self {
        let hw_ids = std::iter::once(tx.hw_id())
            .chain(rx.as_ref().map(RxEngine::hw_id))
            .collect();
        Self {
            qid,
            kind,
            tx,
            hw_ids,
            poll: Mutex::new(PollState {
                rx,
                moderation,
                halted: false,
            }),
            stats,
            interrupts,
            masked: AtomicBool::new(false),
            no_interrupt_ticks: AtomicU32::new(0),
            empty_rx_ticks: AtomicU32::new(0),
        }
    }

    #[inline]
    pub fn qid(&self) -> u16 {
        self.qid
    }

    #[inline]
    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    #[inline]
    pub fn tx(&self) -> &TxEngine {
        &self.tx
    }

    #[inline]
    pub fn stats(&self) -> &QueueStats {
        &self.stats
    }

    /// Hardware queues backing this pair, TX first.
    pub fn hw_ids(&self) -> &[HwQueueId] {
        &self.hw_ids
    }

    pub fn set_rx_mtu(&self, mtu: u32) {
        let mut state = self.poll.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(rx) = state.rx.as_mut() {
            rx.set_mtu(mtu);
        }
    }

    /// Buffers currently posted on the RX ring.
    pub fn rx_posted(&self) -> u16 {
        let state = self.poll.lock().unwrap_or_else(|e| e.into_inner());
        state.rx.as_ref().map(RxEngine::posted).unwrap_or(0)
    }

    /// Post a buffer into every free RX slot. Returns how many were posted.
    pub(crate) fn fill_rx(&self) -> u16 {
        let mut state = self.poll.lock().unwrap_or_else(|e| e.into_inner());
        match state.rx.as_mut() {
            Some(rx) => {
                let free = rx.refillable();
                rx.refill(free)
            }
            None => 0,
        }
    }

    /// Interrupt fired for this queue pair.
    ///
    /// The device masks the vector when it fires. Returns true if the
    /// caller should schedule a poll, false if one is already pending.
    pub fn interrupt(&self) -> bool {
        self.interrupts.fetch_add(1, Ordering::AcqRel);
        self.stats.inc(QueueCounter::Interrupts);
        !self.masked.swap(true, Ordering::AcqRel)
    }

    #[inline]
    pub fn interrupt_count(&self) -> u64 {
        self.interrupts.load(Ordering::Acquire)
    }

    /// Clear the masked mark. Returns true if it was set.
    pub(crate) fn take_masked(&self) -> bool {
        self.masked.swap(false, Ordering::AcqRel)
    }

    /// Poll state unless another context holds it.
    pub(crate) fn try_poll_state(&self) -> Option<MutexGuard<'_, PollState>> {
        match self.poll.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::WouldBlock) => None,
            Err(TryLockError::Poisoned(e)) => Some(e.into_inner()),
        }
    }

    /// Wait for a running poll to finish, then stop polling and release
    /// every buffer on both rings. Returns the number of buffers dropped.
    pub(crate) fn halt(&self) -> usize {
        let mut state = self.poll.lock().unwrap_or_else(|e| e.into_inner());
        state.halted = true;
        let rx = state.rx.as_mut().map(RxEngine::flush).unwrap_or(0);
        rx + self.tx.flush()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            qid: self.qid,
            kind: self.kind.as_str(),
            moderation_usecs: self.stats.moderation(),
            counters: self.stats.snapshot(),
        }
    }
}

impl fmt::Debug for QueuePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuePair")
            .field("qid", &self.qid)
            .field("kind", &self.kind)
            .finish()
    }
}
