//! Cooperative poll callback
//!
//! The host event loop calls `PollScheduler::run` for a queue pair after
//! its interrupt fired. One call reaps a bounded number of TX completions,
//! receives up to `budget` packets, and then either asks to be called
//! again or re-enables the interrupt with a fresh moderation interval.
//! The call never blocks: if another context holds the queue's poll state
//! it returns `Reschedule` right away.

use std::sync::Arc;

use tracing::trace;

use crate::config::ModerationConfig;
use crate::flags::{DeviceFlags, INTERRUPTS_ENABLED};
use crate::hw::HostStack;
use crate::queue::QueuePair;
use crate::stats::QueueCounter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Work is done and the interrupt was re-enabled.
    Complete { rx: u32, tx: u32 },
    /// Budget was exhausted; poll again without waiting for an interrupt.
    Reschedule,
    /// Device is down or resetting; do not poll until told otherwise.
    Halted,
}

#[derive(Debug, Clone)]
pub struct PollScheduler {
    budget: u32,
    tx_divider: u16,
    adaptive: bool,
    rx_static_usecs: u32,
    tx_static_usecs: u32,
}

impl PollScheduler {
    pub fn new(budget: u32, tx_divider: u16, moderation: &ModerationConfig) -> Self {
        Self {
            budget: budget.max(1),
            tx_divider: tx_divider.max(1),
            adaptive: moderation.adaptive,
            rx_static_usecs: moderation.rx_static_usecs,
            tx_static_usecs: moderation.tx_static_usecs,
        }
    }

    #[inline]
    pub fn budget(&self) -> u32 {
        self.budget
    }

    pub fn run(
        &self,
        queue: &QueuePair,
        flags: &DeviceFlags,
        host: &dyn HostStack,
        redirect: &[Arc<QueuePair>],
    ) -> PollOutcome {
        if !flags.accepting_traffic() {
            return PollOutcome::Halted;
        }
        let Some(mut state) = queue.try_poll_state() else {
            return PollOutcome::Reschedule;
        };
        if state.halted {
            return PollOutcome::Halted;
        }
        let stats = queue.stats();
        stats.inc(QueueCounter::Polls);

        let qid = queue.qid();
        let tx_budget = (queue.tx().capacity() / self.tx_divider).max(1) as u32;
        let Ok(reaped) = queue.tx().reap(tx_budget) else {
            return PollOutcome::Halted;
        };
        if reaped.packets > 0 {
            host.completed(qid, reaped.packets as u64, reaped.bytes);
        }
        if reaped.woke {
            host.tx_wake(qid);
        }

        // Another queue may have requested a reset meanwhile.
        if !flags.accepting_traffic() {
            return PollOutcome::Halted;
        }

        let rx = match state.rx.as_mut() {
            Some(rx) => match rx.poll(self.budget, host, redirect) {
                Ok(rx) => rx,
                Err(_) => return PollOutcome::Halted,
            },
            None => Default::default(),
        };
        state.moderation.record(rx.packets, rx.bytes);

        if rx.processed >= self.budget || reaped.packets >= tx_budget {
            trace!(qid, rx = rx.processed, tx = reaped.packets, "Poll budget exhausted");
            return PollOutcome::Reschedule;
        }

        stats.inc(QueueCounter::PollComplete);
        let rx_usecs = if self.adaptive && state.rx.is_some() {
            state.moderation.sample()
        } else {
            self.rx_static_usecs
        };
        drop(state);

        if flags.test(INTERRUPTS_ENABLED) && queue.take_masked() {
            queue.tx().unmask_interrupt(rx_usecs, self.tx_static_usecs);
            stats.inc(QueueCounter::UnmaskInterrupt);
            stats.set_moderation(rx_usecs);
        }

        PollOutcome::Complete {
            rx: rx.packets,
            tx: reaped.packets,
        }
    }
}
