//! Health monitoring
//!
//! `HealthMonitor::check` runs once per service tick and looks for:
//! - keep-alive expiry and a dead admin channel
//! - TX requests outstanding past the completion timeout
//! - RX work pending on a queue that never raised an interrupt
//! - RX rings left without any posted buffer
//!
//! A check never resets the device itself. It returns the first reason
//! found and the caller turns that into a reset request.
//!
//! `Watchdog` drives the ticks from a dedicated thread.

use std::io;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use crate::config::HealthConfig;
use crate::flags::ResetReason;
use crate::hw::HostStack;
use crate::queue::QueuePair;
use crate::stats::QueueCounter;

/// Consecutive empty-ring ticks before a refill poll is forced.
const EMPTY_RX_TICKS: u32 = 2;

/// Runtime override for one timeout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TimeoutHint {
    #[default]
    Unchanged,
    Disabled,
    Millis(u64),
}

impl TimeoutHint {
    fn apply(self, current: &mut Option<u64>) {
        match self {
            TimeoutHint::Unchanged => {}
            TimeoutHint::Disabled => *current = None,
            TimeoutHint::Millis(ms) => *current = Some(ms),
        }
    }
}

/// Timeouts pushed by the device at runtime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthHints {
    pub missing_tx_timeout: TimeoutHint,
    pub keep_alive_timeout: TimeoutHint,
    pub missed_tx_threshold: Option<u32>,
}

/// What the monitor looks at on one tick.
pub struct HealthInputs<'a> {
    pub now: Instant,
    pub last_keep_alive: Instant,
    pub admin_running: bool,
    pub queues: &'a [Arc<QueuePair>],
    pub host: &'a dyn HostStack,
}

#[derive(Debug)]
pub struct HealthMonitor {
    config: HealthConfig,
    next_queue: usize,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            next_queue: 0,
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    pub fn apply_hints(&mut self, hints: HealthHints) {
        hints
            .missing_tx_timeout
            .apply(&mut self.config.missing_tx_timeout_ms);
        hints
            .keep_alive_timeout
            .apply(&mut self.config.keep_alive_timeout_ms);
        if let Some(threshold) = hints.missed_tx_threshold {
            self.config.missed_tx_threshold = threshold;
        }
        info!(?hints, "Applied device health hints");
    }

    pub fn check(&mut self, inputs: &HealthInputs<'_>) -> Option<ResetReason> {
        if let Some(timeout) = self.config.keep_alive_timeout()
            && inputs.now.saturating_duration_since(inputs.last_keep_alive) > timeout
        {
            warn!(timeout_ms = timeout.as_millis() as u64, "Keep-alive timeout");
            return Some(ResetReason::KeepAliveTimeout);
        }

        if !inputs.admin_running {
            warn!("Admin channel is not running");
            return Some(ResetReason::AdminTimeout);
        }

        self.check_queues(inputs)
    }

    /// Round-robin over at most `monitored_queues_per_tick` queues.
    fn check_queues(&mut self, inputs: &HealthInputs<'_>) -> Option<ResetReason> {
        let queues = inputs.queues;
        if queues.is_empty() {
            return None;
        }
        let count = self.config.monitored_queues_per_tick.clamp(1, queues.len());
        let start = self.next_queue % queues.len();
        self.next_queue = (start + count) % queues.len();

        for i in 0..count {
            let queue = &queues[(start + i) % queues.len()];
            if let Some(reason) = self.check_tx(queue, inputs.now) {
                return Some(reason);
            }
            if let Some(reason) = self.check_rx(queue, inputs.host) {
                return Some(reason);
            }
        }
        None
    }

    fn check_tx(&self, queue: &QueuePair, now: Instant) -> Option<ResetReason> {
        let timeout = self.config.missing_tx_timeout()?;
        let scan = queue
            .tx()
            .scan_missing(now, timeout, self.config.stall_multiple);

        if scan.no_interrupt {
            warn!(qid = queue.qid(), "Tx stalled and queue never saw an interrupt");
            return Some(ResetReason::MissingInterrupt);
        }
        if scan.stalled {
            warn!(qid = queue.qid(), "Tx stalled although interrupts fired");
            return Some(ResetReason::TxStall);
        }
        if scan.missed > self.config.missed_tx_threshold {
            warn!(
                qid = queue.qid(),
                missed = scan.missed,
                threshold = self.config.missed_tx_threshold,
                "Too many missing tx completions"
            );
            return Some(ResetReason::MissingTxCompletion);
        }
        None
    }

    fn check_rx(&self, queue: &QueuePair, host: &dyn HostStack) -> Option<ResetReason> {
        // Queue busy in its poll callback; look again next tick.
        let state = queue.try_poll_state()?;
        let rx = state.rx.as_ref()?;

        if queue.interrupt_count() == 0 && rx.has_pending() {
            let ticks = queue.no_interrupt_ticks.fetch_add(1, Ordering::AcqRel) + 1;
            if ticks >= self.config.max_no_interrupt_ticks {
                warn!(qid = queue.qid(), ticks, "Rx work pending without interrupt");
                return Some(ResetReason::MissingInterrupt);
            }
        } else {
            queue.no_interrupt_ticks.store(0, Ordering::Release);
        }

        if rx.posted() == 0 {
            let ticks = queue.empty_rx_ticks.fetch_add(1, Ordering::AcqRel) + 1;
            if ticks >= EMPTY_RX_TICKS {
                queue.empty_rx_ticks.store(0, Ordering::Release);
                queue.stats().inc(QueueCounter::RxEmptyRing);
                debug!(qid = queue.qid(), "Rx ring empty, scheduling refill poll");
                drop(state);
                host.schedule_poll(queue.qid());
            }
        } else {
            queue.empty_rx_ticks.store(0, Ordering::Release);
        }
        None
    }
}

/// Handle to a running watchdog thread.
pub struct Watchdog {
    thread: Option<JoinHandle<()>>,
    shutdown: Sender<()>,
}

impl Watchdog {
    /// Call `tick` every `interval` until stopped.
    pub fn spawn(
        name: &str,
        interval: Duration,
        mut tick: impl FnMut(Instant) + Send + 'static,
    ) -> io::Result<Self> {
        let (shutdown, rx) = crossbeam_channel::bounded::<()>(1);
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                debug!(interval_ms = interval.as_millis() as u64, "Watchdog started");
                loop {
                    match rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => tick(Instant::now()),
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("Watchdog stopped");
            })?;
        Ok(Self {
            thread: Some(thread),
            shutdown,
        })
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Signal the thread and wait for it.
    pub fn stop(&mut self) {
        let _ = self.shutdown.try_send(());
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}
