//! Device lifecycle
//!
//! `Device` owns everything one NIC instance needs: the admin channel, the
//! receive page pool, the queue pairs and the shared flag word. The data
//! path (`submit`, `interrupt`, `poll`, `inject`) never takes the lifecycle
//! lock; it loads the current queue set through `ArcSwap` and checks the
//! flags. `open`, `close`, `set_mtu` and the reset sequence serialize on the
//! lifecycle lock.
//!
//! Reset sequence:
//! 1. A trigger sets RESET_REQUESTED (first reason wins)
//! 2. `service` sees the flag and sets RESET_IN_PROGRESS
//! 3. Teardown: stop traffic, halt polls, free in-flight buffers, destroy
//!    hardware queues, reset the device
//! 4. Reinit: admin init, capability check, queues at the last good sizes
//! 5. Running again, or Failed if step 4 did not complete

use std::io;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::buffer::{DmaMapper, MAX_SGL, PagePool};
use crate::config::EngineConfig;
use crate::error::{AdminError, EngineError, Result, TxError};
use crate::filter::{FilterProgram, FilterSlot};
use crate::flags::{
    ADMIN_UP, DEVICE_RUNNING, DeviceFlags, DeviceState, FAILED, INTERRUPTS_ENABLED,
    RESET_IN_PROGRESS, RESET_REQUESTED, ResetReason,
};
use crate::health::{HealthHints, HealthInputs, HealthMonitor, Watchdog};
use crate::hw::{AdminChannel, Capabilities, Direction, HostStack, HwQueue, HwQueueId, RxQueueHw, TxQueueHw};
use crate::moderation::ModerationEstimator;
use crate::packet::{Frame, OutboundPacket};
use crate::poll::{PollOutcome, PollScheduler};
use crate::queue::{QueueKind, QueuePair};
use crate::rx::{RxEngine, RxParams};
use crate::stats::{CounterSnapshot, DeviceCounter, DeviceStats, QueueStats};
use crate::tx::{MAX_HEADER_PUSH, TxEngine, TxOutcome, TxParams};

/// Smallest MTU the device accepts.
pub const MIN_MTU: u32 = 128;

/// Ethernet header bytes on top of the MTU.
const ETH_HLEN: u32 = 14;

/// Queue pairs of one device generation.
#[derive(Debug, Default)]
pub struct QueueSet {
    pub io: Vec<Arc<QueuePair>>,
    pub redirect: Vec<Arc<QueuePair>>,
}

impl QueueSet {
    pub fn is_empty(&self) -> bool {
        self.io.is_empty() && self.redirect.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<QueuePair>> {
        self.io.iter().chain(self.redirect.iter())
    }

    /// IO queues use qids `0..n`, redirect queues follow.
    pub fn get(&self, qid: u16) -> Option<&Arc<QueuePair>> {
        let qid = qid as usize;
        self.io
            .get(qid)
            .or_else(|| self.redirect.get(qid.checked_sub(self.io.len())?))
    }
}

/// State guarded by the lifecycle lock.
#[derive(Debug)]
struct Lifecycle {
    /// Ring sizes of the last successful queue creation.
    tx_ring_size: u16,
    rx_ring_size: u16,
    mtu: u32,
}

pub struct Device {
    id: Uuid,
    config: EngineConfig,
    admin: Arc<dyn AdminChannel>,
    host: Arc<dyn HostStack>,
    mapper: Arc<dyn DmaMapper>,
    pool: PagePool,
    flags: Arc<DeviceFlags>,
    state: AtomicU8,
    queues: ArcSwap<QueueSet>,
    filter: Arc<FilterSlot>,
    caps: Mutex<Capabilities>,
    lifecycle: Mutex<Lifecycle>,
    health: Mutex<HealthMonitor>,
    last_keep_alive: Mutex<Instant>,
    scheduler: PollScheduler,
    io_stats: Vec<Arc<QueueStats>>,
    redirect_stats: Vec<Arc<QueueStats>>,
    stats: DeviceStats,
}

impl Device {
    /// Bring up the admin channel and allocate device-wide resources.
    ///
    /// The device starts administratively down; call `open` to create
    /// queues.
    pub fn attach(
        config: EngineConfig,
        admin: Arc<dyn AdminChannel>,
        host: Arc<dyn HostStack>,
        mapper: Arc<dyn DmaMapper>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        admin.init()?;
        let caps = admin.read_capabilities()?;
        validate_capabilities(&caps, &config)?;

        let pool = PagePool::new(config.pool_pages(), config.page_size as usize, mapper.clone())?;

        let redirect_count = if config.redirect_queues {
            config.num_queues as usize
        } else {
            0
        };
        let io_stats = (0..config.num_queues)
            .map(|_| Arc::new(QueueStats::new()))
            .collect();
        let redirect_stats = (0..redirect_count)
            .map(|_| Arc::new(QueueStats::new()))
            .collect();

        let flags = Arc::new(DeviceFlags::new());
        flags.set(DEVICE_RUNNING);

        let device = Arc::new(Self {
            id: Uuid::new_v4(),
            scheduler: PollScheduler::new(
                config.poll_budget,
                config.tx_poll_divider,
                &config.moderation,
            ),
            health: Mutex::new(HealthMonitor::new(config.health.clone())),
            lifecycle: Mutex::new(Lifecycle {
                tx_ring_size: config.tx_ring_size,
                rx_ring_size: config.rx_ring_size,
                mtu: config.mtu,
            }),
            config,
            admin,
            host,
            mapper,
            pool,
            flags,
            state: AtomicU8::new(DeviceState::Down as u8),
            queues: ArcSwap::from_pointee(QueueSet::default()),
            filter: Arc::new(FilterSlot::new()),
            caps: Mutex::new(caps),
            last_keep_alive: Mutex::new(Instant::now()),
            io_stats,
            redirect_stats,
            stats: DeviceStats::new(),
        });

        info!(
            device_id = %device.id,
            queues = device.config.num_queues,
            redirect_queues = redirect_count,
            pool_pages = device.pool.capacity(),
            "Device attached"
        );
        Ok(device)
    }

    #[inline]
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn capabilities(&self) -> Capabilities {
        self.caps.lock().unwrap().clone()
    }

    pub fn pool(&self) -> &PagePool {
        &self.pool
    }

    pub fn flags(&self) -> &DeviceFlags {
        &self.flags
    }

    /// TX and RX ring sizes of the current (or next) queue generation.
    pub fn ring_sizes(&self) -> (u16, u16) {
        let lc = self.lifecycle.lock().unwrap();
        (lc.tx_ring_size, lc.rx_ring_size)
    }

    pub fn mtu(&self) -> u32 {
        self.lifecycle.lock().unwrap().mtu
    }

    pub fn queues(&self) -> Arc<QueueSet> {
        self.queues.load_full()
    }

    pub fn queue(&self, qid: u16) -> Option<Arc<QueuePair>> {
        self.queues.load().get(qid).cloned()
    }

    pub fn state(&self) -> DeviceState {
        if self.flags.test(FAILED) {
            return DeviceState::Failed;
        }
        let state = self.stored_state();
        if state == DeviceState::Running && self.flags.test(RESET_REQUESTED) {
            return DeviceState::ResetRequested;
        }
        state
    }

    fn stored_state(&self) -> DeviceState {
        match self.state.load(Ordering::Acquire) {
            1 => DeviceState::Running,
            2 => DeviceState::ResetRequested,
            3 => DeviceState::TearingDown,
            4 => DeviceState::Reinitializing,
            5 => DeviceState::Failed,
            _ => DeviceState::Down,
        }
    }

    fn set_state(&self, state: DeviceState) {
        let prev = self.state.swap(state as u8, Ordering::AcqRel);
        if prev != state as u8 {
            debug!(device_id = %self.id, state = %state, "Device state changed");
        }
    }

    /// Administratively up: create queues, fill RX rings, enable traffic.
    pub fn open(&self) -> Result<()> {
        let mut lc = self.lifecycle.lock().unwrap();
        if self.flags.test(FAILED) {
            return Err(EngineError::Failed);
        }
        if !self.flags.test(DEVICE_RUNNING) {
            return Err(EngineError::InvalidState(self.state()));
        }
        if self.flags.test(ADMIN_UP) {
            return Ok(());
        }

        self.create_queues(&mut lc)?;
        *self.last_keep_alive.lock().unwrap() = Instant::now();
        self.flags.set(ADMIN_UP | INTERRUPTS_ENABLED);
        self.set_state(DeviceState::Running);
        self.stats.inc(DeviceCounter::InterfaceUp);

        info!(
            device_id = %self.id,
            tx_ring = lc.tx_ring_size,
            rx_ring = lc.rx_ring_size,
            mtu = lc.mtu,
            "Device up"
        );
        Ok(())
    }

    /// Administratively down: stop traffic and release every queue.
    pub fn close(&self) -> Result<()> {
        let _lc = self.lifecycle.lock().unwrap();
        if !self.flags.test(ADMIN_UP) {
            return Ok(());
        }

        self.flags.clear(ADMIN_UP | INTERRUPTS_ENABLED);
        let dropped = self.teardown_queues();
        self.set_state(DeviceState::Down);
        self.stats.inc(DeviceCounter::InterfaceDown);

        info!(device_id = %self.id, dropped, "Device down");
        Ok(())
    }

    /// Stop everything and release the admin channel.
    pub fn detach(&self) {
        let _lc = self.lifecycle.lock().unwrap();
        self.flags.clear(ADMIN_UP | INTERRUPTS_ENABLED);
        let dropped = self.teardown_queues();
        self.flags.clear(DEVICE_RUNNING);
        self.admin.shutdown();
        if !self.flags.test(FAILED) {
            self.set_state(DeviceState::Down);
        }
        info!(device_id = %self.id, dropped, "Device detached");
    }

    /// Create every queue pair, halving ring sizes while the device is out
    /// of memory.
    fn create_queues(&self, lc: &mut Lifecycle) -> Result<()> {
        loop {
            match self.try_create_queues(lc.tx_ring_size, lc.rx_ring_size, lc.mtu) {
                Ok(set) => {
                    for queue in set.io.iter() {
                        let posted = queue.fill_rx();
                        let want = lc.rx_ring_size;
                        if posted < want {
                            warn!(qid = queue.qid(), posted, want, "Rx ring not fully filled");
                        }
                    }
                    self.queues.store(Arc::new(set));
                    return Ok(());
                }
                Err(EngineError::Admin(AdminError::NoMemory)) => {
                    let (tx, rx) = (lc.tx_ring_size, lc.rx_ring_size);
                    let (new_tx, new_rx) = match tx.cmp(&rx) {
                        std::cmp::Ordering::Equal => (tx / 2, rx / 2),
                        std::cmp::Ordering::Greater => (tx / 2, rx),
                        std::cmp::Ordering::Less => (tx, rx / 2),
                    };
                    if new_tx < self.config.min_ring_size || new_rx < self.config.min_ring_size {
                        error!(
                            tx_ring = tx,
                            rx_ring = rx,
                            min = self.config.min_ring_size,
                            "Queue creation failed at minimum ring size"
                        );
                        return Err(AdminError::NoMemory.into());
                    }
                    warn!(
                        tx_ring = new_tx,
                        rx_ring = new_rx,
                        "Device out of memory, retrying with smaller rings"
                    );
                    self.stats.inc(DeviceCounter::RingSizeBackoff);
                    lc.tx_ring_size = new_tx;
                    lc.rx_ring_size = new_rx;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One creation attempt. Hardware queues created before a failure are
    /// destroyed again.
    fn try_create_queues(&self, tx_size: u16, rx_size: u16, mtu: u32) -> Result<QueueSet> {
        let mut created = Vec::new();
        let result = self.build_queue_set(tx_size, rx_size, mtu, &mut created);
        if result.is_err() {
            for id in created {
                self.admin.destroy_queue(id);
            }
        }
        result
    }

    fn build_queue_set(
        &self,
        tx_size: u16,
        rx_size: u16,
        mtu: u32,
        created: &mut Vec<HwQueueId>,
    ) -> Result<QueueSet> {
        let caps = self.caps.lock().unwrap().clone();
        let tx_params = self.tx_params(&caps);
        let rx_params = self.rx_params(&caps, rx_size, mtu);
        let numa = self.config.numa_node;
        let mut set = QueueSet::default();

        for (i, stats) in self.io_stats.iter().enumerate() {
            let qid = i as u16;
            let tx_hw = self.create_tx(tx_size, numa, created)?;
            let rx_hw = self.create_rx(rx_size, numa, created)?;
            let interrupts = Arc::new(AtomicU64::new(0));

            let tx = TxEngine::new(
                qid,
                tx_size,
                tx_hw,
                tx_params,
                self.mapper.clone(),
                self.flags.clone(),
                stats.clone(),
                interrupts.clone(),
            )?;
            let rx = RxEngine::new(
                qid,
                rx_size,
                rx_hw,
                rx_params,
                self.pool.clone(),
                self.flags.clone(),
                stats.clone(),
                self.filter.clone(),
            )?;
            set.io.push(Arc::new(QueuePair::new(
                qid,
                QueueKind::Io,
                tx,
                Some(rx),
                ModerationEstimator::new(&self.config.moderation),
                stats.clone(),
                interrupts,
            )));
        }

        let base = self.io_stats.len();
        for (i, stats) in self.redirect_stats.iter().enumerate() {
            let qid = (base + i) as u16;
            let tx_hw = self.create_tx(tx_size, numa, created)?;
            let interrupts = Arc::new(AtomicU64::new(0));
            let tx = TxEngine::new(
                qid,
                tx_size,
                tx_hw,
                tx_params,
                self.mapper.clone(),
                self.flags.clone(),
                stats.clone(),
                interrupts.clone(),
            )?;
            set.redirect.push(Arc::new(QueuePair::new(
                qid,
                QueueKind::Redirect,
                tx,
                None,
                ModerationEstimator::new(&self.config.moderation),
                stats.clone(),
                interrupts,
            )));
        }

        debug!(
            io = set.io.len(),
            redirect = set.redirect.len(),
            tx_size,
            rx_size,
            "Queue pairs created"
        );
        Ok(set)
    }

    fn create_tx(
        &self,
        size: u16,
        numa: Option<u32>,
        created: &mut Vec<HwQueueId>,
    ) -> Result<Box<dyn TxQueueHw>> {
        match self.admin.create_queue(Direction::Tx, size, numa)? {
            HwQueue::Tx(q) => {
                created.push(q.id());
                Ok(q)
            }
            other => {
                self.admin.destroy_queue(other.id());
                Err(EngineError::Capability(
                    "device returned an rx queue for a tx request".into(),
                ))
            }
        }
    }

    fn create_rx(
        &self,
        size: u16,
        numa: Option<u32>,
        created: &mut Vec<HwQueueId>,
    ) -> Result<Box<dyn RxQueueHw>> {
        match self.admin.create_queue(Direction::Rx, size, numa)? {
            HwQueue::Rx(q) => {
                created.push(q.id());
                Ok(q)
            }
            other => {
                self.admin.destroy_queue(other.id());
                Err(EngineError::Capability(
                    "device returned a tx queue for an rx request".into(),
                ))
            }
        }
    }

    fn tx_params(&self, caps: &Capabilities) -> TxParams {
        TxParams {
            max_segments: self
                .config
                .max_segments
                .min(caps.max_segments_per_packet) as usize,
            header_push: caps.header_push_size as usize,
            burst_limit: caps.max_tx_burst,
        }
    }

    fn rx_params(&self, caps: &Capabilities, rx_size: u16, mtu: u32) -> RxParams {
        RxParams {
            headroom: self.config.rx_headroom as usize,
            copybreak: self.config.rx_copybreak as usize,
            max_segments: (caps.max_segments_per_packet as usize).min(MAX_SGL),
            refill_threshold: (rx_size / self.config.rx_refill_divider)
                .min(self.config.rx_refill_max),
            max_offset_shift: self.config.max_rx_offset_shift,
            mtu,
        }
    }

    /// Swap in an empty queue set, halt every old queue and destroy its
    /// hardware queues. Returns the number of buffers freed.
    fn teardown_queues(&self) -> usize {
        let old = self.queues.swap(Arc::new(QueueSet::default()));
        let mut dropped = 0;
        for queue in old.iter() {
            dropped += queue.halt();
            for id in queue.hw_ids() {
                self.admin.destroy_queue(*id);
            }
        }
        dropped
    }

    /// Hand a packet to the queue selected by its hint.
    pub fn submit(&self, packet: OutboundPacket, more: bool) -> std::result::Result<TxOutcome, TxError> {
        if self.flags.test(FAILED) {
            return Err(TxError::DeviceFailed);
        }
        let set = self.queues.load();
        if set.io.is_empty() {
            return Ok(TxOutcome::Busy(packet));
        }
        let qid = packet.queue_hint.unwrap_or(0) as usize % set.io.len();
        set.io[qid].tx().submit(packet, more)
    }

    /// Bulk transmit on a redirect queue. Returns how many frames were
    /// queued; frames that do not fit are dropped.
    pub fn inject(
        &self,
        hint: u16,
        frames: impl IntoIterator<Item = Frame>,
        flush: bool,
    ) -> std::result::Result<usize, TxError> {
        if self.flags.test(FAILED) {
            return Err(TxError::DeviceFailed);
        }
        let set = self.queues.load();
        if set.redirect.is_empty() {
            return Err(TxError::NoQueue(hint));
        }
        let queue = &set.redirect[hint as usize % set.redirect.len()];
        Ok(queue.tx().xmit_frames(frames, flush))
    }

    /// Interrupt for `qid` fired. Returns true if a poll should be
    /// scheduled.
    pub fn interrupt(&self, qid: u16) -> bool {
        match self.queues.load().get(qid) {
            Some(queue) => queue.interrupt(),
            None => false,
        }
    }

    /// Run the poll callback of `qid`.
    pub fn poll(&self, qid: u16) -> PollOutcome {
        let set = self.queues.load();
        let Some(queue) = set.get(qid) else {
            return PollOutcome::Halted;
        };
        self.scheduler
            .run(queue, &self.flags, self.host.as_ref(), &set.redirect)
    }

    /// Install or remove the receive filter. Returns the previous program.
    pub fn set_filter(&self, program: Option<FilterProgram>) -> Result<Option<Arc<FilterProgram>>> {
        if let Some(program) = &program {
            let mtu = self.mtu();
            if mtu + ETH_HLEN > self.config.rx_buffer_len() as u32 {
                return Err(EngineError::Capability(format!(
                    "MTU {mtu} too large for a filter program"
                )));
            }
            if !self.config.redirect_queues {
                warn!(program = program.name(), "Filter installed without redirect queues");
            }
            info!(device_id = %self.id, program = program.name(), "Filter program installed");
        } else {
            info!(device_id = %self.id, "Filter program removed");
        }
        Ok(self.filter.install(program))
    }

    pub fn filter_installed(&self) -> bool {
        self.filter.is_installed()
    }

    pub fn set_mtu(&self, mtu: u32) -> Result<()> {
        let mut lc = self.lifecycle.lock().unwrap();
        let max = self.caps.lock().unwrap().max_mtu;
        if !(MIN_MTU..=max).contains(&mtu) {
            return Err(EngineError::Capability(format!(
                "MTU {mtu} outside {MIN_MTU}..={max}"
            )));
        }
        if self.filter.is_installed() && mtu + ETH_HLEN > self.config.rx_buffer_len() as u32 {
            return Err(EngineError::Capability(format!(
                "MTU {mtu} too large while a filter program is installed"
            )));
        }
        self.admin.set_mtu(mtu)?;
        for queue in self.queues.load().io.iter() {
            queue.set_rx_mtu(mtu);
        }
        info!(device_id = %self.id, old = lc.mtu, new = mtu, "MTU changed");
        lc.mtu = mtu;
        Ok(())
    }

    /// Device heartbeat arrived.
    pub fn keep_alive(&self) {
        *self.last_keep_alive.lock().unwrap() = Instant::now();
        self.stats.inc(DeviceCounter::KeepAlives);
    }

    pub fn apply_hints(&self, hints: HealthHints) {
        self.health.lock().unwrap().apply_hints(hints);
    }

    /// Ask for a reset. Returns true if this call moved the device into the
    /// reset-requested state.
    pub fn request_reset(&self, reason: ResetReason) -> bool {
        let first = self.flags.request_reset(reason);
        if first {
            info!(device_id = %self.id, reason = %reason, "Reset requested");
        }
        first
    }

    /// Operator-triggered reset, carried out before returning.
    pub fn force_reset(&self) -> Result<()> {
        self.request_reset(ResetReason::UserRequest);
        self.run_reset()
    }

    /// One watchdog tick: health checks, then any pending reset.
    pub fn service(&self, now: Instant) {
        self.stats.inc(DeviceCounter::WatchdogTicks);
        if self.flags.test(FAILED) || !self.flags.test(DEVICE_RUNNING) {
            return;
        }

        if !self.flags.test(RESET_REQUESTED | RESET_IN_PROGRESS) {
            let set = self.queues.load();
            let queues: Vec<Arc<QueuePair>> = if self.flags.test(ADMIN_UP) {
                set.iter().cloned().collect()
            } else {
                Vec::new()
            };
            let inputs = HealthInputs {
                now,
                last_keep_alive: *self.last_keep_alive.lock().unwrap(),
                admin_running: self.admin.is_running(),
                queues: &queues,
                host: self.host.as_ref(),
            };
            let verdict = self.health.lock().unwrap().check(&inputs);
            if let Some(reason) = verdict {
                self.request_reset(reason);
            }
        }

        if self.flags.test(RESET_REQUESTED)
            && let Err(e) = self.run_reset()
        {
            error!(device_id = %self.id, error = %e, "Device reset failed");
        }
    }

    /// Carry out a pending reset.
    fn run_reset(&self) -> Result<()> {
        let mut lc = self.lifecycle.lock().unwrap();
        if self.flags.test(FAILED) {
            return Err(EngineError::Failed);
        }
        if !self.flags.test(RESET_REQUESTED) {
            return Ok(());
        }

        // Includes requests raised by the engines on the flags.
        self.stats.inc(DeviceCounter::ResetRequests);
        let reason = self.flags.reset_reason().unwrap_or(ResetReason::Normal);
        let was_up = self.flags.test(ADMIN_UP);
        let started = Instant::now();

        // 1. Teardown. Later triggers are ignored from here on.
        self.flags.set(RESET_IN_PROGRESS);
        self.set_state(DeviceState::TearingDown);
        info!(device_id = %self.id, reason = %reason, "Resetting device");

        self.flags.clear(ADMIN_UP | INTERRUPTS_ENABLED);
        let dropped = self.teardown_queues();
        self.admin.reset(reason);
        self.flags.take_reset_reason();
        self.flags.clear(RESET_REQUESTED);

        // 2. Reinit.
        self.set_state(DeviceState::Reinitializing);
        match self.reinitialize(&mut lc, was_up) {
            Ok(()) => {
                self.flags.clear(RESET_IN_PROGRESS);
                self.set_state(if was_up {
                    DeviceState::Running
                } else {
                    DeviceState::Down
                });
                self.stats.inc(DeviceCounter::Resets);
                info!(
                    device_id = %self.id,
                    reason = %reason,
                    dropped,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Device reset complete"
                );
                Ok(())
            }
            Err(e) => {
                self.flags.set(FAILED);
                self.flags.clear(RESET_IN_PROGRESS);
                self.set_state(DeviceState::Failed);
                self.stats.inc(DeviceCounter::ResetFailures);
                error!(device_id = %self.id, reason = %reason, error = %e, "Device reinitialization failed");
                Err(e)
            }
        }
    }

    fn reinitialize(&self, lc: &mut Lifecycle, was_up: bool) -> Result<()> {
        self.admin.init()?;
        let caps = self.admin.read_capabilities()?;
        validate_capabilities(&caps, &self.config)?;
        *self.caps.lock().unwrap() = caps;

        if lc.mtu != self.config.mtu {
            self.admin.set_mtu(lc.mtu)?;
        }
        *self.last_keep_alive.lock().unwrap() = Instant::now();

        if was_up {
            self.create_queues(lc)?;
            self.flags.set(ADMIN_UP | INTERRUPTS_ENABLED);
        }
        Ok(())
    }

    /// Run `service` on a dedicated thread every `interval`, or every
    /// configured service interval when `None`.
    pub fn spawn_watchdog(self: &Arc<Self>, interval: Option<Duration>) -> io::Result<Watchdog> {
        let interval = interval.unwrap_or_else(|| self.config.health.service_interval());
        let device = Arc::downgrade(self);
        Watchdog::spawn("nic-watchdog", interval, move |now| {
            if let Some(device) = device.upgrade() {
                device.service(now);
            }
        })
    }

    pub fn counters(&self) -> CounterSnapshot {
        let set = self.queues.load();
        let pending_reset = if self.flags.test(RESET_REQUESTED) {
            self.flags.reset_reason()
        } else {
            None
        };
        CounterSnapshot {
            device_id: self.id.to_string(),
            state: self.state(),
            pending_reset,
            device: self.stats.snapshot(),
            pool_available: self.pool.available(),
            queues: set.iter().map(|q| q.snapshot()).collect(),
        }
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

/// The running configuration must fit what the device advertises.
fn validate_capabilities(caps: &Capabilities, config: &EngineConfig) -> Result<()> {
    let needed = if config.redirect_queues {
        config.num_queues * 2
    } else {
        config.num_queues
    };
    if caps.max_queues < needed {
        return Err(EngineError::Capability(format!(
            "device supports {} queues, configuration needs {needed}",
            caps.max_queues
        )));
    }
    if caps.max_segments_per_packet == 0 {
        return Err(EngineError::Capability(
            "device accepts no tx segments".into(),
        ));
    }
    if caps.header_push_size as usize > MAX_HEADER_PUSH {
        return Err(EngineError::Capability(format!(
            "header push size {} exceeds {MAX_HEADER_PUSH}",
            caps.header_push_size
        )));
    }
    if config.mtu > caps.max_mtu {
        return Err(EngineError::Capability(format!(
            "MTU {} exceeds device maximum {}",
            config.mtu, caps.max_mtu
        )));
    }
    Ok(())
}
