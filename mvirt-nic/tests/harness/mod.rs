//! Test harness for device-level integration tests
//!
//! Wires a `Device` to the simulated adapter and a recording host stack.

#![allow(dead_code)]

use std::sync::Arc;

use mvirt_nic::buffer::DmaMapper;
use mvirt_nic::test_util::{FlakyMapper, RecordingHost, SimNic};
use mvirt_nic::{Device, EngineConfig, PollOutcome};

/// Polls per interrupt before giving up on a queue.
const MAX_POLL_ROUNDS: usize = 64;

pub struct TestDevice {
    pub device: Arc<Device>,
    pub nic: Arc<SimNic>,
    pub host: Arc<RecordingHost>,
    pub mapper: Arc<FlakyMapper>,
}

impl TestDevice {
    pub fn attach(config: EngineConfig) -> Self {
        Self::attach_to(config, Arc::new(SimNic::new()))
    }

    pub fn attach_to(config: EngineConfig, nic: Arc<SimNic>) -> Self {
        let _ = tracing_subscriber::fmt::try_init();
        let host = Arc::new(RecordingHost::new());
        let mapper = Arc::new(FlakyMapper::new());
        let device = Device::attach(
            config,
            nic.clone(),
            host.clone(),
            mapper.clone() as Arc<dyn DmaMapper>,
        )
        .expect("Failed to attach device");
        Self {
            device,
            nic,
            host,
            mapper,
        }
    }

    /// Attach and open.
    pub fn up(config: EngineConfig) -> Self {
        let t = Self::attach(config);
        t.device.open().expect("Failed to open device");
        t
    }

    /// Fire the interrupt of `qid` and poll until the queue is done.
    pub fn pump(&self, qid: u16) -> PollOutcome {
        self.device.interrupt(qid);
        let mut outcome = PollOutcome::Halted;
        for _ in 0..MAX_POLL_ROUNDS {
            outcome = self.device.poll(qid);
            if outcome != PollOutcome::Reschedule {
                break;
            }
        }
        outcome
    }

    /// Pump every queue once.
    pub fn pump_all(&self) {
        let set = self.device.queues();
        for queue in set.iter() {
            self.pump(queue.qid());
        }
    }
}

/// Small device: two IO queues, two redirect queues, 64-entry rings.
pub fn small_config() -> EngineConfig {
    EngineConfig {
        num_queues: 2,
        tx_ring_size: 64,
        rx_ring_size: 64,
        min_ring_size: 16,
        rx_pool_pages: Some(512),
        ..Default::default()
    }
}

/// One IO queue, no redirect queues, and a pool that exactly fills the
/// receive ring.
pub fn tight_config() -> EngineConfig {
    EngineConfig {
        num_queues: 1,
        tx_ring_size: 32,
        rx_ring_size: 16,
        min_ring_size: 8,
        rx_pool_pages: Some(16),
        redirect_queues: false,
        ..Default::default()
    }
}
