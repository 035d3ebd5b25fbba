//! Device lifecycle, health monitoring and reset integration tests

mod harness;

use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use harness::{TestDevice, small_config, tight_config};
use mvirt_nic::config::HealthConfig;
use mvirt_nic::error::{AdminError, ConfigError, EngineError};
use mvirt_nic::health::{HealthHints, TimeoutHint};
use mvirt_nic::hw::{AdminChannel, Direction};
use mvirt_nic::stats::{DeviceCounter, QueueCounter};
use mvirt_nic::test_util::{SimNic, sequenced_frame};
use mvirt_nic::{
    DeviceState, EngineConfig, OutboundPacket, PollOutcome, ResetReason, TxError, TxOutcome,
};

fn submit(t: &TestDevice, qid: u16, count: u32) -> usize {
    (0..count)
        .filter(|seq| {
            let packet = OutboundPacket::new(sequenced_frame(*seq, 128)).queue(qid);
            matches!(
                t.device.submit(packet, false),
                Ok(TxOutcome::Queued { .. })
            )
        })
        .count()
}

fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

// ============================================================================
// Reset sequence
// ============================================================================

#[test]
fn test_bogus_tx_completion_resets_device() {
    let t = TestDevice::up(small_config());
    let baseline = t.mapper.live_mappings();
    assert_eq!(submit(&t, 0, 4), 4);

    t.nic.tx(0).inject_completion(1000);
    assert_eq!(t.pump(0), PollOutcome::Halted);
    assert_eq!(t.device.state(), DeviceState::ResetRequested);
    assert_eq!(
        t.device.counters().pending_reset,
        Some(ResetReason::InvalidTxReqId)
    );

    // No traffic while the reset is pending.
    let packet = OutboundPacket::new(sequenced_frame(0, 64));
    assert!(matches!(
        t.device.submit(packet, false),
        Ok(TxOutcome::Busy(_))
    ));
    assert_eq!(t.device.poll(1), PollOutcome::Halted);

    t.device.service(Instant::now());
    assert_eq!(t.device.state(), DeviceState::Running);
    assert_eq!(t.nic.resets(), vec![ResetReason::InvalidTxReqId]);
    assert_eq!(t.device.counters().device(DeviceCounter::Resets), 1);
    assert_eq!(
        t.device.counters().device(DeviceCounter::ResetRequests),
        1
    );
    assert_eq!(t.device.counters().pending_reset, None);

    // In-flight requests were released and fresh queues were created.
    assert_eq!(t.nic.live_queues(), 6);
    assert_eq!(t.mapper.live_mappings(), baseline);
    assert_eq!(submit(&t, 0, 3), 3);
    assert_eq!(t.nic.tx(0).outstanding(), 3);
}

#[test]
fn test_counters_survive_reset() {
    let t = TestDevice::up(small_config());
    submit(&t, 0, 5);
    t.device.force_reset().unwrap();
    submit(&t, 0, 2);

    let counters = t.device.counters();
    assert_eq!(counters.total(QueueCounter::TxPackets), 7);
    assert_eq!(counters.device(DeviceCounter::InterfaceUp), 1);
}

#[test]
fn test_first_reset_reason_wins() {
    let t = TestDevice::up(small_config());
    assert!(t.device.request_reset(ResetReason::TxStall));
    assert!(!t.device.request_reset(ResetReason::KeepAliveTimeout));
    assert!(!t.device.request_reset(ResetReason::MissingInterrupt));

    t.device.service(Instant::now());
    t.device.service(Instant::now());
    assert_eq!(t.nic.resets(), vec![ResetReason::TxStall]);
    assert_eq!(t.device.counters().device(DeviceCounter::ResetRequests), 1);
    assert_eq!(t.device.counters().device(DeviceCounter::Resets), 1);
}

#[test]
fn test_concurrent_reset_requests_collapse() {
    let t = TestDevice::up(small_config());
    let device = t.device.clone();
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let device = device.clone();
            std::thread::spawn(move || device.request_reset(ResetReason::MissingInterrupt))
        })
        .collect();
    let winners = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|won| *won)
        .count();
    assert_eq!(winners, 1);

    t.device.service(Instant::now());
    assert_eq!(t.nic.resets().len(), 1);
}

#[test]
fn test_reinit_failure_is_terminal() {
    let t = TestDevice::up(small_config());
    submit(&t, 0, 3);
    t.nic.fail_init(true);

    let err = t.device.force_reset().unwrap_err();
    assert!(matches!(err, EngineError::Admin(AdminError::Timeout)));
    assert_eq!(t.device.state(), DeviceState::Failed);
    assert_eq!(t.nic.live_queues(), 0);
    assert_eq!(t.device.counters().device(DeviceCounter::ResetFailures), 1);

    let packet = OutboundPacket::new(sequenced_frame(0, 64));
    assert!(matches!(
        t.device.submit(packet, false),
        Err(TxError::DeviceFailed)
    ));
    assert!(!t.device.request_reset(ResetReason::UserRequest));
    assert!(matches!(t.device.open(), Err(EngineError::Failed)));

    // Nothing retries on its own.
    t.nic.fail_init(false);
    t.device.service(Instant::now());
    assert_eq!(t.device.state(), DeviceState::Failed);
}

#[test]
fn test_reset_while_down_stays_down() {
    let t = TestDevice::attach(small_config());
    t.device.force_reset().unwrap();
    assert_eq!(t.device.state(), DeviceState::Down);
    assert_eq!(t.nic.live_queues(), 0);
    assert_eq!(t.nic.init_calls(), 2);
}

#[test]
fn test_reset_restores_mtu() {
    let t = TestDevice::up(small_config());
    t.device.set_mtu(4000).unwrap();
    t.device.force_reset().unwrap();
    assert_eq!(t.device.mtu(), 4000);
    assert_eq!(t.nic.mtu(), 4000);
}

// ============================================================================
// Health checks
// ============================================================================

#[test]
fn test_healthy_device_is_left_alone() {
    let t = TestDevice::up(small_config());
    submit(&t, 0, 4);
    for _ in 0..5 {
        t.device.keep_alive();
        t.device.service(Instant::now());
    }
    assert_eq!(t.device.state(), DeviceState::Running);
    assert!(t.nic.resets().is_empty());
    assert_eq!(t.device.counters().device(DeviceCounter::WatchdogTicks), 5);
}

#[test]
fn test_keep_alive_timeout() {
    let mut config = small_config();
    config.health.keep_alive_timeout_ms = Some(100);
    let t = TestDevice::up(config);

    t.device.service(Instant::now() + Duration::from_millis(200));
    assert_eq!(t.nic.resets(), vec![ResetReason::KeepAliveTimeout]);
    assert_eq!(t.device.state(), DeviceState::Running);
}

#[test]
fn test_keep_alive_hint_disables_check() {
    let mut config = small_config();
    config.health.keep_alive_timeout_ms = Some(100);
    let t = TestDevice::up(config);
    t.device.apply_hints(HealthHints {
        keep_alive_timeout: TimeoutHint::Disabled,
        ..Default::default()
    });

    t.device.service(Instant::now() + Duration::from_secs(10));
    assert!(t.nic.resets().is_empty());
}

#[test]
fn test_dead_admin_channel() {
    let t = TestDevice::up(small_config());
    t.nic.set_running(false);
    t.device.service(Instant::now());
    assert_eq!(t.nic.resets(), vec![ResetReason::AdminTimeout]);
    assert_eq!(t.device.state(), DeviceState::Running);
}

#[test]
fn test_missing_tx_completions() {
    let mut config = small_config();
    config.health = HealthConfig {
        missing_tx_timeout_ms: Some(10),
        missed_tx_threshold: 2,
        stall_multiple: 100,
        ..Default::default()
    };
    let t = TestDevice::up(config);
    assert_eq!(submit(&t, 0, 3), 3);

    t.device.service(Instant::now() + Duration::from_millis(50));
    assert_eq!(t.nic.resets(), vec![ResetReason::MissingTxCompletion]);
    let counters = t.device.counters();
    assert_eq!(counters.total(QueueCounter::TxMissedCompletions), 3);
}

#[test]
fn test_missed_completions_below_threshold() {
    let mut config = small_config();
    config.health = HealthConfig {
        missing_tx_timeout_ms: Some(10),
        missed_tx_threshold: 2,
        stall_multiple: 100,
        ..Default::default()
    };
    let t = TestDevice::up(config);
    submit(&t, 0, 2);

    t.device.service(Instant::now() + Duration::from_millis(50));
    assert!(t.nic.resets().is_empty());
}

#[test]
fn test_missing_tx_hint_overrides_timeout() {
    let mut config = small_config();
    config.health.stall_multiple = 100;
    let t = TestDevice::up(config);
    t.device.apply_hints(HealthHints {
        missing_tx_timeout: TimeoutHint::Millis(10),
        missed_tx_threshold: Some(0),
        ..Default::default()
    });
    submit(&t, 1, 1);

    t.device.service(Instant::now() + Duration::from_millis(15));
    assert_eq!(t.nic.resets(), vec![ResetReason::MissingTxCompletion]);
}

#[test]
fn test_tx_stall_with_interrupts() {
    let mut config = small_config();
    config.health.missing_tx_timeout_ms = Some(10);
    let t = TestDevice::up(config);
    submit(&t, 0, 1);
    t.pump(0);

    t.device.service(Instant::now() + Duration::from_millis(30));
    assert_eq!(t.nic.resets(), vec![ResetReason::TxStall]);
}

#[test]
fn test_tx_stall_without_interrupts() {
    let mut config = small_config();
    config.health.missing_tx_timeout_ms = Some(10);
    let t = TestDevice::up(config);
    submit(&t, 0, 1);

    t.device.service(Instant::now() + Duration::from_millis(30));
    assert_eq!(t.nic.resets(), vec![ResetReason::MissingInterrupt]);
}

#[test]
fn test_rx_work_without_interrupt() {
    let t = TestDevice::up(small_config());
    t.nic.rx(0).receive(&sequenced_frame(0, 100));

    t.device.service(Instant::now());
    t.device.service(Instant::now());
    assert!(t.nic.resets().is_empty());
    t.device.service(Instant::now());
    assert_eq!(t.nic.resets(), vec![ResetReason::MissingInterrupt]);
}

#[test]
fn test_empty_rx_ring_schedules_poll() {
    let t = TestDevice::up(tight_config());
    let rx = t.nic.rx(0);
    for seq in 0..16 {
        assert!(rx.receive(&sequenced_frame(seq, 1000)));
    }
    t.pump(0);
    let queue = t.device.queue(0).unwrap();
    assert_eq!(queue.rx_posted(), 0);

    t.device.service(Instant::now());
    assert!(t.host.poll_requests().is_empty());
    t.device.service(Instant::now());
    assert_eq!(t.host.poll_requests(), vec![0]);
    assert_eq!(queue.stats().get(QueueCounter::RxEmptyRing), 1);
    assert!(t.nic.resets().is_empty());

    // The host frees its pages and runs the requested poll.
    drop(t.host.take());
    t.device.poll(0);
    assert_eq!(queue.rx_posted(), 16);
}

#[test]
fn test_watchdog_thread_runs_reset() {
    let t = TestDevice::up(small_config());
    let mut watchdog = t
        .device
        .spawn_watchdog(Some(Duration::from_millis(5)))
        .expect("Failed to spawn watchdog");
    assert!(watchdog.is_running());

    submit(&t, 0, 1);
    t.nic.tx(0).inject_completion(1000);
    t.pump(0);

    let device = t.device.clone();
    let nic = t.nic.clone();
    assert!(wait_for(|| {
        nic.resets().len() == 1 && device.state() == DeviceState::Running
    }));
    assert_eq!(t.nic.resets(), vec![ResetReason::InvalidTxReqId]);

    watchdog.stop();
    assert!(!watchdog.is_running());
}

// ============================================================================
// Bring-up
// ============================================================================

#[test]
fn test_ring_sizes_back_off_on_device_memory_pressure() {
    let nic = Arc::new(SimNic::new());
    nic.limit_queue_size(Some(256));
    let config = EngineConfig {
        num_queues: 1,
        tx_ring_size: 1024,
        rx_ring_size: 512,
        redirect_queues: false,
        rx_pool_pages: Some(600),
        ..Default::default()
    };
    let t = TestDevice::attach_to(config, nic);
    t.device.open().unwrap();

    assert_eq!(t.device.ring_sizes(), (256, 256));
    assert_eq!(
        t.device.counters().device(DeviceCounter::RingSizeBackoff),
        2
    );
    assert_eq!(
        t.nic.created(),
        vec![(Direction::Tx, 256), (Direction::Rx, 256)]
    );
    assert_eq!(t.device.queue(0).unwrap().rx_posted(), 256);

    // Later generations keep the reduced sizes.
    t.device.force_reset().unwrap();
    assert_eq!(t.nic.created()[2..], [(Direction::Tx, 256), (Direction::Rx, 256)]);
}

#[test]
fn test_backoff_gives_up_at_minimum() {
    let nic = Arc::new(SimNic::new());
    nic.limit_queue_size(Some(64));
    let config = EngineConfig {
        num_queues: 1,
        tx_ring_size: 512,
        rx_ring_size: 512,
        redirect_queues: false,
        rx_pool_pages: Some(600),
        ..Default::default()
    };
    let t = TestDevice::attach_to(config, nic);

    let err = t.device.open().unwrap_err();
    assert!(matches!(err, EngineError::Admin(AdminError::NoMemory)));
    assert_eq!(t.device.state(), DeviceState::Down);
    assert_eq!(t.nic.live_queues(), 0);
}

#[test]
fn test_partial_creation_is_rolled_back() {
    let nic = Arc::new(SimNic::new());
    nic.limit_queue_size(Some(64));
    let config = EngineConfig {
        tx_ring_size: 64,
        rx_ring_size: 128,
        min_ring_size: 64,
        ..small_config()
    };
    let t = TestDevice::attach_to(config, nic);
    t.device.open().unwrap();

    // The first TX queue was created before its RX queue failed.
    let created = t.nic.created();
    assert_eq!(created.len(), 7);
    assert_eq!(created[0], (Direction::Tx, 64));
    assert_eq!(created[2], (Direction::Rx, 64));
    assert_eq!(t.nic.live_queues(), 6);
    assert_eq!(t.device.ring_sizes(), (64, 64));
}

#[test]
fn test_close_and_reopen() {
    let t = TestDevice::up(small_config());
    submit(&t, 0, 10);
    t.device.close().unwrap();
    assert_eq!(t.device.state(), DeviceState::Down);
    assert_eq!(t.nic.live_queues(), 0);
    assert_eq!(t.device.pool().available(), 512);
    assert_eq!(t.mapper.live_mappings(), 0);

    t.device.open().unwrap();
    assert_eq!(t.device.state(), DeviceState::Running);
    assert_eq!(submit(&t, 0, 2), 2);

    let counters = t.device.counters();
    assert_eq!(counters.device(DeviceCounter::InterfaceUp), 2);
    assert_eq!(counters.device(DeviceCounter::InterfaceDown), 1);
}

#[test]
fn test_detach_shuts_down_admin_channel() {
    let t = TestDevice::up(small_config());
    t.device.detach();
    assert_eq!(t.nic.live_queues(), 0);
    assert!(!t.nic.is_running());
    assert!(matches!(t.device.open(), Err(EngineError::InvalidState(_))));
}

#[test]
fn test_config_file_drives_attach() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{"num_queues": 1, "tx_ring_size": 128, "rx_ring_size": 128,
            "min_ring_size": 64, "rx_pool_pages": 200,
            "health": {{"keep_alive_timeout_ms": null}}}}"#
    )
    .unwrap();

    let config = EngineConfig::from_file(file.path()).unwrap();
    assert_eq!(config.health.keep_alive_timeout_ms, None);
    let t = TestDevice::up(config);
    assert_eq!(t.device.queues().io.len(), 1);
    assert_eq!(t.device.queues().redirect.len(), 1);
    assert_eq!(t.device.queue(0).unwrap().rx_posted(), 128);
}

#[test]
fn test_invalid_config_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, r#"{{"num_queues": 0}}"#).unwrap();
    assert!(matches!(
        EngineConfig::from_file(file.path()),
        Err(ConfigError::Invalid(_))
    ));

    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "not json").unwrap();
    assert!(matches!(
        EngineConfig::from_file(file.path()),
        Err(ConfigError::Parse(_))
    ));
}
