//! Transmit path integration tests
//!
//! Host packets go through `Device::submit`, the simulated device reads
//! them out of the mapped buffers, and completions come back through the
//! poll callback.

mod harness;

use std::sync::Arc;

use harness::{TestDevice, small_config};
use mvirt_nic::error::HwError;
use mvirt_nic::flags::ResetReason;
use mvirt_nic::hw::Capabilities;
use mvirt_nic::stats::QueueCounter;
use mvirt_nic::test_util::{SimNic, parse_udp_frame, sequenced_frame};
use mvirt_nic::{DeviceState, Frame, OutboundPacket, PollOutcome, TxError, TxOutcome};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

fn queued(outcome: &TxOutcome) -> bool {
    matches!(outcome, TxOutcome::Queued { .. })
}

fn caps_with(f: impl FnOnce(&mut Capabilities)) -> Arc<SimNic> {
    let mut caps = Capabilities {
        max_queues: 32,
        max_segments_per_packet: 17,
        header_push_size: 0,
        supports_offloads: true,
        max_tx_burst: None,
        max_mtu: 9216,
    };
    f(&mut caps);
    Arc::new(SimNic::with_capabilities(caps))
}

#[test]
fn test_frames_reach_the_wire_in_order() {
    let t = TestDevice::up(small_config());

    for seq in 0..10 {
        let packet = OutboundPacket::new(sequenced_frame(seq, 200)).queue(1);
        let outcome = t.device.submit(packet, seq < 9).expect("Submit failed");
        assert!(queued(&outcome));
    }

    let wire = t.nic.tx(1);
    assert_eq!(wire.outstanding(), 10);
    assert_eq!(t.nic.tx(0).outstanding(), 0);

    let frames = wire.take_frames(10);
    let seqs: Vec<u32> = frames
        .iter()
        .map(|f| parse_udp_frame(f).expect("Not a UDP frame").seq().unwrap())
        .collect();
    assert_eq!(seqs, (0..10).collect::<Vec<_>>());
    assert!(frames.iter().all(|f| f.len() == 200));

    let outcome = t.pump(1);
    assert_eq!(outcome, PollOutcome::Complete { rx: 0, tx: 10 });
    assert_eq!(t.host.completed(), (10, 2000));
}

#[test]
fn test_queue_hint_wraps_around_io_queues() {
    let t = TestDevice::up(small_config());
    let packet = OutboundPacket::new(sequenced_frame(0, 64)).queue(5);
    t.device.submit(packet, false).unwrap();
    assert_eq!(t.nic.tx(1).outstanding(), 1);
}

#[test]
fn test_backpressure_stops_and_wakes_queue() {
    let t = TestDevice::up(small_config());
    let queue = t.device.queue(0).unwrap();

    let mut accepted = 0;
    let mut busy = 0;
    for seq in 0..70 {
        let packet = OutboundPacket::new(sequenced_frame(seq, 128)).queue(0);
        match t.device.submit(packet, true).unwrap() {
            TxOutcome::Queued { .. } => accepted += 1,
            TxOutcome::Busy(packet) => {
                assert_eq!(packet.len(), 128);
                busy += 1;
            }
        }
    }
    // A single-segment packet needs three free slots.
    assert_eq!(accepted, 62);
    assert_eq!(busy, 8);
    assert!(queue.tx().is_stopped());
    assert_eq!(queue.stats().get(QueueCounter::TxQueueStop), 1);
    assert_eq!(t.nic.tx(0).outstanding(), 62);

    // 17 completions free exactly the wake threshold (max segments + 2).
    assert_eq!(t.nic.tx(0).complete(17), 17);
    t.pump(0);
    assert!(!queue.tx().is_stopped());
    assert_eq!(t.host.wakes(), vec![0]);
    assert_eq!(t.host.completed().0, 17);
    assert_eq!(queue.stats().get(QueueCounter::TxQueueWakeup), 1);

    let mut resumed = 0;
    for seq in 0..20 {
        let packet = OutboundPacket::new(sequenced_frame(100 + seq, 128)).queue(0);
        if queued(&t.device.submit(packet, true).unwrap()) {
            resumed += 1;
        }
    }
    assert_eq!(resumed, 17);
}

#[test]
fn test_budget_limits_completions_per_poll() {
    let t = TestDevice::up(small_config());
    for seq in 0..40 {
        let packet = OutboundPacket::new(sequenced_frame(seq, 100)).queue(0);
        t.device.submit(packet, seq < 39).unwrap();
    }
    t.nic.tx(0).complete_all();

    // 64-entry ring with a divider of 4 reaps 16 per poll.
    t.device.interrupt(0);
    assert_eq!(t.device.poll(0), PollOutcome::Reschedule);
    assert_eq!(t.host.completed().0, 16);
    assert_eq!(t.device.poll(0), PollOutcome::Reschedule);
    assert_eq!(t.device.poll(0), PollOutcome::Complete { rx: 0, tx: 8 });
    assert_eq!(t.host.completed().0, 40);
    assert_eq!(t.nic.tx(0).unmasks(), 1);
}

#[test]
fn test_out_of_order_completions_release_everything() {
    let t = TestDevice::up(small_config());
    let baseline = t.mapper.live_mappings();
    let mut rng = StdRng::seed_from_u64(7);

    let mut sent_packets = 0u64;
    let mut sent_bytes = 0u64;
    for round in 0..300u32 {
        if rng.gen_bool(0.6) {
            let head = vec![round as u8; rng.gen_range(1..200)];
            let frags = (0..rng.gen_range(0..=16))
                .map(|_| vec![0xab; rng.gen_range(0..300)])
                .collect();
            let packet = OutboundPacket::with_frags(head, frags).queue(0);
            let len = packet.len() as u64;
            if queued(&t.device.submit(packet, rng.gen_bool(0.5)).unwrap()) {
                sent_packets += 1;
                sent_bytes += len;
            }
        } else {
            let mut ids = t.nic.tx(0).outstanding_ids();
            ids.shuffle(&mut rng);
            let n = rng.gen_range(0..=ids.len());
            t.nic.tx(0).complete_ids(&ids[..n]);
            t.pump(0);
        }
    }

    t.nic.tx(0).complete_all();
    t.pump(0);

    assert_eq!(t.device.queue(0).unwrap().tx().in_flight(), 0);
    assert_eq!(t.host.completed(), (sent_packets, sent_bytes));
    assert_eq!(t.mapper.live_mappings(), baseline);
    assert_eq!(t.device.state(), DeviceState::Running);
}

#[test]
fn test_excess_fragments_are_linearized() {
    let t = TestDevice::up(small_config());
    let head = vec![0x11; 14];
    let frags: Vec<Vec<u8>> = (0..20u8).map(|i| vec![i; 10]).collect();
    let mut expected = head.clone();
    for frag in &frags {
        expected.extend_from_slice(frag);
    }

    let packet = OutboundPacket::with_frags(head, frags).queue(0);
    assert!(queued(&t.device.submit(packet, false).unwrap()));

    let queue = t.device.queue(0).unwrap();
    assert_eq!(queue.stats().get(QueueCounter::TxLinearize), 1);
    assert_eq!(t.nic.tx(0).last_segments(), 1);
    assert_eq!(t.nic.tx(0).take_frames(1), vec![expected]);
}

#[test]
fn test_header_push_copies_prefix_inline() {
    let nic = caps_with(|caps| caps.header_push_size = 32);
    let t = TestDevice::attach_to(small_config(), nic);
    t.device.open().unwrap();

    let frame = sequenced_frame(3, 128);
    t.device
        .submit(OutboundPacket::new(frame.clone()), false)
        .unwrap();

    let wire = t.nic.tx(0);
    assert_eq!(wire.last_header_len(), 32);
    assert_eq!(wire.last_segments(), 1);
    assert_eq!(wire.take_frames(1), vec![frame]);
}

#[test]
fn test_short_packet_fits_in_pushed_header() {
    let nic = caps_with(|caps| caps.header_push_size = 96);
    let t = TestDevice::attach_to(small_config(), nic);
    t.device.open().unwrap();

    let frame = sequenced_frame(4, 64);
    t.device
        .submit(OutboundPacket::new(frame.clone()), false)
        .unwrap();

    let wire = t.nic.tx(0);
    assert_eq!(wire.last_header_len(), 64);
    assert_eq!(wire.last_segments(), 0);
    assert_eq!(wire.take_frames(1), vec![frame]);
}

#[test]
fn test_burst_limit_rings_doorbell_early() {
    let nic = caps_with(|caps| caps.max_tx_burst = Some(4));
    let t = TestDevice::attach_to(small_config(), nic);
    t.device.open().unwrap();

    for seq in 0..10 {
        let packet = OutboundPacket::new(sequenced_frame(seq, 100));
        t.device.submit(packet, true).unwrap();
    }
    assert_eq!(t.nic.tx(0).doorbells(), 2);

    t.device
        .submit(OutboundPacket::new(sequenced_frame(10, 100)), false)
        .unwrap();
    assert_eq!(t.nic.tx(0).doorbells(), 3);
    let queue = t.device.queue(0).unwrap();
    assert_eq!(queue.stats().get(QueueCounter::TxDoorbells), 3);
}

#[test]
fn test_mapping_failure_leaves_nothing_behind() {
    let t = TestDevice::up(small_config());
    let baseline = t.mapper.live_mappings();

    t.mapper.fail_next(1);
    let packet = OutboundPacket::with_frags(vec![1; 64], vec![vec![2; 64], vec![3; 64]]);
    let err = t.device.submit(packet, false).unwrap_err();
    assert!(matches!(err, TxError::Dma(_)));

    let queue = t.device.queue(0).unwrap();
    assert_eq!(queue.stats().get(QueueCounter::TxDmaMappingErr), 1);
    assert_eq!(queue.tx().in_flight(), 0);
    assert_eq!(t.mapper.live_mappings(), baseline);

    // The device is unaffected.
    let packet = OutboundPacket::new(sequenced_frame(0, 64));
    assert!(queued(&t.device.submit(packet, false).unwrap()));
    assert_eq!(t.device.state(), DeviceState::Running);
}

#[test]
fn test_descriptor_write_failure_requests_reset() {
    let t = TestDevice::up(small_config());
    let baseline = t.mapper.live_mappings();

    t.nic.tx(0).fail_next_write(HwError::InvalidDescriptor("bad opcode"));
    let err = t
        .device
        .submit(OutboundPacket::new(sequenced_frame(0, 64)), false)
        .unwrap_err();
    assert!(matches!(err, TxError::Hardware(_)));
    assert_eq!(t.mapper.live_mappings(), baseline);
    assert_eq!(t.device.state(), DeviceState::ResetRequested);
    assert_eq!(
        t.device.flags().reset_reason(),
        Some(ResetReason::DriverInvalidState)
    );
}

#[test]
fn test_empty_packet_rejected() {
    let t = TestDevice::up(small_config());
    let err = t
        .device
        .submit(OutboundPacket::with_frags(vec![], vec![vec![]]), false)
        .unwrap_err();
    assert!(matches!(err, TxError::Empty));
}

#[test]
fn test_submit_while_down_hands_packet_back() {
    let t = TestDevice::attach(small_config());
    let packet = OutboundPacket::new(sequenced_frame(0, 64));
    match t.device.submit(packet, false).unwrap() {
        TxOutcome::Busy(packet) => assert_eq!(packet.len(), 64),
        other => panic!("expected Busy, got {other:?}"),
    }
}

#[test]
fn test_inject_on_redirect_queue() {
    let t = TestDevice::up(small_config());
    let frames: Vec<Frame> = (0..5)
        .map(|seq| Frame::Owned(sequenced_frame(seq, 90)))
        .collect();

    assert_eq!(t.device.inject(0, frames, true).unwrap(), 5);

    // Creation order: io tx 0, io tx 1, redirect tx 0, redirect tx 1.
    let wire = t.nic.tx(2);
    assert_eq!(wire.doorbells(), 1);
    let seqs: Vec<u32> = wire
        .take_frames(5)
        .iter()
        .map(|f| parse_udp_frame(f).unwrap().seq().unwrap())
        .collect();
    assert_eq!(seqs, vec![0, 1, 2, 3, 4]);

    assert_eq!(t.pump(2), PollOutcome::Complete { rx: 0, tx: 5 });
    assert_eq!(t.host.completed(), (5, 450));
}

#[test]
fn test_inject_without_redirect_queues() {
    let config = mvirt_nic::EngineConfig {
        redirect_queues: false,
        ..small_config()
    };
    let t = TestDevice::up(config);
    let frames = vec![Frame::Owned(sequenced_frame(0, 64))];
    assert!(matches!(
        t.device.inject(0, frames, true),
        Err(TxError::NoQueue(0))
    ));
}
