use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use mvirt_nic::buffer::IdentityMapper;
use mvirt_nic::test_util::{RecordingHost, SimNic, parse_udp_frame, sequenced_frame};
use mvirt_nic::{Device, EngineConfig, OutboundPacket, PollOutcome, TxOutcome};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Polls per interrupt before yielding back to the loop.
const MAX_POLL_ROUNDS: usize = 16;

#[derive(Parser)]
#[command(name = "mvirt-nic")]
#[command(about = "Run the NIC packet engine against a simulated adapter")]
struct Args {
    /// Engine configuration (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of IO queue pairs (overrides the configuration)
    #[arg(short, long)]
    queues: Option<u16>,

    /// Seconds to run
    #[arg(short, long, default_value = "5")]
    duration: u64,

    /// Frames submitted per tick, spread across queues
    #[arg(short, long, default_value = "64")]
    packets: u32,

    /// Frame size in bytes
    #[arg(long, default_value = "512")]
    frame_size: usize,

    /// Tick period in milliseconds
    #[arg(long, default_value = "1")]
    tick_ms: u64,

    /// Inject a bogus TX completion after this many ticks
    #[arg(long)]
    fail_after: Option<u64>,
}

#[derive(Debug, Default)]
struct Traffic {
    sent: u64,
    busy: u64,
    looped: u64,
    received: u64,
    malformed: u64,
    /// Queues whose last poll asked to run again. Their interrupt stays
    /// masked, so they are polled without waiting for one.
    rescheduled: BTreeSet<u16>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("mvirt_nic=info".parse()?))
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    if let Some(queues) = args.queues {
        config.num_queues = queues;
        config.rx_pool_pages = None;
    }
    config.validate()?;
    let service_interval = config.health.service_interval();

    let nic = Arc::new(SimNic::new());
    let host = Arc::new(RecordingHost::new());
    let device = Device::attach(
        config,
        nic.clone(),
        host.clone(),
        Arc::new(IdentityMapper::new()),
    )?;
    device.open()?;

    info!(
        device_id = %device.id(),
        queues = device.config().num_queues,
        duration_s = args.duration,
        "Simulation started"
    );

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let deadline = tokio::time::sleep(Duration::from_secs(args.duration));
    tokio::pin!(deadline);
    let mut ticker = tokio::time::interval(Duration::from_millis(args.tick_ms.max(1)));

    let mut traffic = Traffic::default();
    let mut ticks = 0u64;
    let mut seq = 0u32;
    let mut last_service = Instant::now();

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down...");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
                break;
            }
            _ = &mut deadline => {
                info!("Duration elapsed, shutting down...");
                break;
            }
            _ = ticker.tick() => {
                ticks += 1;
                run_tick(&device, &nic, &host, &args, &mut traffic, &mut seq);

                if args.fail_after == Some(ticks) {
                    warn!(tick = ticks, "Injecting bogus tx completion");
                    nic.tx(0).inject_completion(u16::MAX);
                }

                device.keep_alive();
                let now = Instant::now();
                if now.duration_since(last_service) >= service_interval {
                    device.service(now);
                    last_service = now;
                }
            }
        }
    }

    info!(
        ticks,
        sent = traffic.sent,
        busy = traffic.busy,
        looped = traffic.looped,
        received = traffic.received,
        malformed = traffic.malformed,
        state = %device.state(),
        "Simulation finished"
    );
    println!("{}", serde_json::to_string_pretty(&device.counters())?);

    device.detach();
    Ok(())
}

/// Submit, loop back, interrupt and poll every queue once.
fn run_tick(
    device: &Device,
    nic: &SimNic,
    host: &RecordingHost,
    args: &Args,
    traffic: &mut Traffic,
    seq: &mut u32,
) {
    let set = device.queues();
    let io = set.io.len() as u32;
    if io == 0 {
        return;
    }

    for i in 0..args.packets {
        let qid = (i % io) as u16;
        let packet = OutboundPacket::new(sequenced_frame(*seq, args.frame_size)).queue(qid);
        let more = i + 1 < args.packets;
        match device.submit(packet, more) {
            Ok(TxOutcome::Queued { .. }) => {
                traffic.sent += 1;
                *seq = seq.wrapping_add(1);
            }
            Ok(TxOutcome::Busy(_)) => traffic.busy += 1,
            Err(e) => {
                debug!(error = %e, "Submit failed");
                traffic.busy += 1;
            }
        }
    }

    for i in 0..set.io.len() {
        traffic.looped += nic.loopback(i, i, usize::MAX) as u64;
    }

    for queue in set.iter() {
        let qid = queue.qid();
        if device.interrupt(qid) || traffic.rescheduled.contains(&qid) {
            poll_queue(device, qid, &mut traffic.rescheduled);
        }
    }

    for packet in host.take() {
        match parse_udp_frame(&packet.to_vec()) {
            Some(_) => traffic.received += 1,
            None => traffic.malformed += 1,
        }
    }
}

/// Poll `qid` up to `MAX_POLL_ROUNDS` times, remembering it when it still
/// has work left.
fn poll_queue(device: &Device, qid: u16, rescheduled: &mut BTreeSet<u16>) {
    for _ in 0..MAX_POLL_ROUNDS {
        if device.poll(qid) != PollOutcome::Reschedule {
            rescheduled.remove(&qid);
            return;
        }
    }
    debug!(qid, "Poll budget exhausted, continuing next tick");
    rescheduled.insert(qid);
}
