//! Gate sensor commissioning tool
//!
//! Polls the gate status register at the configured cadence and prints every
//! bitmask change together with the state-machine steps it causes. No reader
//! and no MQTT: use it to check wiring and beam alignment on site.

use clap::Parser;
use rfid_checkpoint::domain::error::ChannelError;
use rfid_checkpoint::domain::types::StatusSample;
use rfid_checkpoint::infra::config::Config;
use rfid_checkpoint::io::frame_channel::{open_serial, parse_status_response, FrameChannel, SerialLink};
use rfid_checkpoint::services::transit::{TransitEvent, TransitStateMachine};
use std::time::Duration;
use time::macros::format_description;
use time::OffsetDateTime;
use tokio::time::Instant;

#[derive(Parser, Debug)]
#[command(name = "gate_probe", about = "Gate sensor commissioning tool")]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Serial device (overrides config)
    #[arg(long)]
    device: Option<String>,

    /// Baud rate (overrides config)
    #[arg(long)]
    baud: Option<u32>,

    /// Stop after this many seconds (0 = until Ctrl-C)
    #[arg(long, default_value = "0")]
    duration: u64,

    /// Print every sample, not only changes
    #[arg(long)]
    raw: bool,
}

#[derive(Default)]
struct ProbeStats {
    samples: u64,
    timeouts: u64,
    channel_errors: u64,
    rejected: u64,
    completed: u64,
    aborted: u64,
    max_latency: Duration,
}

fn wall_clock() -> String {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    now.format(format_description!("[hour]:[minute]:[second].[subsecond digits:3]"))
        .unwrap_or_default()
}

fn gates_str(status: u8) -> &'static str {
    match status & 0x03 {
        0x00 => "-- --",
        0x01 => "A  --",
        0x02 => "-- B ",
        _ => "A  B ",
    }
}

async fn probe<L: SerialLink>(
    channel: &mut FrameChannel<L>,
    config: &Config,
    raw: bool,
    stats: &mut ProbeStats,
) {
    let started = Instant::now();
    let mut machine = TransitStateMachine::new(config.idle_timeout(), started);
    let mut last_status: Option<u8> = None;

    while channel.is_open() {
        let cycle_start = Instant::now();

        match channel.read_register(config.status_command(), config.read_timeout()).await {
            Ok(bytes) => match parse_status_response(&bytes, config.status_command(), config.verify_crc()) {
                Ok(status) => {
                    stats.samples += 1;
                    stats.max_latency = stats.max_latency.max(cycle_start.elapsed());
                    let sample = StatusSample::new(status, Instant::now());

                    if raw || last_status != Some(sample.gates()) {
                        println!(
                            "[{}] +{:>7}ms  status=0x{:02X}  [{}]",
                            wall_clock(),
                            started.elapsed().as_millis(),
                            status,
                            gates_str(status)
                        );
                    }
                    last_status = Some(sample.gates());

                    let outcome = machine.on_status(sample.raw_byte, sample.captured_at);
                    for step in &outcome.steps {
                        println!("             {} -> {}", step.from, step.to);
                    }
                    match outcome.event {
                        Some(TransitEvent::Started(direction)) => {
                            println!("             transit started ({direction})")
                        }
                        Some(TransitEvent::Completed(direction)) => {
                            stats.completed += 1;
                            println!("             TRANSIT COMPLETE ({direction})");
                        }
                        Some(TransitEvent::Aborted { direction, reason }) => {
                            stats.aborted += 1;
                            println!("             transit aborted ({direction}, {})", reason.as_str());
                        }
                        None => {}
                    }
                }
                Err(e) => {
                    stats.rejected += 1;
                    println!("[{}] rejected frame {}: {e}", wall_clock(), hex::encode_upper(&bytes));
                }
            },
            Err(ChannelError::Timeout { .. }) => {
                stats.timeouts += 1;
                if raw {
                    println!("[{}] no response", wall_clock());
                }
            }
            Err(e) => {
                stats.channel_errors += 1;
                eprintln!("[{}] channel error: {e}", wall_clock());
            }
        }

        if let Some((step, TransitEvent::Aborted { direction, .. })) = machine.check_watchdog(Instant::now()) {
            stats.aborted += 1;
            println!("             {} -> {}  watchdog ({direction})", step.from, step.to);
        }

        tokio::time::sleep_until(cycle_start + config.poll_interval()).await;
    }

    eprintln!("[{}] serial channel closed", wall_clock());
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config_path = Config::resolve_config_path(args.config.as_deref());
    let config = Config::load_from_path(&config_path);
    let device = args.device.unwrap_or_else(|| config.serial_device().to_string());
    let baud = args.baud.unwrap_or_else(|| config.serial_baud());

    println!("\n=== GATE PROBE ===");
    println!("  Config:   {config_path}");
    println!("  Serial:   {device} @ {baud} baud");
    println!("  Command:  0x{:02X}", config.status_command());
    println!("  Cadence:  {}ms (timeout {}ms)", config.poll_interval().as_millis(), config.read_timeout().as_millis());
    println!();

    let mut channel = open_serial(&device, baud)?
        .with_timeouts(config.inter_byte_timeout(), config.residual_timeout());

    let mut stats = ProbeStats::default();
    let started = Instant::now();
    let limit = async {
        if args.duration == 0 {
            std::future::pending::<()>().await
        } else {
            tokio::time::sleep(Duration::from_secs(args.duration)).await
        }
    };

    tokio::select! {
        _ = probe(&mut channel, &config, args.raw, &mut stats) => {}
        _ = tokio::signal::ctrl_c() => {}
        _ = limit => {}
    }

    let elapsed = started.elapsed().as_secs_f64().max(f64::EPSILON);
    println!("\n=== RESULTS ===");
    println!("  Samples:          {} ({:.1}/s)", stats.samples, stats.samples as f64 / elapsed);
    println!("  Max read latency: {}ms", stats.max_latency.as_millis());
    println!("  Timeouts:         {}", stats.timeouts);
    println!("  Channel errors:   {}", stats.channel_errors);
    println!("  Rejected frames:  {}", stats.rejected);
    println!("  Transits:         {} complete, {} aborted", stats.completed, stats.aborted);

    Ok(())
}
