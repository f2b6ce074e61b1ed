//! RFID transit checkpoint
//!
//! Polls a two-beam gate over RS-485, drives the RFID reader's inventory loop
//! for the duration of each transit, and publishes one tag report per
//! completed transit over MQTT.
//!
//! Module structure:
//! - `domain/` - Core types and error taxonomy
//! - `io/` - External interfaces (serial, reader, MQTT, Prometheus)
//! - `services/` - Transit state machine, tag batch, reports, polling task
//! - `infra/` - Infrastructure (Config, Metrics)

use anyhow::Context;
use clap::Parser;
use rfid_checkpoint::infra::{Config, Metrics};
use rfid_checkpoint::io::prometheus::{start_metrics_server, MetricsEndpoint};
use rfid_checkpoint::io::{
    create_reader, create_report_channel, open_serial, CnntTagDecoder, MqttPublisher,
    ReaderClientConfig,
};
use rfid_checkpoint::services::{create_event_channel, CheckpointController, ControllerLinks};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

const EVENT_QUEUE: usize = 256;
const TAG_QUEUE: usize = 1024;
const CONTROL_QUEUE: usize = 8;
const SERIAL_REOPEN_DELAY: Duration = Duration::from_secs(2);
const PUBLISHER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// RFID transit checkpoint
#[derive(Parser, Debug)]
#[command(name = "rfid-checkpoint", version, about)]
struct Args {
    /// Path to TOML configuration file (default: $CONFIG_FILE or config/checkpoint.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Emit JSON log lines
    #[arg(long)]
    log_json: bool,
}

fn init_tracing(json: bool) {
    // RUST_LOG=debug for per-frame detail, trace for every poll
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        git_hash = env!("GIT_HASH"),
        "rfid_checkpoint_starting"
    );

    // An explicit --config must load; otherwise fall back to defaults
    let config = match args.config.as_deref() {
        Some(path) => Config::from_file(path).context("cannot start with the given --config")?,
        None => Config::load_from_path(Config::resolve_config_path(None)),
    };

    info!(
        config_file = %config.config_file(),
        device_id = %config.device_id(),
        serial_device = %config.serial_device(),
        serial_baud = %config.serial_baud(),
        poll_interval_ms = config.poll_interval().as_millis() as u64,
        idle_timeout_ms = config.idle_timeout().as_millis() as u64,
        reader_addr = %config.reader_addr(),
        mqtt_host = %config.mqtt_host(),
        mqtt_port = %config.mqtt_port(),
        command_topic = %config.mqtt_command_topic(),
        prometheus_port = %config.prometheus_port(),
        "config_loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(Metrics::new());

    // Observer events (logged here; the core holds no UI references)
    let (events, mut event_rx) = create_event_channel(EVENT_QUEUE, metrics.clone());
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            debug!(event = event.name(), detail = ?event, "checkpoint_event");
        }
    });

    // RFID reader client
    let (tag_tx, tag_rx) = mpsc::channel(TAG_QUEUE);
    let (reader_client, reader_handle) =
        create_reader(ReaderClientConfig::from_config(&config), tag_tx, metrics.clone());
    let reader_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        reader_client.run(reader_shutdown).await;
    });

    // MQTT report publisher
    let mqtt_connected = Arc::new(AtomicBool::new(false));
    let (report_sender, report_rx) =
        create_report_channel(config.mqtt_queue_size(), mqtt_connected.clone());
    let publisher =
        MqttPublisher::new(&config, report_rx, mqtt_connected, events.clone(), metrics.clone());
    let publisher_shutdown = shutdown_rx.clone();
    let publisher_task = tokio::spawn(async move {
        publisher.run(publisher_shutdown).await;
    });

    let (control_tx, control_rx) = mpsc::channel(CONTROL_QUEUE);
    let (mut controller, snapshot_rx) = CheckpointController::new(
        &config,
        ControllerLinks {
            decoder: Box::new(CnntTagDecoder::new()),
            sink: Box::new(report_sender),
            reader: Box::new(reader_handle),
            events,
            tag_rx,
            control_rx,
        },
        metrics.clone(),
    );

    // Prometheus metrics HTTP server (if port > 0)
    let prometheus_port = config.prometheus_port();
    if prometheus_port > 0 {
        let endpoint =
            MetricsEndpoint::new(metrics.clone(), snapshot_rx, control_tx, config.device_id());
        let prom_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(prometheus_port, endpoint, prom_shutdown).await {
                error!(error = %e, "prometheus_server_error");
            }
        });
    }

    // Periodic metrics summary
    let reporter_metrics = metrics.clone();
    let metrics_interval = config.metrics_interval_secs();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
        interval.tick().await;
        loop {
            interval.tick().await;
            reporter_metrics.report().log();
        }
    });

    // Polling task. A closed port ends one session; the port is reopened.
    let serve = async {
        loop {
            match open_serial(config.serial_device(), config.serial_baud()) {
                Ok(channel) => {
                    let mut channel =
                        channel.with_timeouts(config.inter_byte_timeout(), config.residual_timeout());
                    controller.run(&mut channel).await;
                    warn!(device = %config.serial_device(), "serial_session_ended");
                }
                Err(e) => error!(error = %e, "serial_open_failed"),
            }
            tokio::time::sleep(SERIAL_REOPEN_DELAY).await;
        }
    };

    tokio::select! {
        _ = serve => {}
        _ = tokio::signal::ctrl_c() => info!("shutdown_signal_received"),
    }

    let _ = shutdown_tx.send(true);
    if tokio::time::timeout(PUBLISHER_DRAIN_TIMEOUT, publisher_task).await.is_err() {
        warn!("publisher_drain_timeout");
    }

    info!("rfid_checkpoint_shutdown_complete");
    Ok(())
}
