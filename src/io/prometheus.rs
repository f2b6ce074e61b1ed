//! Prometheus metrics HTTP endpoint
//!
//! - GET /metrics - Prometheus text format
//! - GET /snapshot - latest checkpoint snapshot as JSON
//! - GET /health
//! - POST /counters/reset - operator counter reset, applied by the polling task

use crate::infra::metrics::{
    Metrics, MetricsSnapshot, METRICS_BATCH_SIZE_BOUNDS, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS,
};
use crate::services::events::{CheckpointSnapshot, ControlCommand};
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

const TEXT_FORMAT: &str = "text/plain; version=0.0.4; charset=utf-8";
const JSON: &str = "application/json";

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge) with device label
fn write_metric(output: &mut String, name: &str, help: &str, typ: MetricType, device: &str, val: u64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{device=\"{device}\"}} {val}");
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    device: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    bounds: &[u64; 10],
    sum: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in bounds.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{device=\"{device}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{device=\"{device}\",le=\"+Inf\"}} {cumulative}");
    let _ = writeln!(output, "{name}_sum{{device=\"{device}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{device=\"{device}\"}} {cumulative}");
}

/// Format metrics in Prometheus text exposition format
fn format_prometheus_metrics(metrics: &Metrics, checkpoint: &CheckpointSnapshot, device: &str) -> String {
    let snap = metrics.snapshot();
    let mut output = String::with_capacity(8192);

    write_poll_metrics(&mut output, device, &snap);
    write_transit_metrics(&mut output, device, &snap, checkpoint);
    write_tag_metrics(&mut output, device, &snap);
    write_report_metrics(&mut output, device, &snap, checkpoint);
    write_link_metrics(&mut output, device, &snap);

    output
}

fn write_poll_metrics(output: &mut String, device: &str, snap: &MetricsSnapshot) {
    write_metric(
        output,
        "checkpoint_polls_total",
        "Status polls answered with a valid frame",
        MetricType::Counter,
        device,
        snap.polls_total,
    );
    write_histogram(
        output,
        "checkpoint_poll_latency_us",
        "Register read round trip in microseconds",
        device,
        &snap.poll_latency_buckets,
        &METRICS_BUCKET_BOUNDS,
        snap.poll_latency_total_us,
    );
    write_metric(
        output,
        "checkpoint_channel_errors_total",
        "Serial timeouts, I/O errors and disconnects",
        MetricType::Counter,
        device,
        snap.channel_errors_total,
    );
    write_metric(
        output,
        "checkpoint_protocol_errors_total",
        "Status frames rejected (header, CRC, length)",
        MetricType::Counter,
        device,
        snap.protocol_errors_total,
    );
    write_metric(
        output,
        "checkpoint_last_status",
        "Last gate bitmask (bit0 = A, bit1 = B)",
        MetricType::Gauge,
        device,
        snap.last_status,
    );
}

fn write_transit_metrics(
    output: &mut String,
    device: &str,
    snap: &MetricsSnapshot,
    checkpoint: &CheckpointSnapshot,
) {
    write_metric(
        output,
        "checkpoint_transit_state",
        "Current state (0=idle 1=in_start 2=in_middle 3=in_end 4=out_start 5=out_middle 6=out_end)",
        MetricType::Gauge,
        device,
        checkpoint.state.code(),
    );
    write_metric(
        output,
        "checkpoint_state_transitions_total",
        "State machine transitions",
        MetricType::Counter,
        device,
        snap.state_transitions_total,
    );
    write_metric(
        output,
        "checkpoint_transits_started_total",
        "Transits started",
        MetricType::Counter,
        device,
        snap.transits_started_total,
    );
    write_metric(
        output,
        "checkpoint_transits_completed_total",
        "Transits completed",
        MetricType::Counter,
        device,
        snap.transits_completed_total,
    );

    let name = "checkpoint_transits_aborted_total";
    let _ = writeln!(output, "# HELP {name} Transits abandoned before completion");
    let _ = writeln!(output, "# TYPE {name} counter");
    for (reason, val) in [
        ("interrupted", snap.aborted_interrupted_total),
        ("reversed", snap.aborted_reversed_total),
        ("watchdog", snap.aborted_watchdog_total),
    ] {
        let _ = writeln!(output, "{name}{{device=\"{device}\",reason=\"{reason}\"}} {val}");
    }
}

fn write_tag_metrics(output: &mut String, device: &str, snap: &MetricsSnapshot) {
    write_metric(
        output,
        "checkpoint_tags_ingested_total",
        "Distinct tags added to a batch",
        MetricType::Counter,
        device,
        snap.tags_ingested_total,
    );
    write_metric(
        output,
        "checkpoint_tags_duplicate_total",
        "Tag reads dropped as duplicates",
        MetricType::Counter,
        device,
        snap.tags_duplicate_total,
    );
    write_metric(
        output,
        "checkpoint_tags_decode_failed_total",
        "Tag frames that failed to decode",
        MetricType::Counter,
        device,
        snap.tags_decode_failed_total,
    );
    write_metric(
        output,
        "checkpoint_tags_evicted_total",
        "Tags evicted at batch capacity",
        MetricType::Counter,
        device,
        snap.tags_evicted_total,
    );
    write_metric(
        output,
        "checkpoint_tags_discarded_total",
        "Tag frames dropped outside a transit",
        MetricType::Counter,
        device,
        snap.tags_discarded_total,
    );
    write_metric(
        output,
        "checkpoint_current_load",
        "Tags in the current batch",
        MetricType::Gauge,
        device,
        snap.current_load,
    );
}

fn write_report_metrics(
    output: &mut String,
    device: &str,
    snap: &MetricsSnapshot,
    checkpoint: &CheckpointSnapshot,
) {
    write_metric(
        output,
        "checkpoint_reports_submitted_total",
        "Reports handed to messaging",
        MetricType::Counter,
        device,
        snap.reports_submitted_total,
    );
    write_metric(
        output,
        "checkpoint_reports_empty_total",
        "Completed transits with no tags",
        MetricType::Counter,
        device,
        snap.reports_empty_total,
    );
    write_metric(
        output,
        "checkpoint_reports_cooldown_total",
        "Reports suppressed by the cooldown",
        MetricType::Counter,
        device,
        snap.reports_cooldown_total,
    );
    write_metric(
        output,
        "checkpoint_reports_failed_total",
        "Reports that could not be handed off",
        MetricType::Counter,
        device,
        snap.reports_failed_total,
    );
    write_histogram(
        output,
        "checkpoint_report_size_tags",
        "Tags per submitted report",
        device,
        &snap.report_size_buckets,
        &METRICS_BATCH_SIZE_BOUNDS,
        snap.reported_tags_total,
    );

    let counters = &checkpoint.counters;
    write_metric(
        output,
        "checkpoint_inbound_total",
        "Tags reported inbound since last reset",
        MetricType::Gauge,
        device,
        counters.inbound_total,
    );
    write_metric(
        output,
        "checkpoint_outbound_total",
        "Tags reported outbound since last reset",
        MetricType::Gauge,
        device,
        counters.outbound_total,
    );
    write_metric(
        output,
        "checkpoint_recognized_total",
        "Tags reported in either direction since last reset",
        MetricType::Gauge,
        device,
        counters.recognized_total,
    );
}

fn write_link_metrics(output: &mut String, device: &str, snap: &MetricsSnapshot) {
    write_metric(
        output,
        "checkpoint_reader_connected",
        "RFID reader TCP link up",
        MetricType::Gauge,
        device,
        u64::from(snap.reader_connected),
    );
    write_metric(
        output,
        "checkpoint_reader_commands_total",
        "Loop commands written to the reader",
        MetricType::Counter,
        device,
        snap.reader_commands_total,
    );
    write_metric(
        output,
        "checkpoint_reader_commands_dropped_total",
        "Loop commands refused or lost",
        MetricType::Counter,
        device,
        snap.reader_commands_dropped,
    );
    write_metric(
        output,
        "checkpoint_reader_frames_dropped_total",
        "Reader frames discarded (bad checksum, full queue)",
        MetricType::Counter,
        device,
        snap.reader_frames_dropped,
    );
    write_metric(
        output,
        "checkpoint_mqtt_connected",
        "MQTT broker connection up",
        MetricType::Gauge,
        device,
        u64::from(snap.mqtt_connected),
    );
    write_metric(
        output,
        "checkpoint_mqtt_published_total",
        "Reports acknowledged by the MQTT client",
        MetricType::Counter,
        device,
        snap.mqtt_published_total,
    );
    write_metric(
        output,
        "checkpoint_mqtt_publish_failed_total",
        "Report publishes that failed or timed out",
        MetricType::Counter,
        device,
        snap.mqtt_publish_failed_total,
    );
    write_metric(
        output,
        "checkpoint_mqtt_inbound_total",
        "Messages received from the backend",
        MetricType::Counter,
        device,
        snap.mqtt_inbound_total,
    );
    write_metric(
        output,
        "checkpoint_events_dropped_total",
        "Observer events dropped on a full queue",
        MetricType::Counter,
        device,
        snap.events_dropped_total,
    );
}

/// Shared state behind the HTTP handlers
#[derive(Clone)]
pub struct MetricsEndpoint {
    metrics: Arc<Metrics>,
    snapshot: watch::Receiver<CheckpointSnapshot>,
    control: mpsc::Sender<ControlCommand>,
    device_id: Arc<str>,
}

impl MetricsEndpoint {
    pub fn new(
        metrics: Arc<Metrics>,
        snapshot: watch::Receiver<CheckpointSnapshot>,
        control: mpsc::Sender<ControlCommand>,
        device_id: impl Into<Arc<str>>,
    ) -> Self {
        Self { metrics, snapshot, control, device_id: device_id.into() }
    }
}

fn respond(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn route(method: &Method, path: &str, endpoint: &MetricsEndpoint) -> Response<Full<Bytes>> {
    match (method, path) {
        (&Method::GET, "/metrics") => {
            let checkpoint = endpoint.snapshot.borrow().clone();
            let body = format_prometheus_metrics(&endpoint.metrics, &checkpoint, &endpoint.device_id);
            respond(StatusCode::OK, TEXT_FORMAT, body)
        }
        (&Method::GET, "/snapshot") => {
            let checkpoint = endpoint.snapshot.borrow().clone();
            match serde_json::to_vec(&checkpoint) {
                Ok(body) => respond(StatusCode::OK, JSON, body),
                Err(e) => {
                    error!(error = %e, "snapshot_serialize_failed");
                    respond(StatusCode::INTERNAL_SERVER_ERROR, JSON, r#"{"ok":false}"#)
                }
            }
        }
        (&Method::GET, "/health") => respond(StatusCode::OK, TEXT_FORMAT, "ok"),
        (&Method::POST, "/counters/reset") => {
            match endpoint.control.try_send(ControlCommand::ResetCounters) {
                Ok(()) => {
                    info!("counter_reset_requested");
                    respond(StatusCode::ACCEPTED, JSON, r#"{"ok":true}"#)
                }
                Err(e) => {
                    warn!(error = %e, "counter_reset_rejected");
                    respond(StatusCode::SERVICE_UNAVAILABLE, JSON, r#"{"ok":false,"error":"busy"}"#)
                }
            }
        }
        _ => respond(StatusCode::NOT_FOUND, TEXT_FORMAT, "Not Found"),
    }
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    endpoint: MetricsEndpoint,
) -> Result<Response<Full<Bytes>>, Infallible> {
    Ok(route(req.method(), req.uri().path(), &endpoint))
}

/// Start the Prometheus metrics HTTP server
pub async fn start_metrics_server(
    port: u16,
    endpoint: MetricsEndpoint,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;

    info!(port = %port, device = %endpoint.device_id, "prometheus_metrics_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let endpoint = endpoint.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| handle_request(req, endpoint.clone()));

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "prometheus_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "prometheus_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("prometheus_metrics_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}
