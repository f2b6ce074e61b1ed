//! Lock-free metrics collection and periodic reporting
//!
//! The polling task is the only writer for most counters; the MQTT publisher
//! and reader client write their own. All updates are lock-free; reporting
//! swaps the periodic values to zero.
//!
//! NOTE: All atomics use Relaxed ordering. These are statistical counters
//! only and never drive checkpoint logic.

use crate::domain::types::TransitState;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Poll round-trip bucket boundaries (microseconds)
/// Buckets: ≤1ms, ≤2ms, ≤5ms, ≤10ms, ≤20ms, ≤50ms, ≤100ms, ≤200ms, ≤500ms, ≤1s, >1s
const BUCKET_BOUNDS: [u64; 10] =
    [1_000, 2_000, 5_000, 10_000, 20_000, 50_000, 100_000, 200_000, 500_000, 1_000_000];
const NUM_BUCKETS: usize = 11;

/// Tags-per-report bucket boundaries
const BATCH_SIZE_BOUNDS: [u64; 10] = [1, 2, 5, 10, 20, 50, 100, 200, 500, 1000];

#[inline]
fn bucket_index(latency_us: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_us)
}

#[inline]
fn batch_bucket_index(tags: u64) -> usize {
    BATCH_SIZE_BOUNDS.partition_point(|&bound| bound < tags)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

#[inline]
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    std::array::from_fn(|i| buckets[i].swap(0, Ordering::Relaxed))
}

#[inline]
fn load_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    std::array::from_fn(|i| buckets[i].load(Ordering::Relaxed))
}

/// Upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = ((total as f64 * percentile) as u64).max(1);
    let mut cumulative = 0u64;

    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] = [
        1_000, 2_000, 5_000, 10_000, 20_000, 50_000, 100_000, 200_000, 500_000, 1_000_000,
        2_000_000,
    ];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Why a transit was abandoned, as a metrics label
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortLabel {
    Interrupted,
    Reversed,
    Watchdog,
}

/// Lock-free metrics collector
pub struct Metrics {
    /// Poll cycles that produced a sample (monotonic)
    polls_total: AtomicU64,
    /// Poll cycles since last report (reset on report)
    polls_since_report: AtomicU64,
    /// Poll round-trip latency histogram (reset on report)
    poll_latency_buckets: [AtomicU64; NUM_BUCKETS],
    poll_latency_sum_us: AtomicU64,
    poll_latency_max_us: AtomicU64,
    /// Cumulative poll latency histogram for Prometheus
    poll_latency_cumulative: [AtomicU64; NUM_BUCKETS],
    poll_latency_total_us: AtomicU64,
    /// Serial read/write failures and timeouts (monotonic)
    channel_errors_total: AtomicU64,
    /// Responses rejected by the status parser (monotonic)
    protocol_errors_total: AtomicU64,
    /// State machine transitions (monotonic)
    state_transitions_total: AtomicU64,
    transits_started_total: AtomicU64,
    transits_completed_total: AtomicU64,
    aborted_interrupted_total: AtomicU64,
    aborted_reversed_total: AtomicU64,
    aborted_watchdog_total: AtomicU64,
    /// Unique tags admitted to a batch (monotonic)
    tags_ingested_total: AtomicU64,
    tags_duplicate_total: AtomicU64,
    tags_decode_failed_total: AtomicU64,
    /// Oldest tags dropped by the batch capacity cap
    tags_evicted_total: AtomicU64,
    tags_discarded_total: AtomicU64,
    /// Reports handed off to the messaging client
    reports_submitted_total: AtomicU64,
    reports_empty_total: AtomicU64,
    reports_cooldown_total: AtomicU64,
    reports_failed_total: AtomicU64,
    /// Tags per submitted report (cumulative)
    report_size_buckets: [AtomicU64; NUM_BUCKETS],
    reported_tags_total: AtomicU64,
    /// Publisher-side outcomes
    mqtt_published_total: AtomicU64,
    mqtt_publish_failed_total: AtomicU64,
    mqtt_inbound_total: AtomicU64,
    events_dropped_total: AtomicU64,
    reader_commands_total: AtomicU64,
    reader_commands_dropped: AtomicU64,
    reader_acks_total: AtomicU64,
    reader_frames_dropped: AtomicU64,
    /// Gauges written by the polling task
    transit_state: AtomicU64,
    current_load: AtomicU64,
    last_status: AtomicU64,
    inbound_total: AtomicU64,
    outbound_total: AtomicU64,
    recognized_total: AtomicU64,
    reader_connected: AtomicU64,
    mqtt_connected: AtomicU64,
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            polls_total: AtomicU64::new(0),
            polls_since_report: AtomicU64::new(0),
            poll_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            poll_latency_sum_us: AtomicU64::new(0),
            poll_latency_max_us: AtomicU64::new(0),
            poll_latency_cumulative: std::array::from_fn(|_| AtomicU64::new(0)),
            poll_latency_total_us: AtomicU64::new(0),
            channel_errors_total: AtomicU64::new(0),
            protocol_errors_total: AtomicU64::new(0),
            state_transitions_total: AtomicU64::new(0),
            transits_started_total: AtomicU64::new(0),
            transits_completed_total: AtomicU64::new(0),
            aborted_interrupted_total: AtomicU64::new(0),
            aborted_reversed_total: AtomicU64::new(0),
            aborted_watchdog_total: AtomicU64::new(0),
            tags_ingested_total: AtomicU64::new(0),
            tags_duplicate_total: AtomicU64::new(0),
            tags_decode_failed_total: AtomicU64::new(0),
            tags_evicted_total: AtomicU64::new(0),
            tags_discarded_total: AtomicU64::new(0),
            reports_submitted_total: AtomicU64::new(0),
            reports_empty_total: AtomicU64::new(0),
            reports_cooldown_total: AtomicU64::new(0),
            reports_failed_total: AtomicU64::new(0),
            report_size_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            reported_tags_total: AtomicU64::new(0),
            mqtt_published_total: AtomicU64::new(0),
            mqtt_publish_failed_total: AtomicU64::new(0),
            mqtt_inbound_total: AtomicU64::new(0),
            events_dropped_total: AtomicU64::new(0),
            reader_commands_total: AtomicU64::new(0),
            reader_commands_dropped: AtomicU64::new(0),
            reader_acks_total: AtomicU64::new(0),
            reader_frames_dropped: AtomicU64::new(0),
            transit_state: AtomicU64::new(TransitState::Idle.code()),
            current_load: AtomicU64::new(0),
            last_status: AtomicU64::new(0),
            inbound_total: AtomicU64::new(0),
            outbound_total: AtomicU64::new(0),
            recognized_total: AtomicU64::new(0),
            reader_connected: AtomicU64::new(0),
            mqtt_connected: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    /// Record a poll cycle that produced a sample
    #[inline]
    pub fn record_poll(&self, latency_us: u64) {
        self.polls_total.fetch_add(1, Ordering::Relaxed);
        self.polls_since_report.fetch_add(1, Ordering::Relaxed);
        self.poll_latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);
        self.poll_latency_total_us.fetch_add(latency_us, Ordering::Relaxed);
        let bucket = bucket_index(latency_us);
        self.poll_latency_buckets[bucket].fetch_add(1, Ordering::Relaxed);
        self.poll_latency_cumulative[bucket].fetch_add(1, Ordering::Relaxed);
        update_atomic_max(&self.poll_latency_max_us, latency_us);
    }

    #[inline]
    pub fn record_channel_error(&self) {
        self.channel_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_protocol_error(&self) {
        self.protocol_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_state_transition(&self, to: TransitState) {
        self.state_transitions_total.fetch_add(1, Ordering::Relaxed);
        self.transit_state.store(to.code(), Ordering::Relaxed);
    }

    #[inline]
    pub fn record_transit_started(&self) {
        self.transits_started_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_transit_completed(&self) {
        self.transits_completed_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_transit_aborted(&self, label: AbortLabel) {
        let counter = match label {
            AbortLabel::Interrupted => &self.aborted_interrupted_total,
            AbortLabel::Reversed => &self.aborted_reversed_total,
            AbortLabel::Watchdog => &self.aborted_watchdog_total,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_tag_ingested(&self, load: usize) {
        self.tags_ingested_total.fetch_add(1, Ordering::Relaxed);
        self.current_load.store(load as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_tag_duplicate(&self) {
        self.tags_duplicate_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_tag_decode_failed(&self) {
        self.tags_decode_failed_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_tag_evicted(&self) {
        self.tags_evicted_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Tag frames dropped because no transit was open for them
    #[inline]
    pub fn record_tags_discarded(&self, count: u64) {
        self.tags_discarded_total.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_current_load(&self, load: usize) {
        self.current_load.store(load as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_last_status(&self, status: u8) {
        self.last_status.store(status as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_report_submitted(&self, tags: u64) {
        self.reports_submitted_total.fetch_add(1, Ordering::Relaxed);
        self.report_size_buckets[batch_bucket_index(tags)].fetch_add(1, Ordering::Relaxed);
        self.reported_tags_total.fetch_add(tags, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_report_empty(&self) {
        self.reports_empty_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_report_cooldown(&self) {
        self.reports_cooldown_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_report_failed(&self) {
        self.reports_failed_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Mirror the cumulative transit counters into gauges
    #[inline]
    pub fn set_counters(&self, inbound: u64, outbound: u64, recognized: u64) {
        self.inbound_total.store(inbound, Ordering::Relaxed);
        self.outbound_total.store(outbound, Ordering::Relaxed);
        self.recognized_total.store(recognized, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_mqtt_published(&self) {
        self.mqtt_published_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_mqtt_publish_failed(&self) {
        self.mqtt_publish_failed_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_mqtt_inbound(&self) {
        self.mqtt_inbound_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_mqtt_connected(&self, connected: bool) {
        self.mqtt_connected.store(connected as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_event_dropped(&self) {
        self.events_dropped_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_reader_command(&self) {
        self.reader_commands_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_reader_command_dropped(&self) {
        self.reader_commands_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_reader_ack(&self) {
        self.reader_acks_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Tag frame lost because the ingest queue was full
    #[inline]
    pub fn record_reader_frame_dropped(&self) {
        self.reader_frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_reader_connected(&self, connected: bool) {
        self.reader_connected.store(connected as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn polls_total(&self) -> u64 {
        self.polls_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn channel_errors_total(&self) -> u64 {
        self.channel_errors_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn protocol_errors_total(&self) -> u64 {
        self.protocol_errors_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn reports_submitted_total(&self) -> u64 {
        self.reports_submitted_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn reports_cooldown_total(&self) -> u64 {
        self.reports_cooldown_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn reports_failed_total(&self) -> u64 {
        self.reports_failed_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn tags_duplicate_total(&self) -> u64 {
        self.tags_duplicate_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn tags_decode_failed_total(&self) -> u64 {
        self.tags_decode_failed_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn tags_discarded_total(&self) -> u64 {
        self.tags_discarded_total.load(Ordering::Relaxed)
    }

    /// Point-in-time view for the Prometheus endpoint. Does not reset anything.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |a: &AtomicU64| a.load(Ordering::Relaxed);
        MetricsSnapshot {
            polls_total: load(&self.polls_total),
            poll_latency_buckets: load_buckets(&self.poll_latency_cumulative),
            poll_latency_total_us: load(&self.poll_latency_total_us),
            channel_errors_total: load(&self.channel_errors_total),
            protocol_errors_total: load(&self.protocol_errors_total),
            state_transitions_total: load(&self.state_transitions_total),
            transits_started_total: load(&self.transits_started_total),
            transits_completed_total: load(&self.transits_completed_total),
            aborted_interrupted_total: load(&self.aborted_interrupted_total),
            aborted_reversed_total: load(&self.aborted_reversed_total),
            aborted_watchdog_total: load(&self.aborted_watchdog_total),
            tags_ingested_total: load(&self.tags_ingested_total),
            tags_duplicate_total: load(&self.tags_duplicate_total),
            tags_decode_failed_total: load(&self.tags_decode_failed_total),
            tags_evicted_total: load(&self.tags_evicted_total),
            tags_discarded_total: load(&self.tags_discarded_total),
            reports_submitted_total: load(&self.reports_submitted_total),
            reports_empty_total: load(&self.reports_empty_total),
            reports_cooldown_total: load(&self.reports_cooldown_total),
            reports_failed_total: load(&self.reports_failed_total),
            report_size_buckets: load_buckets(&self.report_size_buckets),
            reported_tags_total: load(&self.reported_tags_total),
            mqtt_published_total: load(&self.mqtt_published_total),
            mqtt_publish_failed_total: load(&self.mqtt_publish_failed_total),
            mqtt_inbound_total: load(&self.mqtt_inbound_total),
            events_dropped_total: load(&self.events_dropped_total),
            reader_commands_total: load(&self.reader_commands_total),
            reader_commands_dropped: load(&self.reader_commands_dropped),
            reader_acks_total: load(&self.reader_acks_total),
            reader_frames_dropped: load(&self.reader_frames_dropped),
            transit_state: load(&self.transit_state),
            current_load: load(&self.current_load),
            last_status: load(&self.last_status),
            inbound_total: load(&self.inbound_total),
            outbound_total: load(&self.outbound_total),
            recognized_total: load(&self.recognized_total),
            reader_connected: load(&self.reader_connected) != 0,
            mqtt_connected: load(&self.mqtt_connected) != 0,
        }
    }

    /// Calculate the periodic summary, then reset the periodic counters
    pub fn report(&self) -> MetricsSummary {
        let polls = self.polls_since_report.swap(0, Ordering::Relaxed);
        let latency_sum = self.poll_latency_sum_us.swap(0, Ordering::Relaxed);
        let max_latency = self.poll_latency_max_us.swap(0, Ordering::Relaxed);
        let buckets = swap_buckets(&self.poll_latency_buckets);

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let polls_per_sec = if elapsed.as_secs_f64() > 0.0 {
            polls as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        MetricsSummary {
            polls_total: self.polls_total.load(Ordering::Relaxed),
            polls_per_sec,
            avg_poll_latency_us: if polls > 0 { latency_sum / polls } else { 0 },
            max_poll_latency_us: max_latency,
            poll_p50_us: percentile_from_buckets(&buckets, 0.50),
            poll_p99_us: percentile_from_buckets(&buckets, 0.99),
            channel_errors_total: self.channel_errors_total.load(Ordering::Relaxed),
            protocol_errors_total: self.protocol_errors_total.load(Ordering::Relaxed),
            transits_completed_total: self.transits_completed_total.load(Ordering::Relaxed),
            transits_aborted_total: self.aborted_interrupted_total.load(Ordering::Relaxed)
                + self.aborted_reversed_total.load(Ordering::Relaxed)
                + self.aborted_watchdog_total.load(Ordering::Relaxed),
            reports_submitted_total: self.reports_submitted_total.load(Ordering::Relaxed),
            reports_failed_total: self.reports_failed_total.load(Ordering::Relaxed),
            recognized_total: self.recognized_total.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of histogram buckets (exported for the Prometheus endpoint)
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;
/// Poll latency bucket bounds (µs)
pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;
/// Report size bucket bounds (tags)
pub const METRICS_BATCH_SIZE_BOUNDS: [u64; 10] = BATCH_SIZE_BOUNDS;

/// Cumulative metric values read by the Prometheus endpoint
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub polls_total: u64,
    pub poll_latency_buckets: [u64; NUM_BUCKETS],
    pub poll_latency_total_us: u64,
    pub channel_errors_total: u64,
    pub protocol_errors_total: u64,
    pub state_transitions_total: u64,
    pub transits_started_total: u64,
    pub transits_completed_total: u64,
    pub aborted_interrupted_total: u64,
    pub aborted_reversed_total: u64,
    pub aborted_watchdog_total: u64,
    pub tags_ingested_total: u64,
    pub tags_duplicate_total: u64,
    pub tags_decode_failed_total: u64,
    pub tags_evicted_total: u64,
    pub tags_discarded_total: u64,
    pub reports_submitted_total: u64,
    pub reports_empty_total: u64,
    pub reports_cooldown_total: u64,
    pub reports_failed_total: u64,
    pub report_size_buckets: [u64; NUM_BUCKETS],
    pub reported_tags_total: u64,
    pub mqtt_published_total: u64,
    pub mqtt_publish_failed_total: u64,
    pub mqtt_inbound_total: u64,
    pub events_dropped_total: u64,
    pub reader_commands_total: u64,
    pub reader_commands_dropped: u64,
    pub reader_acks_total: u64,
    pub reader_frames_dropped: u64,
    pub transit_state: u64,
    pub current_load: u64,
    pub last_status: u64,
    pub inbound_total: u64,
    pub outbound_total: u64,
    pub recognized_total: u64,
    pub reader_connected: bool,
    pub mqtt_connected: bool,
}

#[derive(Debug)]
pub struct MetricsSummary {
    pub polls_total: u64,
    pub polls_per_sec: f64,
    pub avg_poll_latency_us: u64,
    pub max_poll_latency_us: u64,
    pub poll_p50_us: u64,
    pub poll_p99_us: u64,
    pub channel_errors_total: u64,
    pub protocol_errors_total: u64,
    pub transits_completed_total: u64,
    pub transits_aborted_total: u64,
    pub reports_submitted_total: u64,
    pub reports_failed_total: u64,
    pub recognized_total: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            polls_total = %self.polls_total,
            polls_per_sec = format!("{:.1}", self.polls_per_sec),
            avg_poll_us = %self.avg_poll_latency_us,
            max_poll_us = %self.max_poll_latency_us,
            p50_us = %self.poll_p50_us,
            p99_us = %self.poll_p99_us,
            channel_errors = %self.channel_errors_total,
            protocol_errors = %self.protocol_errors_total,
            completed = %self.transits_completed_total,
            aborted = %self.transits_aborted_total,
            reports = %self.reports_submitted_total,
            report_failures = %self.reports_failed_total,
            recognized = %self.recognized_total,
            "metrics"
        );
    }
}
