//! One report per completed transit
//!
//! The emitter owns the cumulative counters and the cooldown clock. Counters
//! move only when messaging accepts the hand-off.

use crate::domain::error::ReportError;
use crate::domain::types::{Counters, Direction};
use crate::infra::metrics::Metrics;
use crate::io::egress_channel::{OutboundReport, ReportSink, TagReport};
use crate::services::tag_buffer::TransitBatch;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// What happened to a completed transit's batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitOutcome {
    Reported { tags: usize },
    Empty,
    Cooldown,
    Failed,
}

impl EmitOutcome {
    pub fn reported(&self) -> bool {
        matches!(self, EmitOutcome::Reported { .. })
    }
}

pub struct TransitReportEmitter {
    sink: Box<dyn ReportSink + Send>,
    counters: Counters,
    cooldown: Duration,
    last_report_at: Option<Instant>,
    metrics: Arc<Metrics>,
}

impl TransitReportEmitter {
    pub fn new(sink: Box<dyn ReportSink + Send>, cooldown: Duration, metrics: Arc<Metrics>) -> Self {
        Self { sink, counters: Counters::default(), cooldown, last_report_at: None, metrics }
    }

    pub fn counters(&self) -> Counters {
        self.counters
    }

    /// Operator reset. The cooldown clock is left alone.
    pub fn reset_counters(&mut self) {
        self.counters.reset();
        self.publish_counters();
    }

    /// Report a completed transit. Returns true only when the batch was
    /// handed off and counted. The batch is consumed in every case.
    pub fn on_transit_complete(
        &mut self,
        direction: Direction,
        batch: TransitBatch,
        now: Instant,
        transit_id: &str,
    ) -> bool {
        self.emit(direction, batch, now, transit_id).reported()
    }

    pub fn emit(
        &mut self,
        direction: Direction,
        batch: TransitBatch,
        now: Instant,
        transit_id: &str,
    ) -> EmitOutcome {
        if batch.is_empty() {
            self.metrics.record_report_empty();
            info!(transit_id = %transit_id, direction = %direction, "nothing_to_report");
            return EmitOutcome::Empty;
        }

        if let Some(last) = self.last_report_at {
            let since = now.saturating_duration_since(last);
            if since < self.cooldown {
                self.metrics.record_report_cooldown();
                warn!(
                    transit_id = %transit_id,
                    direction = %direction,
                    tags = batch.len(),
                    since_last_ms = since.as_millis() as u64,
                    "report_suppressed_cooldown"
                );
                return EmitOutcome::Cooldown;
            }
        }

        if direction == Direction::None {
            self.metrics.record_report_failed();
            warn!(transit_id = %transit_id, tags = batch.len(), "report_without_direction");
            return EmitOutcome::Failed;
        }

        let report = TagReport::new(direction, batch.iter());
        let tags = report.tag_count;

        let result = serde_json::to_string(&report).map_err(ReportError::from).and_then(|json| {
            self.sink.submit(OutboundReport {
                transit_id: transit_id.to_string(),
                direction,
                tag_count: tags,
                json,
            })
        });

        match result {
            Ok(()) => {
                self.counters.record(direction, tags as u64);
                self.last_report_at = Some(now);
                self.metrics.record_report_submitted(tags as u64);
                self.publish_counters();
                info!(
                    transit_id = %transit_id,
                    direction = %direction,
                    tags,
                    inbound_total = self.counters.inbound_total,
                    outbound_total = self.counters.outbound_total,
                    recognized_total = self.counters.recognized_total,
                    "report_submitted"
                );
                EmitOutcome::Reported { tags }
            }
            Err(e) => {
                self.metrics.record_report_failed();
                warn!(transit_id = %transit_id, direction = %direction, tags, error = %e, "report_handoff_failed");
                EmitOutcome::Failed
            }
        }
    }

    fn publish_counters(&self) {
        let c = self.counters;
        self.metrics.set_counters(c.inbound_total, c.outbound_total, c.recognized_total);
        debug!(
            inbound_total = c.inbound_total,
            outbound_total = c.outbound_total,
            recognized_total = c.recognized_total,
            "counters_updated"
        );
    }
}
