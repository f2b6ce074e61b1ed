//! Typed channel for outbound transit reports
//!
//! The polling task hands reports over without blocking; a bounded mpsc
//! queue feeds the MQTT publisher. A full queue or a disconnected broker is
//! reported back to the caller so the transit is not counted.

use crate::domain::error::ReportError;
use crate::domain::types::{Direction, TagRecord};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// One tag entry in a report
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TagEntry {
    pub epc: String,
    pub tid: String,
    pub rssi: f32,
    pub timestamp: String,
    pub product_name: String,
}

impl From<&TagRecord> for TagEntry {
    fn from(record: &TagRecord) -> Self {
        Self {
            epc: record.epc.clone(),
            tid: record.tid.clone(),
            rssi: record.rssi,
            timestamp: record.timestamp.clone(),
            product_name: record.product.display_name().to_string(),
        }
    }
}

/// Transit report published to the command topic
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TagReport {
    pub command: &'static str,
    pub tag_count: usize,
    pub data_type: Direction,
    pub tags: Vec<TagEntry>,
}

impl TagReport {
    pub const COMMAND: &'static str = "report_tags";

    pub fn new<'a>(direction: Direction, records: impl IntoIterator<Item = &'a TagRecord>) -> Self {
        let tags: Vec<TagEntry> = records.into_iter().map(TagEntry::from).collect();
        Self { command: Self::COMMAND, tag_count: tags.len(), data_type: direction, tags }
    }
}

/// Serialized report ready for the publisher
#[derive(Debug, Clone)]
pub struct OutboundReport {
    pub transit_id: String,
    pub direction: Direction,
    pub tag_count: usize,
    pub json: String,
}

/// Messaging hand-off seam used by the report emitter
pub trait ReportSink {
    fn submit(&mut self, report: OutboundReport) -> Result<(), ReportError>;
}

/// Non-blocking sender into the publisher queue
#[derive(Clone)]
pub struct ReportSender {
    tx: mpsc::Sender<OutboundReport>,
    connected: Arc<AtomicBool>,
}

impl ReportSender {
    pub fn new(tx: mpsc::Sender<OutboundReport>, connected: Arc<AtomicBool>) -> Self {
        Self { tx, connected }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Current queue depth (for metrics)
    pub fn queue_depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

impl ReportSink for ReportSender {
    fn submit(&mut self, report: OutboundReport) -> Result<(), ReportError> {
        if !self.is_connected() {
            return Err(ReportError::NotConnected);
        }
        self.tx.try_send(report).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ReportError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => ReportError::Closed,
        })
    }
}

/// Create the report queue. `connected` is shared with the MQTT event loop.
pub fn create_report_channel(
    capacity: usize,
    connected: Arc<AtomicBool>,
) -> (ReportSender, mpsc::Receiver<OutboundReport>) {
    let (tx, rx) = mpsc::channel(capacity);
    (ReportSender::new(tx, connected), rx)
}
