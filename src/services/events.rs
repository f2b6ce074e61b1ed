//! Outbound event interface, snapshot and operator commands
//!
//! Observers never touch checkpoint state directly: they receive events over
//! a bounded queue and read the latest `CheckpointSnapshot` from a watch
//! channel. Operator commands travel the other way into the polling task.

use crate::domain::types::{Counters, Direction, TransitState};
use crate::infra::metrics::Metrics;
use crate::io::mqtt::InboundMessage;
use crate::services::transit::AbortReason;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Something observers may want to know about
#[derive(Debug, Clone, PartialEq)]
pub enum CheckpointEvent {
    TransitStarted { transit_id: String, direction: Direction },
    /// `reported` is true when the batch was handed to messaging and counted
    TransitCompleted { transit_id: String, direction: Direction, tag_count: usize, reported: bool },
    TransitAborted { transit_id: String, direction: Direction, reason: AbortReason },
    TagIngested { tid: String, load: usize },
    ChannelError { message: String },
    RemoteMessage(InboundMessage),
}

impl CheckpointEvent {
    pub fn name(&self) -> &'static str {
        match self {
            CheckpointEvent::TransitStarted { .. } => "transit_started",
            CheckpointEvent::TransitCompleted { .. } => "transit_completed",
            CheckpointEvent::TransitAborted { .. } => "transit_aborted",
            CheckpointEvent::TagIngested { .. } => "tag_ingested",
            CheckpointEvent::ChannelError { .. } => "channel_error",
            CheckpointEvent::RemoteMessage(_) => "remote_message",
        }
    }
}

/// Non-blocking event sender. Drops (and counts) events when observers lag.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<CheckpointEvent>,
    metrics: Arc<Metrics>,
}

impl EventSender {
    pub fn send(&self, event: CheckpointEvent) {
        if let Err(mpsc::error::TrySendError::Full(_)) = self.tx.try_send(event) {
            self.metrics.record_event_dropped();
        }
    }
}

pub fn create_event_channel(
    capacity: usize,
    metrics: Arc<Metrics>,
) -> (EventSender, mpsc::Receiver<CheckpointEvent>) {
    let (tx, rx) = mpsc::channel(capacity);
    (EventSender { tx, metrics }, rx)
}

/// Immutable view of the checkpoint, republished after every mutation
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CheckpointSnapshot {
    pub state: TransitState,
    pub direction: Direction,
    pub current_load: usize,
    pub counters: Counters,
    pub last_tid: Option<String>,
    pub last_status: Option<u8>,
}

/// Operator commands into the polling task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    ResetCounters,
}
