//! Checkpoint controller - the polling task
//!
//! Single owner of the state machine, the tag batch, the counters and the
//! watchdog clock. Each cycle it reads the gate register, feeds the state
//! machine, checks the watchdog, then spends the rest of the cadence
//! consuming tag frames and operator commands. Nothing here is shared or
//! locked; observers get events and a watch snapshot.

use crate::domain::error::ChannelError;
use crate::domain::types::{StatusSample, TransitState};
use crate::infra::config::Config;
use crate::infra::metrics::{AbortLabel, Metrics};
use crate::io::egress_channel::ReportSink;
use crate::io::frame_channel::{parse_status_response, FrameChannel, SerialLink};
use crate::io::reader::{ReaderCommand, ReaderControl};
use crate::io::tag_decoder::TagDecoder;
use crate::services::events::{CheckpointEvent, CheckpointSnapshot, ControlCommand, EventSender};
use crate::services::report_emitter::TransitReportEmitter;
use crate::services::tag_buffer::{Ingest, TagIngestBuffer};
use crate::services::transit::{AbortReason, Outcome, TransitEvent, TransitStateMachine};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Collaborators wired into the controller
pub struct ControllerLinks {
    pub decoder: Box<dyn TagDecoder + Send>,
    pub sink: Box<dyn ReportSink + Send>,
    pub reader: Box<dyn ReaderControl + Send>,
    pub events: EventSender,
    pub tag_rx: mpsc::Receiver<Vec<u8>>,
    pub control_rx: mpsc::Receiver<ControlCommand>,
}

pub struct CheckpointController {
    machine: TransitStateMachine,
    buffer: TagIngestBuffer,
    emitter: TransitReportEmitter,
    reader: Box<dyn ReaderControl + Send>,
    events: EventSender,
    snapshot_tx: watch::Sender<CheckpointSnapshot>,
    tag_rx: mpsc::Receiver<Vec<u8>>,
    control_rx: mpsc::Receiver<ControlCommand>,
    metrics: Arc<Metrics>,
    transit_id: Option<String>,
    last_status: Option<u8>,
    channel_error_streak: u32,
    status_command: u8,
    verify_crc: bool,
    poll_interval: Duration,
    read_timeout: Duration,
}

impl CheckpointController {
    pub fn new(
        config: &Config,
        links: ControllerLinks,
        metrics: Arc<Metrics>,
    ) -> (Self, watch::Receiver<CheckpointSnapshot>) {
        let (snapshot_tx, snapshot_rx) = watch::channel(CheckpointSnapshot::default());
        let controller = Self {
            machine: TransitStateMachine::new(config.idle_timeout(), Instant::now()),
            buffer: TagIngestBuffer::new(links.decoder, config.batch_capacity()),
            emitter: TransitReportEmitter::new(links.sink, config.report_cooldown(), metrics.clone()),
            reader: links.reader,
            events: links.events,
            snapshot_tx,
            tag_rx: links.tag_rx,
            control_rx: links.control_rx,
            metrics,
            transit_id: None,
            last_status: None,
            channel_error_streak: 0,
            status_command: config.status_command(),
            verify_crc: config.verify_crc(),
            poll_interval: config.poll_interval(),
            read_timeout: config.read_timeout(),
        };
        (controller, snapshot_rx)
    }

    /// Poll until the serial channel closes
    pub async fn run<L: SerialLink>(&mut self, channel: &mut FrameChannel<L>) {
        info!(
            device = %channel.label(),
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            read_timeout_ms = self.read_timeout.as_millis() as u64,
            "checkpoint_started"
        );
        self.publish_snapshot();

        while channel.is_open() {
            let cycle_start = Instant::now();
            self.poll_once(channel).await;
            self.check_watchdog(Instant::now());
            self.idle_until(cycle_start + self.poll_interval).await;
        }

        self.events.send(CheckpointEvent::ChannelError { message: "serial channel closed".into() });
        info!(device = %channel.label(), "checkpoint_stopped");
    }

    async fn poll_once<L: SerialLink>(&mut self, channel: &mut FrameChannel<L>) {
        let started = Instant::now();
        let bytes = match channel.read_register(self.status_command, self.read_timeout).await {
            Ok(bytes) => bytes,
            Err(e) => {
                self.metrics.record_channel_error();
                self.channel_error_streak += 1;
                let first = self.channel_error_streak == 1;
                match &e {
                    ChannelError::Timeout { timeout_ms } if first => {
                        warn!(timeout_ms = *timeout_ms, "frame_channel_timeout")
                    }
                    ChannelError::Timeout { .. } => {
                        debug!(streak = self.channel_error_streak, "frame_channel_timeout")
                    }
                    _ if first => warn!(kind = e.kind(), error = %e, "frame_channel_error"),
                    _ => debug!(kind = e.kind(), streak = self.channel_error_streak, "frame_channel_error"),
                }
                if first {
                    self.events.send(CheckpointEvent::ChannelError { message: e.to_string() });
                }
                return;
            }
        };

        let status = match parse_status_response(&bytes, self.status_command, self.verify_crc) {
            Ok(status) => status,
            Err(e) => {
                self.metrics.record_protocol_error();
                debug!(error = %e, bytes = %hex::encode_upper(&bytes), "status_frame_rejected");
                return;
            }
        };

        if self.channel_error_streak > 0 {
            info!(after_errors = self.channel_error_streak, "frame_channel_recovered");
            self.channel_error_streak = 0;
        }

        self.metrics.record_poll(started.elapsed().as_micros() as u64);
        self.process_sample(StatusSample::new(status, Instant::now()));
    }

    /// Feed one sample to the state machine and act on the result
    pub fn process_sample(&mut self, sample: StatusSample) -> Outcome {
        let now = sample.captured_at;
        self.last_status = Some(sample.gates());
        self.metrics.set_last_status(sample.gates());

        let outcome = self.machine.on_status(sample.raw_byte, now);
        if outcome.is_noop() {
            trace!(status = sample.gates(), state = %self.machine.state(), "gate_poll");
            self.publish_snapshot();
            return outcome;
        }

        for step in &outcome.steps {
            self.metrics.record_state_transition(step.to);
            info!(from = %step.from, to = %step.to, status = sample.gates(), "state_transition");
        }
        if let Some(event) = outcome.event {
            self.handle_transit_event(event, now);
        }
        self.publish_snapshot();
        outcome
    }

    /// Abort a stalled transit. Returns true if the watchdog fired.
    pub fn check_watchdog(&mut self, now: Instant) -> bool {
        let Some((step, event)) = self.machine.check_watchdog(now) else {
            return false;
        };
        self.metrics.record_state_transition(step.to);
        info!(from = %step.from, to = %step.to, "state_transition");
        self.handle_transit_event(event, now);
        self.publish_snapshot();
        true
    }

    /// Decode and batch one raw tag frame
    pub fn ingest_frame(&mut self, raw: &[u8]) {
        match self.buffer.ingest(raw) {
            Ingest::Inserted { record, load, evicted } => {
                self.metrics.record_tag_ingested(load);
                if let Some(evicted) = evicted {
                    self.metrics.record_tag_evicted();
                    debug!(tid = %evicted, "tag_evicted");
                }
                info!(
                    tid = %record.tid,
                    epc = %record.epc,
                    rssi = record.rssi,
                    antenna = record.antenna,
                    product = %record.product.display_name(),
                    load,
                    "tag_ingested"
                );
                self.events.send(CheckpointEvent::TagIngested { tid: record.tid, load });
            }
            Ingest::Duplicate { tid } => {
                self.metrics.record_tag_duplicate();
                debug!(tid = %tid, "tag_duplicate");
            }
            Ingest::DecodeFailed { record, error } => {
                self.metrics.record_tag_decode_failed();
                warn!(
                    error = %error,
                    at = %record.timestamp,
                    bytes = %hex::encode_upper(raw),
                    "tag_decode_failed"
                );
            }
        }
        self.publish_snapshot();
    }

    pub fn handle_control(&mut self, command: ControlCommand) {
        match command {
            ControlCommand::ResetCounters => {
                let before = self.emitter.counters();
                self.emitter.reset_counters();
                info!(
                    inbound_total = before.inbound_total,
                    outbound_total = before.outbound_total,
                    recognized_total = before.recognized_total,
                    "counters_reset"
                );
            }
        }
        self.publish_snapshot();
    }

    pub fn state(&self) -> TransitState {
        self.machine.state()
    }

    pub fn snapshot(&self) -> CheckpointSnapshot {
        CheckpointSnapshot {
            state: self.machine.state(),
            direction: self.machine.direction(),
            current_load: self.buffer.len(),
            counters: self.emitter.counters(),
            last_tid: self.buffer.last_seen().map(|r| r.tid.clone()),
            last_status: self.last_status,
        }
    }

    /// Wait out the cadence while serving tag frames and operator commands.
    ///
    /// Whatever queued up during the poll is served first, so a deadline that
    /// has already passed never starves the queues.
    async fn idle_until(&mut self, deadline: Instant) {
        while let Ok(command) = self.control_rx.try_recv() {
            self.handle_control(command);
        }
        while let Ok(raw) = self.tag_rx.try_recv() {
            self.accept_tag_frame(&raw);
        }

        let sleep = tokio::time::sleep_until(deadline);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                biased;
                _ = &mut sleep => return,
                Some(command) = self.control_rx.recv() => self.handle_control(command),
                Some(raw) = self.tag_rx.recv() => self.accept_tag_frame(&raw),
            }
        }
    }

    /// Batch a queued frame if a transit is open, otherwise drop it
    fn accept_tag_frame(&mut self, raw: &[u8]) {
        if self.machine.is_idle() {
            self.metrics.record_tags_discarded(1);
            debug!(bytes = %hex::encode_upper(raw), "tag_outside_transit");
            return;
        }
        self.ingest_frame(raw);
    }

    fn drain_pending_tags(&mut self) {
        while let Ok(raw) = self.tag_rx.try_recv() {
            self.ingest_frame(&raw);
        }
    }

    /// Drop queued frames that belong to no transit. Returns how many.
    fn discard_pending_tags(&mut self) -> usize {
        let mut discarded = 0;
        while self.tag_rx.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            self.metrics.record_tags_discarded(discarded as u64);
        }
        discarded
    }

    fn handle_transit_event(&mut self, event: TransitEvent, now: Instant) {
        match event {
            TransitEvent::Started(direction) => {
                let transit_id = uuid::Uuid::now_v7().to_string();
                let stale = self.discard_pending_tags();
                if stale > 0 {
                    debug!(frames = stale, "stale_tags_discarded");
                }
                self.buffer.clear();
                self.metrics.set_current_load(0);
                self.metrics.record_transit_started();
                info!(transit_id = %transit_id, direction = %direction, "transit_started");
                self.send_reader(ReaderCommand::LoopStart);
                self.events.send(CheckpointEvent::TransitStarted {
                    transit_id: transit_id.clone(),
                    direction,
                });
                self.transit_id = Some(transit_id);
            }
            TransitEvent::Completed(direction) => {
                let transit_id = self.transit_id.take().unwrap_or_default();
                self.drain_pending_tags();
                let batch = self.buffer.take();
                let tag_count = batch.len();
                self.metrics.set_current_load(0);
                self.send_reader(ReaderCommand::LoopStop);

                let outcome = self.emitter.emit(direction, batch, now, &transit_id);
                self.metrics.record_transit_completed();
                info!(
                    transit_id = %transit_id,
                    direction = %direction,
                    tags = tag_count,
                    outcome = ?outcome,
                    "transit_completed"
                );
                self.events.send(CheckpointEvent::TransitCompleted {
                    transit_id,
                    direction,
                    tag_count,
                    reported: outcome.reported(),
                });
            }
            TransitEvent::Aborted { direction, reason } => {
                let transit_id = self.transit_id.take().unwrap_or_default();
                self.send_reader(ReaderCommand::LoopStop);
                let queued = self.discard_pending_tags();
                let discarded = self.buffer.len() + queued;
                self.buffer.clear();
                self.metrics.set_current_load(0);
                self.metrics.record_transit_aborted(abort_label(reason));
                warn!(
                    transit_id = %transit_id,
                    direction = %direction,
                    reason = reason.as_str(),
                    discarded,
                    "transit_aborted"
                );
                self.events.send(CheckpointEvent::TransitAborted { transit_id, direction, reason });
            }
        }
    }

    fn send_reader(&mut self, command: ReaderCommand) {
        match self.reader.send(command) {
            Ok(()) => debug!(command = %command.as_str(), "reader_command_queued"),
            Err(e) => {
                self.metrics.record_reader_command_dropped();
                warn!(command = %command.as_str(), error = %e, "reader_command_failed");
            }
        }
    }

    fn publish_snapshot(&self) {
        let next = self.snapshot();
        self.snapshot_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

fn abort_label(reason: AbortReason) -> AbortLabel {
    match reason {
        AbortReason::Interrupted => AbortLabel::Interrupted,
        AbortReason::Reversed => AbortLabel::Reversed,
        AbortReason::Watchdog => AbortLabel::Watchdog,
    }
}
