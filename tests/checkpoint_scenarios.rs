//! Transit scenarios against the checkpoint controller
//!
//! The reader and messaging seams are replaced by recording fakes. `Harness`
//! feeds samples directly with explicit timestamps; `Rig` runs the polling task
//! against an emulated gate board over an in-memory duplex link, with tag
//! frames and operator commands going through their queues.

use parking_lot::Mutex;
use rfid_checkpoint::domain::error::{ReaderError, ReportError};
use rfid_checkpoint::domain::types::{Counters, Direction, StatusSample, TransitState};
use rfid_checkpoint::infra::{Config, Metrics};
use rfid_checkpoint::io::egress_channel::{create_report_channel, OutboundReport, ReportSink};
use rfid_checkpoint::io::frame_channel::{crc16, FrameChannel, FRAME_START};
use rfid_checkpoint::io::reader::{encode_frame, ReaderCommand, ReaderControl, CMD_TAG_REPORT};
use rfid_checkpoint::io::tag_decoder::CnntTagDecoder;
use rfid_checkpoint::services::{
    create_event_channel, AbortReason, CheckpointController, CheckpointEvent, CheckpointSnapshot,
    ControlCommand, ControllerLinks,
};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Clone, Default)]
struct FakeReader {
    commands: Arc<Mutex<Vec<ReaderCommand>>>,
}

impl ReaderControl for FakeReader {
    fn send(&mut self, command: ReaderCommand) -> Result<(), ReaderError> {
        self.commands.lock().push(command);
        Ok(())
    }
}

#[derive(Clone, Default)]
struct FakeSink {
    sent: Arc<Mutex<Vec<OutboundReport>>>,
    fail: Arc<AtomicBool>,
}

impl ReportSink for FakeSink {
    fn submit(&mut self, report: OutboundReport) -> Result<(), ReportError> {
        if self.fail.load(Ordering::Relaxed) {
            return Err(ReportError::NotConnected);
        }
        self.sent.lock().push(report);
        Ok(())
    }
}

struct Harness {
    controller: CheckpointController,
    reader: FakeReader,
    sink: FakeSink,
    tag_tx: mpsc::Sender<Vec<u8>>,
    events: mpsc::Receiver<CheckpointEvent>,
    snapshot: watch::Receiver<CheckpointSnapshot>,
    metrics: Arc<Metrics>,
    t0: Instant,
}

impl Harness {
    fn new() -> Self {
        let metrics = Arc::new(Metrics::new());
        let reader = FakeReader::default();
        let sink = FakeSink::default();
        let (events_tx, events) = create_event_channel(256, metrics.clone());
        let (tag_tx, tag_rx) = mpsc::channel(64);
        let (_control_tx, control_rx) = mpsc::channel(1);

        let (controller, snapshot) = CheckpointController::new(
            &Config::default(),
            ControllerLinks {
                decoder: Box::new(CnntTagDecoder::new()),
                sink: Box::new(sink.clone()),
                reader: Box::new(reader.clone()),
                events: events_tx,
                tag_rx,
                control_rx,
            },
            metrics.clone(),
        );

        Self { controller, reader, sink, tag_tx, events, snapshot, metrics, t0: Instant::now() }
    }

    /// Feed samples 50ms apart starting at `start_ms`
    fn feed(&mut self, start_ms: u64, samples: &[u8]) -> Vec<TransitState> {
        let mut visited = Vec::new();
        for (i, &status) in samples.iter().enumerate() {
            let at = self.t0 + Duration::from_millis(start_ms + 50 * i as u64);
            let outcome = self.controller.process_sample(StatusSample::new(status, at));
            visited.extend(outcome.steps.iter().map(|s| s.to));
        }
        visited
    }

    fn commands(&self) -> Vec<ReaderCommand> {
        self.reader.commands.lock().clone()
    }

    fn reports(&self) -> Vec<OutboundReport> {
        self.sink.sent.lock().clone()
    }

    fn counters(&self) -> Counters {
        self.controller.snapshot().counters
    }

    fn drain_events(&mut self) -> Vec<CheckpointEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

fn tag_frame(tid: &[u8]) -> Vec<u8> {
    let epc = [0x30, 0x00, tid[tid.len() - 1]];
    let user = b"Flour 1kg\0";
    let mut payload = vec![1u8];
    payload.extend_from_slice(&(-450i16).to_be_bytes());
    payload.push(epc.len() as u8);
    payload.extend_from_slice(&epc);
    payload.push(tid.len() as u8);
    payload.extend_from_slice(tid);
    payload.push(user.len() as u8);
    payload.extend_from_slice(user);
    encode_frame(CMD_TAG_REPORT, &payload)
}

fn assert_counter_invariant(counters: Counters) {
    assert_eq!(counters.recognized_total, counters.inbound_total + counters.outbound_total);
}

#[test]
fn scenario_a_inbound_overlap_path() {
    let mut h = Harness::new();

    assert_eq!(h.feed(0, &[0x00, 0x01]), vec![TransitState::InStart]);
    assert_eq!(h.commands(), vec![ReaderCommand::LoopStart]);

    h.controller.ingest_frame(&tag_frame(&[0xE2, 0x01]));
    h.controller.ingest_frame(&tag_frame(&[0xE2, 0x02]));
    h.controller.ingest_frame(&tag_frame(&[0xE2, 0x03]));
    assert_eq!(h.controller.snapshot().current_load, 3);

    assert_eq!(
        h.feed(100, &[0x03, 0x02, 0x00]),
        vec![TransitState::InMiddle, TransitState::InEnd, TransitState::Idle]
    );
    assert_eq!(h.commands(), vec![ReaderCommand::LoopStart, ReaderCommand::LoopStop]);

    let reports = h.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].direction, Direction::Inbound);
    assert_eq!(reports[0].tag_count, 3);

    let json: serde_json::Value = serde_json::from_str(&reports[0].json).unwrap();
    assert_eq!(json["command"], "report_tags");
    assert_eq!(json["dataType"], "inbound");
    assert_eq!(json["tagCount"], 3);
    assert_eq!(json["tags"][0]["tid"], "E201");
    assert_eq!(json["tags"][0]["productName"], "Flour 1kg");

    assert_eq!(h.counters(), Counters { inbound_total: 3, outbound_total: 0, recognized_total: 3 });
    let snapshot = h.snapshot.borrow().clone();
    assert_eq!(snapshot.state, TransitState::Idle);
    assert_eq!(snapshot.current_load, 0);
    assert_eq!(snapshot.counters.inbound_total, 3);
}

#[test]
fn scenario_b_inbound_direct_path() {
    let mut h = Harness::new();

    h.feed(0, &[0x00, 0x01]);
    h.controller.ingest_frame(&tag_frame(&[0xAA, 0x01]));
    assert_eq!(h.feed(100, &[0x00]), vec![TransitState::InEnd, TransitState::Idle]);

    assert_eq!(h.commands(), vec![ReaderCommand::LoopStart, ReaderCommand::LoopStop]);
    assert_eq!(h.reports().len(), 1);
    assert_eq!(h.counters().inbound_total, 1);
}

#[test]
fn scenario_c_outbound_interrupted() {
    let mut h = Harness::new();

    h.feed(0, &[0x00, 0x02]);
    h.controller.ingest_frame(&tag_frame(&[0xBB, 0x01]));
    assert_eq!(h.feed(100, &[0x03, 0x00]), vec![TransitState::OutMiddle, TransitState::Idle]);

    assert_eq!(h.commands(), vec![ReaderCommand::LoopStart, ReaderCommand::LoopStop]);
    assert!(h.reports().is_empty());
    assert_eq!(h.counters(), Counters::default());
    assert_eq!(h.controller.snapshot().current_load, 0);
    assert_eq!(h.metrics.snapshot().aborted_interrupted_total, 1);

    let aborted = h.drain_events().into_iter().find_map(|e| match e {
        CheckpointEvent::TransitAborted { direction, reason, .. } => Some((direction, reason)),
        _ => None,
    });
    assert_eq!(aborted, Some((Direction::Outbound, AbortReason::Interrupted)));
}

#[test]
fn scenario_d_watchdog_discards_stalled_transit() {
    let mut h = Harness::new();

    h.feed(0, &[0x00, 0x01]);
    h.controller.ingest_frame(&tag_frame(&[0xCC, 0x01]));

    // Entered InStart at t0+50ms; exactly idle_timeout later is not yet stale
    assert!(!h.controller.check_watchdog(h.t0 + Duration::from_millis(10_050)));
    assert_eq!(h.controller.state(), TransitState::InStart);

    assert!(h.controller.check_watchdog(h.t0 + Duration::from_millis(10_051)));
    assert_eq!(h.controller.state(), TransitState::Idle);
    assert_eq!(h.commands(), vec![ReaderCommand::LoopStart, ReaderCommand::LoopStop]);
    assert_eq!(h.controller.snapshot().current_load, 0);
    assert_eq!(h.counters(), Counters::default());
    assert_eq!(h.metrics.snapshot().aborted_watchdog_total, 1);

    // Gate A still occluded: the same status does not restart a transit
    assert!(h.feed(10_100, &[0x01]).is_empty());
    assert_eq!(h.commands().len(), 2);
}

#[test]
fn scenario_e_cooldown_suppresses_second_completion() {
    let mut h = Harness::new();

    h.feed(0, &[0x00, 0x01]);
    h.controller.ingest_frame(&tag_frame(&[0xD0, 0x01]));
    h.feed(100, &[0x00]);

    h.feed(200, &[0x02]);
    h.controller.ingest_frame(&tag_frame(&[0xD0, 0x02]));
    h.feed(300, &[0x00]);

    assert_eq!(h.reports().len(), 1);
    assert_eq!(h.counters(), Counters { inbound_total: 1, outbound_total: 0, recognized_total: 1 });
    assert_eq!(h.metrics.reports_cooldown_total(), 1);

    // Past the cooldown the next transit reports again
    h.feed(1_500, &[0x02]);
    h.controller.ingest_frame(&tag_frame(&[0xD0, 0x03]));
    h.feed(1_600, &[0x00]);
    assert_eq!(h.reports().len(), 2);
    assert_eq!(h.counters().outbound_total, 1);
    assert_counter_invariant(h.counters());
}

#[test]
fn scenario_e_cooldown_same_direction() {
    let mut h = Harness::new();

    h.feed(0, &[0x00, 0x01]);
    h.controller.ingest_frame(&tag_frame(&[0xD1, 0x01]));
    h.feed(100, &[0x00]);

    // Second inbound completion 200ms after the first report
    h.feed(150, &[0x01]);
    h.controller.ingest_frame(&tag_frame(&[0xD1, 0x02]));
    h.feed(300, &[0x00]);

    assert_eq!(h.reports().len(), 1);
    assert_eq!(h.reports()[0].tag_count, 1);
    assert_eq!(h.counters(), Counters { inbound_total: 1, outbound_total: 0, recognized_total: 1 });
    assert_eq!(h.metrics.reports_cooldown_total(), 1);
    assert_eq!(h.controller.snapshot().current_load, 0);
    assert_eq!(
        h.commands(),
        vec![
            ReaderCommand::LoopStart,
            ReaderCommand::LoopStop,
            ReaderCommand::LoopStart,
            ReaderCommand::LoopStop
        ]
    );
}

#[test]
fn duplicate_tids_are_counted_once() {
    let mut h = Harness::new();

    h.feed(0, &[0x00, 0x02]);
    for _ in 0..5 {
        h.controller.ingest_frame(&tag_frame(&[0xEE, 0x01]));
    }
    h.controller.ingest_frame(&tag_frame(&[0xEE, 0x02]));
    assert_eq!(h.controller.snapshot().current_load, 2);
    assert_eq!(h.controller.snapshot().last_tid.as_deref(), Some("EE02"));

    h.feed(100, &[0x01, 0x00]);
    assert_eq!(h.reports()[0].tag_count, 2);
    assert_eq!(h.counters().outbound_total, 2);
    assert_eq!(h.metrics.tags_duplicate_total(), 4);
}

#[test]
fn malformed_tag_frames_are_excluded() {
    let mut h = Harness::new();

    h.feed(0, &[0x00, 0x01]);
    let mut corrupt = tag_frame(&[0x10, 0x01]);
    let n = corrupt.len();
    corrupt[n - 3] ^= 0xFF;
    h.controller.ingest_frame(&corrupt);
    h.controller.ingest_frame(&[0xA5, 0x5A, 0x00]);
    h.controller.ingest_frame(&tag_frame(&[0x10, 0x02]));
    h.feed(100, &[0x00]);

    assert_eq!(h.metrics.tags_decode_failed_total(), 2);
    assert_eq!(h.reports()[0].tag_count, 1);
    assert_eq!(h.counters().inbound_total, 1);
}

#[test]
fn failed_handoff_clears_batch_without_counting() {
    let mut h = Harness::new();
    h.sink.fail.store(true, Ordering::Relaxed);

    h.feed(0, &[0x00, 0x01]);
    h.controller.ingest_frame(&tag_frame(&[0x20, 0x01]));
    h.feed(100, &[0x00]);

    assert_eq!(h.counters(), Counters::default());
    assert_eq!(h.controller.snapshot().current_load, 0);
    assert_eq!(h.metrics.reports_failed_total(), 1);

    let completed = h.drain_events().into_iter().find_map(|e| match e {
        CheckpointEvent::TransitCompleted { tag_count, reported, .. } => Some((tag_count, reported)),
        _ => None,
    });
    assert_eq!(completed, Some((1, false)));
}

#[test]
fn empty_transit_reports_nothing() {
    let mut h = Harness::new();
    h.feed(0, &[0x00, 0x01, 0x03, 0x02, 0x00]);

    assert!(h.reports().is_empty());
    assert_eq!(h.commands(), vec![ReaderCommand::LoopStart, ReaderCommand::LoopStop]);
    assert_eq!(h.metrics.snapshot().reports_empty_total, 1);
}

#[test]
fn repeated_samples_do_not_duplicate_reports() {
    let mut h = Harness::new();

    h.feed(0, &[0x00, 0x00, 0x01, 0x01, 0x01]);
    h.controller.ingest_frame(&tag_frame(&[0x30, 0x01]));
    h.feed(300, &[0x02, 0x02, 0x00, 0x00, 0x00]);

    assert_eq!(h.reports().len(), 1);
    assert_eq!(h.commands(), vec![ReaderCommand::LoopStart, ReaderCommand::LoopStop]);
    assert_eq!(h.metrics.snapshot().state_transitions_total, 3);
}

#[test]
fn tags_queued_before_completion_are_included() {
    let mut h = Harness::new();

    h.feed(0, &[0x00, 0x01]);
    h.tag_tx.try_send(tag_frame(&[0x40, 0x01])).unwrap();
    h.tag_tx.try_send(tag_frame(&[0x40, 0x02])).unwrap();
    h.feed(100, &[0x00]);

    assert_eq!(h.reports()[0].tag_count, 2);
}

#[test]
fn transit_start_clears_stale_tags() {
    let mut h = Harness::new();

    // Late frames after the previous LOOP_STOP
    h.controller.ingest_frame(&tag_frame(&[0x50, 0x01]));
    assert_eq!(h.controller.snapshot().current_load, 1);

    h.feed(0, &[0x00, 0x01]);
    assert_eq!(h.controller.snapshot().current_load, 0);
    h.controller.ingest_frame(&tag_frame(&[0x50, 0x02]));
    h.feed(100, &[0x00]);
    assert_eq!(h.reports()[0].tag_count, 1);
}

#[test]
fn queued_tags_of_aborted_transit_are_discarded() {
    let mut h = Harness::new();

    h.feed(0, &[0x00, 0x02]);
    h.tag_tx.try_send(tag_frame(&[0x90, 0x01])).unwrap();
    h.tag_tx.try_send(tag_frame(&[0x90, 0x02])).unwrap();
    h.feed(100, &[0x03, 0x00]);
    assert_eq!(h.metrics.snapshot().aborted_interrupted_total, 1);
    assert_eq!(h.metrics.tags_discarded_total(), 2);

    h.feed(200, &[0x01]);
    h.tag_tx.try_send(tag_frame(&[0x90, 0x03])).unwrap();
    h.feed(300, &[0x00]);

    let reports = h.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].direction, Direction::Inbound);
    assert_eq!(reports[0].tag_count, 1);
    assert!(reports[0].json.contains("\"9003\""));
    assert!(!reports[0].json.contains("\"9001\""));
    assert_eq!(h.counters(), Counters { inbound_total: 1, outbound_total: 0, recognized_total: 1 });
}

#[test]
fn watchdog_abort_discards_queued_tags() {
    let mut h = Harness::new();

    h.feed(0, &[0x00, 0x01]);
    h.tag_tx.try_send(tag_frame(&[0x91, 0x01])).unwrap();
    h.tag_tx.try_send(tag_frame(&[0x91, 0x02])).unwrap();
    assert!(h.controller.check_watchdog(h.t0 + Duration::from_millis(10_051)));
    assert_eq!(h.metrics.tags_discarded_total(), 2);

    h.feed(10_100, &[0x00, 0x01]);
    h.tag_tx.try_send(tag_frame(&[0x91, 0x03])).unwrap();
    h.feed(10_200, &[0x00]);

    assert_eq!(h.reports().len(), 1);
    assert_eq!(h.reports()[0].tag_count, 1);
    assert_eq!(h.counters().inbound_total, 1);
}

#[test]
fn late_frames_queued_while_idle_are_not_reported() {
    let mut h = Harness::new();

    h.feed(0, &[0x00, 0x01]);
    h.tag_tx.try_send(tag_frame(&[0x92, 0x01])).unwrap();
    h.feed(100, &[0x00]);
    assert_eq!(h.reports()[0].tag_count, 1);

    // Reader still finishing its loop after LOOP_STOP
    h.tag_tx.try_send(tag_frame(&[0x92, 0x02])).unwrap();
    h.tag_tx.try_send(tag_frame(&[0x92, 0x03])).unwrap();

    h.feed(2_000, &[0x02]);
    assert_eq!(h.controller.snapshot().current_load, 0);
    assert_eq!(h.metrics.tags_discarded_total(), 2);
    h.tag_tx.try_send(tag_frame(&[0x92, 0x04])).unwrap();
    h.feed(2_100, &[0x00]);

    let reports = h.reports();
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[1].direction, Direction::Outbound);
    assert_eq!(reports[1].tag_count, 1);
    assert_eq!(h.counters(), Counters { inbound_total: 1, outbound_total: 1, recognized_total: 2 });
}

#[test]
fn counters_hold_invariant_and_reset() {
    let mut h = Harness::new();
    let mut at = 0;
    let mut tid = 0u8;

    for path in [&[0x01u8, 0x03, 0x02, 0x00][..], &[0x02, 0x03, 0x01, 0x00], &[0x01, 0x00], &[0x02, 0x00]] {
        h.feed(at, &[0x00]);
        h.feed(at + 50, &path[..1]);
        tid += 1;
        h.controller.ingest_frame(&tag_frame(&[0x60, tid]));
        h.feed(at + 100, &path[1..]);
        assert_counter_invariant(h.counters());
        at += 2_000;
    }

    assert_eq!(h.counters(), Counters { inbound_total: 2, outbound_total: 2, recognized_total: 4 });

    h.controller.handle_control(ControlCommand::ResetCounters);
    assert_eq!(h.counters(), Counters::default());
    assert_eq!(h.snapshot.borrow().counters, Counters::default());
}

#[test]
fn events_follow_transit_lifecycle() {
    let mut h = Harness::new();

    h.feed(0, &[0x00, 0x02]);
    h.controller.ingest_frame(&tag_frame(&[0x70, 0x01]));
    h.feed(100, &[0x01, 0x00]);

    let names: Vec<&str> = h.drain_events().iter().map(|e| e.name()).collect();
    assert_eq!(names, vec!["transit_started", "tag_ingested", "transit_completed"]);
}

/// Valid status response with a correct CRC
fn status_frame(cmd: u8, status: u8) -> Vec<u8> {
    let mut frame = vec![FRAME_START, cmd, 0x01, status];
    let crc = crc16(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

/// Gate board: answers every 8-byte request with the current status
async fn gate_emulator(mut port: DuplexStream, status: Arc<AtomicU8>) {
    let mut request = [0u8; 8];
    loop {
        if port.read_exact(&mut request).await.is_err() {
            return;
        }
        let frame = status_frame(request[1], status.load(Ordering::Relaxed));
        if port.write_all(&frame).await.is_err() {
            return;
        }
    }
}

/// Controller polling an emulated board on its own task
struct Rig {
    status: Arc<AtomicU8>,
    tag_tx: mpsc::Sender<Vec<u8>>,
    control_tx: mpsc::Sender<ControlCommand>,
    snapshot: watch::Receiver<CheckpointSnapshot>,
    report_rx: mpsc::Receiver<OutboundReport>,
    reader: FakeReader,
    metrics: Arc<Metrics>,
    board_task: JoinHandle<()>,
    poller: JoinHandle<CheckpointController>,
}

const STEP: Duration = Duration::from_millis(300);

impl Rig {
    fn start() -> Self {
        let metrics = Arc::new(Metrics::new());
        let reader = FakeReader::default();
        let connected = Arc::new(AtomicBool::new(true));
        let (report_sender, report_rx) = create_report_channel(8, connected);
        let (events_tx, _events_rx) = create_event_channel(256, metrics.clone());
        let (tag_tx, tag_rx) = mpsc::channel(64);
        let (control_tx, control_rx) = mpsc::channel(1);

        let (mut controller, snapshot) = CheckpointController::new(
            &Config::default(),
            ControllerLinks {
                decoder: Box::new(CnntTagDecoder::new()),
                sink: Box::new(report_sender),
                reader: Box::new(reader.clone()),
                events: events_tx,
                tag_rx,
                control_rx,
            },
            metrics.clone(),
        );

        let (host, board) = tokio::io::duplex(64);
        let status = Arc::new(AtomicU8::new(0x00));
        let board_task = tokio::spawn(gate_emulator(board, status.clone()));
        let poller = tokio::spawn(async move {
            let mut channel = FrameChannel::new(host, "emulator");
            controller.run(&mut channel).await;
            controller
        });

        Self { status, tag_tx, control_tx, snapshot, report_rx, reader, metrics, board_task, poller }
    }

    /// Set the gate bits and let a few polls go by
    async fn gates(&self, status: u8) {
        self.status.store(status, Ordering::Relaxed);
        tokio::time::sleep(STEP).await;
    }

    async fn tags(&self, tids: &[[u8; 2]]) {
        for tid in tids {
            self.tag_tx.send(tag_frame(tid)).await.unwrap();
        }
        tokio::time::sleep(STEP).await;
    }

    fn state(&self) -> TransitState {
        self.snapshot.borrow().state
    }

    /// Unplug the board and wait for the polling task to return
    async fn stop(self) -> (CheckpointController, FakeReader, Arc<Metrics>) {
        self.board_task.abort();
        let controller = self.poller.await.unwrap();
        (controller, self.reader, self.metrics)
    }
}

#[tokio::test(start_paused = true)]
async fn end_to_end_inbound_transit_over_emulated_board() {
    let mut rig = Rig::start();
    tokio::time::sleep(STEP).await;

    rig.gates(0x01).await;
    assert_eq!(rig.state(), TransitState::InStart);

    rig.tags(&[[0x80, 0x01], [0x80, 0x02], [0x80, 0x01]]).await;
    assert_eq!(rig.snapshot.borrow().current_load, 2);

    rig.gates(0x03).await;
    rig.gates(0x02).await;
    assert_eq!(rig.state(), TransitState::InEnd);
    assert_eq!(rig.snapshot.borrow().current_load, 2);

    rig.gates(0x00).await;

    let report = rig.report_rx.try_recv().unwrap();
    assert_eq!(report.direction, Direction::Inbound);
    assert_eq!(report.tag_count, 2);
    assert!(report.json.contains("\"tagCount\":2"));
    assert_eq!(rig.snapshot.borrow().counters.inbound_total, 2);

    let (controller, reader, metrics) = rig.stop().await;
    assert_eq!(controller.state(), TransitState::Idle);
    assert_eq!(*reader.commands.lock(), vec![ReaderCommand::LoopStart, ReaderCommand::LoopStop]);
    assert!(metrics.polls_total() >= 10);
    assert_eq!(metrics.tags_duplicate_total(), 1);
    assert_eq!(metrics.reports_submitted_total(), 1);
}

#[tokio::test(start_paused = true)]
async fn aborted_transit_tags_stay_out_of_next_report() {
    let mut rig = Rig::start();
    tokio::time::sleep(STEP).await;

    rig.gates(0x02).await;
    rig.tags(&[[0x90, 0x01], [0x90, 0x02]]).await;
    assert_eq!(rig.snapshot.borrow().current_load, 2);
    rig.gates(0x03).await;
    rig.gates(0x00).await;
    assert_eq!(rig.state(), TransitState::Idle);
    assert_eq!(rig.snapshot.borrow().current_load, 0);

    rig.gates(0x01).await;
    rig.tags(&[[0x90, 0x03]]).await;
    rig.gates(0x00).await;

    let report = rig.report_rx.try_recv().unwrap();
    assert_eq!(report.direction, Direction::Inbound);
    assert_eq!(report.tag_count, 1);
    assert!(report.json.contains("\"9003\""));
    assert!(!report.json.contains("\"9001\""));
    assert!(rig.report_rx.try_recv().is_err());
    assert_eq!(
        rig.snapshot.borrow().counters,
        Counters { inbound_total: 1, outbound_total: 0, recognized_total: 1 }
    );

    let (_controller, _reader, metrics) = rig.stop().await;
    assert_eq!(metrics.snapshot().aborted_interrupted_total, 1);
}

#[tokio::test(start_paused = true)]
async fn tags_arriving_while_idle_are_dropped() {
    let rig = Rig::start();
    tokio::time::sleep(STEP).await;

    rig.tags(&[[0x93, 0x01], [0x93, 0x02]]).await;
    assert_eq!(rig.state(), TransitState::Idle);
    assert_eq!(rig.snapshot.borrow().current_load, 0);
    assert_eq!(rig.snapshot.borrow().last_tid, None);

    let (_controller, _reader, metrics) = rig.stop().await;
    assert_eq!(metrics.tags_discarded_total(), 2);
    assert_eq!(metrics.snapshot().tags_ingested_total, 0);
}

#[tokio::test(start_paused = true)]
async fn reset_command_is_served_while_polling() {
    let mut rig = Rig::start();
    tokio::time::sleep(STEP).await;

    rig.gates(0x02).await;
    rig.tags(&[[0x94, 0x01]]).await;
    rig.gates(0x00).await;
    assert!(rig.report_rx.try_recv().is_ok());
    assert_eq!(rig.snapshot.borrow().counters.outbound_total, 1);

    rig.control_tx.send(ControlCommand::ResetCounters).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(rig.snapshot.borrow().counters, Counters::default());

    // Also honoured mid-transit, without disturbing the batch
    rig.gates(0x01).await;
    rig.tags(&[[0x94, 0x02]]).await;
    rig.control_tx.send(ControlCommand::ResetCounters).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(rig.state(), TransitState::InStart);
    assert_eq!(rig.snapshot.borrow().current_load, 1);

    let (controller, _reader, _metrics) = rig.stop().await;
    assert_eq!(controller.snapshot().counters, Counters::default());
}
