//! Fixed RFID reader TCP client
//!
//! Protocol:
//! - Frame: `A5 5A lenHi lenLo cmd payload.. xor 0D 0A`
//! - `len` counts the whole frame, header and trailer included
//! - Checksum: XOR of every byte from `lenHi` through the last payload byte
//!
//! The client reconnects forever. Tag-loop responses (0x83) are forwarded
//! raw to the polling task, which owns decoding and deduplication.

use crate::domain::error::{ProtocolError, ReaderError};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use bytes::{Buf, BytesMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

const HEADER: [u8; 2] = [0xA5, 0x5A];
const TRAILER: [u8; 2] = [0x0D, 0x0A];
/// Header, length, command, checksum, trailer
pub const MIN_FRAME_LEN: usize = 8;
const MAX_FRAME_LEN: usize = 1024;

pub const CMD_LOOP_START: u8 = 0x82;
pub const CMD_TAG_REPORT: u8 = 0x83;
pub const CMD_LOOP_STOP: u8 = 0x8C;
pub const CMD_LOOP_STOP_ACK: u8 = 0x8D;

/// Log connection failure (cold path)
#[cold]
fn log_connect_failed(addr: &str, e: &std::io::Error) {
    error!(addr = %addr, error = %e, "reader_connect_failed");
}

/// Log read error (cold path)
#[cold]
fn log_read_error(e: &std::io::Error) {
    error!(error = %e, "reader_read_error");
}

/// Log write failure (cold path)
#[cold]
fn log_write_failed(command: ReaderCommand, reason: &str) {
    error!(command = %command.as_str(), reason = %reason, "reader_write_failed");
}

pub fn xor_checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &b| acc ^ b)
}

/// Build a complete frame around `payload`
pub fn encode_frame(command: u8, payload: &[u8]) -> Vec<u8> {
    let len = MIN_FRAME_LEN + payload.len();
    let mut frame = Vec::with_capacity(len);
    frame.extend_from_slice(&HEADER);
    frame.extend_from_slice(&(len as u16).to_be_bytes());
    frame.push(command);
    frame.extend_from_slice(payload);
    frame.push(xor_checksum(&frame[2..]));
    frame.extend_from_slice(&TRAILER);
    frame
}

/// Validate one complete frame and return its command and payload
pub fn split_frame(frame: &[u8]) -> Result<(u8, &[u8]), ProtocolError> {
    if frame.len() < MIN_FRAME_LEN {
        return Err(ProtocolError::ShortFrame { len: frame.len(), min: MIN_FRAME_LEN });
    }
    if frame[..2] != HEADER {
        return Err(ProtocolError::BadHeader);
    }
    let declared = u16::from_be_bytes([frame[2], frame[3]]) as usize;
    if declared != frame.len() {
        return Err(ProtocolError::BadLength { len: declared });
    }
    let n = frame.len();
    if frame[n - 2..] != TRAILER {
        return Err(ProtocolError::BadTrailer);
    }
    let found = frame[n - 3];
    let computed = xor_checksum(&frame[2..n - 3]);
    if found != computed {
        return Err(ProtocolError::XorMismatch { found, computed });
    }
    Ok((frame[4], &frame[5..n - 3]))
}

/// Find the next frame at the front of a receive buffer.
///
/// Returns the frame (or why bytes were dropped) and how many bytes to
/// consume. `None` means more data is needed.
pub fn scan_frame(buf: &[u8]) -> Option<(Result<&[u8], ProtocolError>, usize)> {
    if buf.len() < HEADER.len() {
        return None;
    }

    match buf.windows(2).position(|w| w == HEADER) {
        Some(0) => {}
        Some(pos) => return Some((Err(ProtocolError::BadHeader), pos)),
        None => {
            // Keep a trailing 0xA5, it may be the start of the next header
            let keep = usize::from(buf[buf.len() - 1] == HEADER[0]);
            return Some((Err(ProtocolError::BadHeader), buf.len() - keep));
        }
    }

    if buf.len() < 4 {
        return None;
    }
    let len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    if !(MIN_FRAME_LEN..=MAX_FRAME_LEN).contains(&len) {
        return Some((Err(ProtocolError::BadLength { len }), HEADER.len()));
    }
    if buf.len() < len {
        return None;
    }

    let frame = &buf[..len];
    match split_frame(frame) {
        Ok(_) => Some((Ok(frame), len)),
        // Length may be corrupt, resync from the next byte pair
        Err(e @ ProtocolError::BadTrailer) => Some((Err(e), HEADER.len())),
        Err(e) => Some((Err(e), len)),
    }
}

/// Reader loop control
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderCommand {
    LoopStart,
    LoopStop,
}

impl ReaderCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReaderCommand::LoopStart => "LOOP_START",
            ReaderCommand::LoopStop => "LOOP_STOP",
        }
    }

    pub fn command_byte(&self) -> u8 {
        match self {
            ReaderCommand::LoopStart => CMD_LOOP_START,
            ReaderCommand::LoopStop => CMD_LOOP_STOP,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        encode_frame(self.command_byte(), &[])
    }
}

/// Non-blocking reader control seam used by the polling task
pub trait ReaderControl {
    fn send(&mut self, command: ReaderCommand) -> Result<(), ReaderError>;
}

/// Cloneable handle that queues commands for the client task
#[derive(Clone)]
pub struct ReaderHandle {
    tx: mpsc::Sender<ReaderCommand>,
    connected: Arc<AtomicBool>,
}

impl ReaderHandle {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

impl ReaderControl for ReaderHandle {
    fn send(&mut self, command: ReaderCommand) -> Result<(), ReaderError> {
        if !self.is_connected() {
            return Err(ReaderError::NotConnected);
        }
        self.tx.try_send(command).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ReaderError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => ReaderError::Closed,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ReaderClientConfig {
    pub addr: String,
    pub dial_timeout: Duration,
    pub reconnect_delay: Duration,
    pub write_timeout: Duration,
}

impl ReaderClientConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            addr: config.reader_addr().to_string(),
            dial_timeout: config.reader_dial_timeout(),
            reconnect_delay: config.reader_reconnect_delay(),
            write_timeout: Duration::from_secs(2),
        }
    }
}

pub struct ReaderClient {
    config: ReaderClientConfig,
    cmd_rx: mpsc::Receiver<ReaderCommand>,
    tag_tx: mpsc::Sender<Vec<u8>>,
    connected: Arc<AtomicBool>,
    metrics: Arc<Metrics>,
}

/// Create the client task and its control handle. Tag frames go to `tag_tx`.
pub fn create_reader(
    config: ReaderClientConfig,
    tag_tx: mpsc::Sender<Vec<u8>>,
    metrics: Arc<Metrics>,
) -> (ReaderClient, ReaderHandle) {
    let (tx, cmd_rx) = mpsc::channel(16);
    let connected = Arc::new(AtomicBool::new(false));
    let handle = ReaderHandle { tx, connected: connected.clone() };
    (ReaderClient { config, cmd_rx, tag_tx, connected, metrics }, handle)
}

impl ReaderClient {
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(addr = %self.config.addr, "reader_client_started");

        loop {
            let dial = tokio::time::timeout(
                self.config.dial_timeout,
                TcpStream::connect(&self.config.addr),
            )
            .await;

            match dial {
                Ok(Ok(stream)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(error = %e, "reader_nodelay_failed");
                    }
                    info!(addr = %self.config.addr, "reader_connected");
                    self.set_connected(true);

                    // Commands queued before the drop are stale
                    while self.cmd_rx.try_recv().is_ok() {}

                    let keep_running = self.serve(stream, &mut shutdown).await;
                    self.set_connected(false);
                    if !keep_running {
                        info!("reader_client_shutdown");
                        return;
                    }
                    warn!(addr = %self.config.addr, "reader_disconnected");
                }
                Ok(Err(e)) => log_connect_failed(&self.config.addr, &e),
                Err(_) => {
                    let e = std::io::Error::from(std::io::ErrorKind::TimedOut);
                    log_connect_failed(&self.config.addr, &e);
                }
            }

            tokio::select! {
                _ = shutdown.changed() => {
                    info!("reader_client_shutdown");
                    return;
                }
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
        }
    }

    fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
        self.metrics.set_reader_connected(connected);
    }

    /// Pump one connection. Returns false when the client should stop.
    async fn serve(&mut self, stream: TcpStream, shutdown: &mut watch::Receiver<bool>) -> bool {
        let (mut read_half, mut write_half) = stream.into_split();
        let mut buf = [0u8; 1024];
        let mut acc = BytesMut::with_capacity(4096);

        loop {
            tokio::select! {
                _ = shutdown.changed() => return false,
                cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = cmd else { return false };
                    let frame = cmd.encode();
                    match tokio::time::timeout(self.config.write_timeout, write_half.write_all(&frame)).await {
                        Ok(Ok(())) => {
                            self.metrics.record_reader_command();
                            debug!(command = %cmd.as_str(), hex = %hex::encode_upper(&frame), "reader_command_sent");
                        }
                        Ok(Err(e)) => {
                            log_write_failed(cmd, &e.to_string());
                            return true;
                        }
                        Err(_) => {
                            log_write_failed(cmd, "timeout");
                            return true;
                        }
                    }
                }
                read = read_half.read(&mut buf) => {
                    let n = match read {
                        Ok(0) => {
                            warn!("reader_connection_closed");
                            return true;
                        }
                        Ok(n) => n,
                        Err(e) => {
                            log_read_error(&e);
                            return true;
                        }
                    };
                    acc.extend_from_slice(&buf[..n]);
                    if !self.drain_frames(&mut acc) {
                        return false;
                    }
                }
            }
        }
    }

    /// Dispatch every complete frame in `acc`. Returns false if the polling task is gone.
    fn drain_frames(&self, acc: &mut BytesMut) -> bool {
        while let Some((scanned, consumed)) = scan_frame(acc) {
            let scanned = scanned.map(|frame| frame.to_vec());
            acc.advance(consumed);

            let frame = match scanned {
                Ok(frame) => frame,
                Err(ProtocolError::BadHeader) => {
                    debug!(skipped = consumed, "reader_resync");
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "reader_invalid_frame");
                    continue;
                }
            };

            match frame[4] {
                CMD_TAG_REPORT => match self.tag_tx.try_send(frame) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        self.metrics.record_reader_frame_dropped();
                        warn!("reader_tag_queue_full");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => return false,
                },
                CMD_LOOP_STOP_ACK => {
                    self.metrics.record_reader_ack();
                    debug!("reader_loop_stop_ack");
                }
                command => {
                    let e = ProtocolError::UnknownCommand { command };
                    warn!(error = %e, "reader_unexpected_frame");
                }
            }
        }
        true
    }
}
