//! Serial register channel for the light-gate I/O board
//!
//! Protocol (Modbus-RTU shaped, 8N1):
//! - Request: `FE cmd 00 00 00 08 crcLo crcHi`, CRC over the first 6 bytes
//! - Response: `FE cmd count data.. crcLo crcHi`, byte 3 carries the gate bitmask
//! - CRC16: poly 0xA001 (reflected 0x8005), init 0xFFFF, LSB-first
//!
//! Responses arrive in chunks at low baud rates, so reads drain whatever is
//! ready and stop once the declared length is in or the line has been quiet
//! for one inter-byte window.

use crate::domain::error::{ChannelError, ProtocolError};
use std::io::{self, ErrorKind};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, timeout_at, Instant};
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info, trace, warn};

pub const FRAME_START: u8 = 0xFE;
pub const REQUEST_LEN: usize = 8;
/// Address, command, count, first data byte
pub const MIN_RESPONSE_LEN: usize = 4;
/// Set on the command byte of a device exception response
const EXCEPTION_BIT: u8 = 0x80;
const READ_CHUNK: usize = 64;

/// Linux errno values reported when a USB serial adapter is unplugged
const EIO: i32 = 5;
const ENODEV: i32 = 19;

/// CRC16/Modbus over `bytes`
pub fn crc16(bytes: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in bytes {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Build the 8-byte register read request for `cmd`
pub fn build_request(cmd: u8) -> [u8; REQUEST_LEN] {
    let mut frame = [FRAME_START, cmd, 0x00, 0x00, 0x00, 0x08, 0x00, 0x00];
    let crc = crc16(&frame[..6]);
    frame[6] = (crc & 0xFF) as u8;
    frame[7] = (crc >> 8) as u8;
    frame
}

/// Extract the gate bitmask from a status response.
///
/// The trailing CRC is checked only when the frame holds the full declared
/// length; a truncated frame of at least `MIN_RESPONSE_LEN` bytes is accepted
/// as-is, since the bitmask byte precedes the missing tail.
pub fn parse_status_response(bytes: &[u8], cmd: u8, verify_crc: bool) -> Result<u8, ProtocolError> {
    if bytes.len() < MIN_RESPONSE_LEN {
        return Err(ProtocolError::ShortFrame { len: bytes.len(), min: MIN_RESPONSE_LEN });
    }
    if bytes[0] != FRAME_START {
        return Err(ProtocolError::UnexpectedAddress { expected: FRAME_START, found: bytes[0] });
    }
    if bytes[1] == cmd | EXCEPTION_BIT {
        return Err(ProtocolError::DeviceException { command: cmd, code: bytes[2] });
    }
    if bytes[1] != cmd {
        return Err(ProtocolError::UnexpectedCommand { expected: cmd, found: bytes[1] });
    }

    let count = bytes[2] as usize;
    if count == 0 {
        return Err(ProtocolError::BadLength { len: 0 });
    }

    let body_len = 3 + count;
    if verify_crc && bytes.len() >= body_len + 2 {
        let found = u16::from_le_bytes([bytes[body_len], bytes[body_len + 1]]);
        let computed = crc16(&bytes[..body_len]);
        if found != computed {
            return Err(ProtocolError::CrcMismatch { found, computed });
        }
    }

    Ok(bytes[3])
}

/// Byte link the channel talks over.
///
/// `discard_input` drops bytes the OS has already buffered on the receive side.
pub trait SerialLink: AsyncRead + AsyncWrite + Unpin + Send {
    fn discard_input(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SerialLink for tokio_serial::SerialStream {
    fn discard_input(&mut self) -> io::Result<()> {
        use tokio_serial::{ClearBuffer, SerialPort};
        self.clear(ClearBuffer::Input).map_err(io::Error::from)
    }
}

impl SerialLink for tokio::io::DuplexStream {}

/// True when the error means the device is gone rather than momentarily quiet
fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::BrokenPipe
            | ErrorKind::NotConnected
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::UnexpectedEof
    ) || matches!(e.raw_os_error(), Some(EIO) | Some(ENODEV))
}

fn is_transient(e: &io::Error) -> bool {
    matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted)
}

/// Request/response channel over one serial link
pub struct FrameChannel<L: SerialLink> {
    link: Option<L>,
    label: String,
    inter_byte_timeout: Duration,
    residual_timeout: Duration,
}

impl<L: SerialLink> FrameChannel<L> {
    pub fn new(link: L, label: impl Into<String>) -> Self {
        Self {
            link: Some(link),
            label: label.into(),
            inter_byte_timeout: Duration::from_millis(20),
            residual_timeout: Duration::from_millis(30),
        }
    }

    /// Override the readiness and residual windows
    pub fn with_timeouts(mut self, inter_byte: Duration, residual: Duration) -> Self {
        self.inter_byte_timeout = inter_byte;
        self.residual_timeout = residual;
        self
    }

    pub fn is_open(&self) -> bool {
        self.link.is_some()
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Drop the link on disconnect. Subsequent reads return `ChannelError::NotOpen`.
    fn fail(&mut self, e: &io::Error) {
        if is_disconnect(e) {
            warn!(device = %self.label, error = %e, "frame_channel_disconnected");
            self.link = None;
        }
    }

    /// Send a read request for `cmd` and collect the response bytes.
    ///
    /// Never waits longer than `total_timeout`. Returns whatever arrived once
    /// the line goes quiet; framing is checked by the caller.
    pub async fn read_register(
        &mut self,
        cmd: u8,
        total_timeout: Duration,
    ) -> Result<Vec<u8>, ChannelError> {
        let deadline = Instant::now() + total_timeout;
        let timeout_ms = total_timeout.as_millis() as u64;
        let inter_byte = self.inter_byte_timeout;
        let residual = self.residual_timeout;

        let link = match self.link.as_mut() {
            Some(link) => link,
            None => return Err(ChannelError::NotOpen),
        };

        if let Err(e) = discard_stale(link).await {
            debug!(device = %self.label, error = %e, "frame_channel_discard_failed");
            if is_disconnect(&e) {
                self.fail(&e);
                return Err(ChannelError::Read(e));
            }
        }

        let link = match self.link.as_mut() {
            Some(link) => link,
            None => return Err(ChannelError::NotOpen),
        };

        let request = build_request(cmd);
        let write = async {
            link.write_all(&request).await?;
            link.flush().await
        };
        let written = timeout_at(deadline, write).await;
        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.fail(&e);
                return Err(ChannelError::Write(e));
            }
            Err(_) => return Err(ChannelError::Timeout { timeout_ms }),
        }

        let link = match self.link.as_mut() {
            Some(link) => link,
            None => return Err(ChannelError::NotOpen),
        };

        let mut response = Vec::with_capacity(16);
        let mut buf = [0u8; READ_CHUNK];
        let mut residual_used = false;
        let mut window = inter_byte;

        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let wait = window.min(deadline - now);

            match timeout(wait, link.read(&mut buf)).await {
                Ok(Ok(0)) => {
                    let e = io::Error::from(ErrorKind::UnexpectedEof);
                    self.fail(&e);
                    return Err(ChannelError::Read(e));
                }
                Ok(Ok(n)) => {
                    response.extend_from_slice(&buf[..n]);
                    if frame_complete(&response) {
                        break;
                    }
                    window = inter_byte;
                }
                Ok(Err(e)) if is_transient(&e) => {
                    if quiet(&response, &mut residual_used, &mut window, residual) {
                        break;
                    }
                }
                Ok(Err(e)) => {
                    self.fail(&e);
                    return Err(ChannelError::Read(e));
                }
                Err(_) => {
                    if quiet(&response, &mut residual_used, &mut window, residual) {
                        break;
                    }
                }
            }
        }

        if response.is_empty() {
            return Err(ChannelError::Timeout { timeout_ms });
        }

        trace!(device = %self.label, cmd = cmd, bytes = %hex::encode_upper(&response), "frame_channel_response");
        Ok(response)
    }
}

/// True once the declared length (exception frames are fixed at 5) has arrived
fn frame_complete(response: &[u8]) -> bool {
    if response.len() < 3 || response[0] != FRAME_START {
        return false;
    }
    let expected = if response[1] & EXCEPTION_BIT != 0 { 5 } else { 3 + response[2] as usize + 2 };
    response.len() >= expected
}

/// A read window elapsed with nothing new. Returns true when the response is done.
fn quiet(response: &[u8], residual_used: &mut bool, window: &mut Duration, residual: Duration) -> bool {
    if response.is_empty() {
        return false;
    }
    if response.len() < REQUEST_LEN && !*residual_used {
        *residual_used = true;
        *window = residual;
        return false;
    }
    true
}

/// Drop anything left over from a previous exchange
async fn discard_stale<L: SerialLink>(link: &mut L) -> io::Result<()> {
    link.discard_input()?;
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match timeout(Duration::ZERO, link.read(&mut buf)).await {
            Ok(Ok(0)) => return Err(io::Error::from(ErrorKind::UnexpectedEof)),
            Ok(Ok(n)) => trace!(discarded = n, "frame_channel_discarded_stale"),
            Ok(Err(e)) if is_transient(&e) => return Ok(()),
            Ok(Err(e)) => return Err(e),
            Err(_) => return Ok(()),
        }
    }
}

/// Open the serial device (8N1) as a frame channel
pub fn open_serial(
    device: &str,
    baud: u32,
) -> Result<FrameChannel<tokio_serial::SerialStream>, ChannelError> {
    let port = tokio_serial::new(device, baud)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .timeout(Duration::from_millis(100))
        .open_native_async()
        .map_err(|e| ChannelError::Open { device: device.to_string(), message: e.to_string() })?;

    info!(device = %device, baud = %baud, "frame_channel_opened");
    Ok(FrameChannel::new(port, device))
}
