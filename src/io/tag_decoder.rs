//! Tag frame decoding
//!
//! Tag-loop response (reader command 0x83):
//!
//! ```text
//! A5 5A lenHi lenLo 83 ant rssiHi rssiLo epcLen epc.. tidLen tid.. userLen user.. xor 0D 0A
//! ```
//!
//! `len` is the whole frame length. RSSI is a signed big-endian value in
//! 0.1 dBm. The XOR covers every byte from `lenHi` up to the checksum.

use crate::domain::error::{DecodeError, ProtocolError};
use crate::domain::types::{ProductMetadata, TagRecord};
use crate::io::reader::{split_frame, CMD_TAG_REPORT};

/// Fixed bytes before the EPC: ant, rssi(2), epcLen
const TAG_HEADER_LEN: usize = 4;

/// Decodes one raw tag frame into a record
pub trait TagDecoder {
    fn decode(&self, raw: &[u8]) -> Result<TagRecord, DecodeError>;
}

/// Local wall-clock timestamp used on tag records
pub fn local_timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Decoder for the fixed-reader tag-loop response
#[derive(Debug, Clone, Copy, Default)]
pub struct CnntTagDecoder;

impl CnntTagDecoder {
    pub fn new() -> Self {
        Self
    }
}

impl TagDecoder for CnntTagDecoder {
    fn decode(&self, raw: &[u8]) -> Result<TagRecord, DecodeError> {
        let (command, payload) = split_frame(raw).map_err(|e| match e {
            ProtocolError::ShortFrame { len, .. } => DecodeError::Truncated { len },
            ProtocolError::XorMismatch { found, computed } => {
                DecodeError::Checksum { found, computed }
            }
            other => DecodeError::Frame(other),
        })?;

        if command != CMD_TAG_REPORT {
            return Err(DecodeError::NotTagFrame { command });
        }
        if payload.len() < TAG_HEADER_LEN {
            return Err(DecodeError::Truncated { len: raw.len() });
        }

        let antenna = payload[0];
        let rssi = i16::from_be_bytes([payload[1], payload[2]]) as f32 / 10.0;

        let mut cursor = FieldCursor { bytes: payload, pos: 3 };
        let epc = cursor.field("epc")?;
        let tid = cursor.field("tid")?;
        let user = cursor.field("user")?;

        if tid.is_empty() {
            return Err(DecodeError::EmptyTid);
        }

        Ok(TagRecord {
            tid: hex::encode_upper(tid),
            epc: hex::encode_upper(epc),
            user_data: hex::encode_upper(user),
            rssi,
            antenna,
            product: product_metadata(user),
            timestamp: local_timestamp(),
            decode_ok: true,
            error_message: None,
        })
    }
}

/// Length-prefixed field reader
struct FieldCursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> FieldCursor<'a> {
    fn field(&mut self, name: &'static str) -> Result<&'a [u8], DecodeError> {
        let len = *self
            .bytes
            .get(self.pos)
            .ok_or(DecodeError::FieldOverrun { field: name, len: 0 })? as usize;
        let start = self.pos + 1;
        let end = start + len;
        if end > self.bytes.len() {
            return Err(DecodeError::FieldOverrun { field: name, len });
        }
        self.pos = end;
        Ok(&self.bytes[start..end])
    }
}

/// Product name is the NUL-terminated UTF-8 prefix of the user bank
fn product_metadata(user: &[u8]) -> ProductMetadata {
    let end = user.iter().position(|&b| b == 0).unwrap_or(user.len());
    let name = std::str::from_utf8(&user[..end])
        .ok()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    ProductMetadata { name, raw: user.to_vec() }
}
