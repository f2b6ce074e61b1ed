//! Shared types for the transit checkpoint

use serde::Serialize;
use tokio::time::Instant;

/// Gate A occluded
pub const GATE_A: u8 = 0x01;
/// Gate B occluded
pub const GATE_B: u8 = 0x02;
/// Both gates occluded
pub const GATE_BOTH: u8 = GATE_A | GATE_B;
/// No gate occluded
pub const GATE_CLEAR: u8 = 0x00;

/// One poll cycle's gate bitmask
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusSample {
    pub raw_byte: u8,
    pub captured_at: Instant,
}

impl StatusSample {
    pub fn new(raw_byte: u8, captured_at: Instant) -> Self {
        Self { raw_byte, captured_at }
    }

    /// Gate bits only (bit0 = A, bit1 = B). Other inputs on the board are ignored.
    #[inline]
    pub fn gates(&self) -> u8 {
        self.raw_byte & GATE_BOTH
    }
}

/// Transit detection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitState {
    #[default]
    Idle,
    InStart,
    InMiddle,
    InEnd,
    OutStart,
    OutMiddle,
    OutEnd,
}

impl TransitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitState::Idle => "idle",
            TransitState::InStart => "in_start",
            TransitState::InMiddle => "in_middle",
            TransitState::InEnd => "in_end",
            TransitState::OutStart => "out_start",
            TransitState::OutMiddle => "out_middle",
            TransitState::OutEnd => "out_end",
        }
    }

    /// Numeric code used for the Prometheus state gauge
    pub fn code(&self) -> u64 {
        match self {
            TransitState::Idle => 0,
            TransitState::InStart => 1,
            TransitState::InMiddle => 2,
            TransitState::InEnd => 3,
            TransitState::OutStart => 4,
            TransitState::OutMiddle => 5,
            TransitState::OutEnd => 6,
        }
    }

    /// Direction implied by the branch this state belongs to
    pub fn direction(&self) -> Direction {
        match self {
            TransitState::Idle => Direction::None,
            TransitState::InStart | TransitState::InMiddle | TransitState::InEnd => {
                Direction::Inbound
            }
            TransitState::OutStart | TransitState::OutMiddle | TransitState::OutEnd => {
                Direction::Outbound
            }
        }
    }
}

impl std::fmt::Display for TransitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transit direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    None,
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::None => "none",
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Product fields carried in the tag's user bank. The layout is reader-vendor
/// specific, so only the display name is interpreted.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProductMetadata {
    pub name: Option<String>,
    #[serde(skip)]
    pub raw: Vec<u8>,
}

impl ProductMetadata {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("")
    }
}

/// A decoded (or failed) tag read
#[derive(Debug, Clone, PartialEq)]
pub struct TagRecord {
    /// Tag identifier, the dedup key
    pub tid: String,
    pub epc: String,
    pub user_data: String,
    /// dBm
    pub rssi: f32,
    pub antenna: u8,
    pub product: ProductMetadata,
    /// Local wall-clock time of the read
    pub timestamp: String,
    pub decode_ok: bool,
    pub error_message: Option<String>,
}

impl TagRecord {
    /// Record for a frame that could not be decoded. Logged, never batched.
    pub fn failed(error_message: impl Into<String>, timestamp: String) -> Self {
        Self {
            tid: String::new(),
            epc: String::new(),
            user_data: String::new(),
            rssi: 0.0,
            antenna: 0,
            product: ProductMetadata::default(),
            timestamp,
            decode_ok: false,
            error_message: Some(error_message.into()),
        }
    }
}

/// Cumulative transit counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    pub inbound_total: u64,
    pub outbound_total: u64,
    pub recognized_total: u64,
}

impl Counters {
    /// Add `tags` to the total for `direction` and recompute the recognized total.
    /// Returns false (and changes nothing) for `Direction::None`.
    pub fn record(&mut self, direction: Direction, tags: u64) -> bool {
        match direction {
            Direction::Inbound => self.inbound_total += tags,
            Direction::Outbound => self.outbound_total += tags,
            Direction::None => return false,
        }
        self.recognized_total = self.inbound_total + self.outbound_total;
        true
    }

    /// Operator reset
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
