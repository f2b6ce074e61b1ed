//! Domain models - core checkpoint types
//!
//! This module contains the canonical data types used throughout the system:
//! - `StatusSample` - one poll cycle's gate bitmask
//! - `TransitState` / `Direction` - state machine vocabulary
//! - `TagRecord` - a decoded RFID read
//! - `Counters` - cumulative inbound/outbound totals
//! - `error` - recoverable error taxonomy

pub mod error;
pub mod types;

pub use error::{ChannelError, ConfigError, DecodeError, ProtocolError, ReaderError, ReportError};
pub use types::{Counters, Direction, ProductMetadata, StatusSample, TagRecord, TransitState};
