//! Services - transit detection and reporting
//!
//! - `transit` - Gate state machine and watchdog
//! - `tag_buffer` - Per-transit tag batch, deduplicated by TID
//! - `report_emitter` - One report per completed transit, cooldown and counters
//! - `events` - Observer events, snapshot and operator commands
//! - `checkpoint` - The polling task that owns all of the above

pub mod checkpoint;
pub mod events;
pub mod report_emitter;
pub mod tag_buffer;
pub mod transit;

pub use checkpoint::{CheckpointController, ControllerLinks};
pub use events::{create_event_channel, CheckpointEvent, CheckpointSnapshot, ControlCommand, EventSender};
pub use report_emitter::{EmitOutcome, TransitReportEmitter};
pub use tag_buffer::{Ingest, TagIngestBuffer, TransitBatch};
pub use transit::{AbortReason, Outcome, TransitEvent, TransitStateMachine};
