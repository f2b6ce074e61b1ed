//! Transit detection state machine
//!
//! Fed one masked gate bitmask per poll cycle. Transitions fire only when the
//! bitmask changes; repeated samples are no-ops. A non-idle state that sees no
//! state change for `idle_timeout` is forced back to idle by the watchdog.
//!
//! The machine is pure: it returns steps and events, and the controller acts
//! on them (reader loop commands, batch handling, reports).

use crate::domain::types::{Direction, TransitState, GATE_A, GATE_B, GATE_BOTH, GATE_CLEAR};
use smallvec::SmallVec;
use std::time::Duration;
use tokio::time::Instant;

/// One state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    pub from: TransitState,
    pub to: TransitState,
}

/// Why a transit was abandoned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// Both gates released from the middle of a transit
    Interrupted,
    /// The first gate re-occluded alone after the second was reached
    Reversed,
    /// No state change within the idle timeout
    Watchdog,
}

impl AbortReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AbortReason::Interrupted => "interrupted",
            AbortReason::Reversed => "reversed",
            AbortReason::Watchdog => "watchdog",
        }
    }
}

/// Transit lifecycle events raised by the machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitEvent {
    Started(Direction),
    Completed(Direction),
    Aborted { direction: Direction, reason: AbortReason },
}

/// Result of feeding one sample
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Outcome {
    pub steps: SmallVec<[Step; 2]>,
    pub event: Option<TransitEvent>,
}

impl Outcome {
    pub fn is_noop(&self) -> bool {
        self.steps.is_empty() && self.event.is_none()
    }
}

enum Next {
    Stay,
    Go(TransitState),
    /// Enter an end state whose release is already observed
    GoAndComplete(TransitState),
    Complete,
    Abort(AbortReason),
}

/// Table lookup for a masked status change
fn next(state: TransitState, status: u8) -> Next {
    use TransitState::*;
    match (state, status) {
        (Idle, GATE_A) => Next::Go(InStart),
        (Idle, GATE_B) => Next::Go(OutStart),

        (InStart, GATE_BOTH) => Next::Go(InMiddle),
        (InStart, GATE_B) => Next::Go(InEnd),
        (InStart, GATE_CLEAR) => Next::GoAndComplete(InEnd),
        (InMiddle, GATE_B) => Next::Go(InEnd),
        (InMiddle, GATE_CLEAR) => Next::Abort(AbortReason::Interrupted),
        (InEnd, GATE_CLEAR) => Next::Complete,
        (InEnd, GATE_A) => Next::Abort(AbortReason::Reversed),

        (OutStart, GATE_BOTH) => Next::Go(OutMiddle),
        (OutStart, GATE_A) => Next::Go(OutEnd),
        (OutStart, GATE_CLEAR) => Next::GoAndComplete(OutEnd),
        (OutMiddle, GATE_A) => Next::Go(OutEnd),
        (OutMiddle, GATE_CLEAR) => Next::Abort(AbortReason::Interrupted),
        (OutEnd, GATE_CLEAR) => Next::Complete,
        (OutEnd, GATE_B) => Next::Abort(AbortReason::Reversed),

        _ => Next::Stay,
    }
}

/// Seven-state transit detector
#[derive(Debug, Clone)]
pub struct TransitStateMachine {
    state: TransitState,
    direction: Direction,
    /// Last masked status; `None` until the first sample
    previous_status: Option<u8>,
    last_change_at: Instant,
    idle_timeout: Duration,
}

impl TransitStateMachine {
    pub fn new(idle_timeout: Duration, now: Instant) -> Self {
        Self {
            state: TransitState::Idle,
            direction: Direction::None,
            previous_status: None,
            last_change_at: now,
            idle_timeout,
        }
    }

    pub fn state(&self) -> TransitState {
        self.state
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn previous_status(&self) -> Option<u8> {
        self.previous_status
    }

    pub fn is_idle(&self) -> bool {
        self.state == TransitState::Idle
    }

    /// Feed one raw status byte. Bits above the two gate bits are ignored.
    pub fn on_status(&mut self, raw: u8, now: Instant) -> Outcome {
        let status = raw & GATE_BOTH;
        let mut outcome = Outcome::default();

        if self.previous_status == Some(status) {
            return outcome;
        }
        self.previous_status = Some(status);

        match next(self.state, status) {
            Next::Stay => {}
            Next::Go(to) => {
                let from = self.state;
                self.enter(to, now, &mut outcome);
                if from == TransitState::Idle {
                    self.direction = to.direction();
                    outcome.event = Some(TransitEvent::Started(self.direction));
                }
            }
            Next::GoAndComplete(to) => {
                self.enter(to, now, &mut outcome);
                let direction = self.direction;
                self.reset(now, &mut outcome);
                outcome.event = Some(TransitEvent::Completed(direction));
            }
            Next::Complete => {
                let direction = self.direction;
                self.reset(now, &mut outcome);
                outcome.event = Some(TransitEvent::Completed(direction));
            }
            Next::Abort(reason) => {
                let direction = self.direction;
                self.reset(now, &mut outcome);
                outcome.event = Some(TransitEvent::Aborted { direction, reason });
            }
        }

        outcome
    }

    /// Force idle when a transit has stalled. Keeps the last status so a gate
    /// still occluded does not immediately restart a transit.
    pub fn check_watchdog(&mut self, now: Instant) -> Option<(Step, TransitEvent)> {
        if self.is_idle() {
            return None;
        }
        if now.saturating_duration_since(self.last_change_at) <= self.idle_timeout {
            return None;
        }

        let direction = self.direction;
        let step = Step { from: self.state, to: TransitState::Idle };
        self.state = TransitState::Idle;
        self.direction = Direction::None;
        self.last_change_at = now;
        Some((step, TransitEvent::Aborted { direction, reason: AbortReason::Watchdog }))
    }

    fn enter(&mut self, to: TransitState, now: Instant, outcome: &mut Outcome) {
        outcome.steps.push(Step { from: self.state, to });
        self.state = to;
        self.last_change_at = now;
    }

    fn reset(&mut self, now: Instant, outcome: &mut Outcome) {
        self.enter(TransitState::Idle, now, outcome);
        self.direction = Direction::None;
    }
}
