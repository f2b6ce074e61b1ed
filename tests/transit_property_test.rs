//! Property tests for the transit state machine
//!
//! Random gate sequences (with repeats and noise in the upper bits) are fed to
//! the machine and checked step by step against a plain lookup table.

use proptest::prelude::*;
use rfid_checkpoint::domain::types::{Direction, TransitState};
use rfid_checkpoint::services::transit::{TransitEvent, TransitStateMachine};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Expected {
    Nothing,
    Start(Direction),
    Complete(Direction),
    Abort(Direction),
}

/// Transition table for a changed, masked status
fn table(state: TransitState, status: u8) -> (TransitState, Expected) {
    use Direction::{Inbound, Outbound};
    use Expected::*;
    use TransitState::*;

    match (state, status) {
        (Idle, 1) => (InStart, Start(Inbound)),
        (Idle, 2) => (OutStart, Start(Outbound)),

        (InStart, 2) => (InEnd, Nothing),
        (InStart, 3) => (InMiddle, Nothing),
        (InStart, 0) => (Idle, Complete(Inbound)),
        (InMiddle, 2) => (InEnd, Nothing),
        (InMiddle, 0) => (Idle, Abort(Inbound)),
        (InEnd, 1) => (Idle, Abort(Inbound)),
        (InEnd, 0) => (Idle, Complete(Inbound)),

        (OutStart, 1) => (OutEnd, Nothing),
        (OutStart, 3) => (OutMiddle, Nothing),
        (OutStart, 0) => (Idle, Complete(Outbound)),
        (OutMiddle, 1) => (OutEnd, Nothing),
        (OutMiddle, 0) => (Idle, Abort(Outbound)),
        (OutEnd, 2) => (Idle, Abort(Outbound)),
        (OutEnd, 0) => (Idle, Complete(Outbound)),

        (s, _) => (s, Nothing),
    }
}

fn observed(event: Option<TransitEvent>) -> Expected {
    match event {
        None => Expected::Nothing,
        Some(TransitEvent::Started(d)) => Expected::Start(d),
        Some(TransitEvent::Completed(d)) => Expected::Complete(d),
        Some(TransitEvent::Aborted { direction, .. }) => Expected::Abort(direction),
    }
}

/// Gate samples with random noise above the two gate bits
fn samples() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec((0u8..4, any::<u8>()), 0..300)
        .prop_map(|v| v.into_iter().map(|(gates, noise)| gates | (noise & 0xFC)).collect())
}

proptest! {
    #[test]
    fn prop_follows_transition_table(raw in samples()) {
        let now = Instant::now();
        let mut machine = TransitStateMachine::new(Duration::from_secs(10), now);
        let mut state = TransitState::Idle;
        let mut previous: Option<u8> = None;

        for byte in raw {
            let status = byte & 0x03;
            let outcome = machine.on_status(byte, now);

            if previous == Some(status) {
                prop_assert!(outcome.is_noop());
            } else {
                let (next, expected) = table(state, status);
                prop_assert_eq!(observed(outcome.event), expected);
                state = next;
            }
            previous = Some(status);

            prop_assert_eq!(machine.state(), state);
            prop_assert_eq!(machine.direction(), state.direction());
        }
    }

    #[test]
    fn prop_repeats_never_fire_twice(raw in samples(), repeats in 1usize..5) {
        let now = Instant::now();
        let mut machine = TransitStateMachine::new(Duration::from_secs(10), now);

        for byte in raw {
            machine.on_status(byte, now);
            for _ in 0..repeats {
                prop_assert!(machine.on_status(byte, now).is_noop());
            }
        }
    }

    #[test]
    fn prop_every_transit_starts_before_it_ends(raw in samples()) {
        let now = Instant::now();
        let mut machine = TransitStateMachine::new(Duration::from_secs(10), now);
        let mut open: Option<Direction> = None;

        for byte in raw {
            match machine.on_status(byte, now).event {
                Some(TransitEvent::Started(d)) => {
                    prop_assert_eq!(open, None);
                    open = Some(d);
                }
                Some(TransitEvent::Completed(d)) | Some(TransitEvent::Aborted { direction: d, .. }) => {
                    prop_assert_eq!(open, Some(d));
                    open = None;
                }
                None => {}
            }
        }
    }

    #[test]
    fn prop_watchdog_always_returns_to_idle(raw in samples(), stall_ms in 10_001u64..60_000) {
        let t0 = Instant::now();
        let mut machine = TransitStateMachine::new(Duration::from_secs(10), t0);
        for byte in raw {
            machine.on_status(byte, t0);
        }

        let was_idle = machine.is_idle();
        let fired = machine.check_watchdog(t0 + Duration::from_millis(stall_ms));
        prop_assert_eq!(fired.is_some(), !was_idle);
        prop_assert!(machine.is_idle());
        prop_assert_eq!(machine.direction(), Direction::None);
    }
}
