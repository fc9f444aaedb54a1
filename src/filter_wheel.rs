//! Colour filter wheel control.

use std::{thread::sleep, time::Duration};

use log::{info, warn};

use crate::device::{CameraDevice, QhyError};

/// Highest slot addressable with a single-character order.
pub const MAX_SLOT: u8 = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterWheelOptions {
    /// Wait between status polls while the wheel is moving.
    pub poll_interval: Duration,
    /// Polls before a move is declared failed.
    pub max_polls: u32,
}

impl Default for FilterWheelOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            max_polls: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WheelOutcome {
    /// No wheel is attached.
    Absent,
    /// The wheel already sat at the requested slot.
    AlreadyInPosition,
    /// The wheel reported the requested slot after `polls` status reads.
    Arrived { polls: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WheelError {
    #[error("filter wheel slot {0} is out of range (0..=9)")]
    InvalidSlot(u8),
    #[error("could not send move order: {0}")]
    Order(QhyError),
    #[error("filter wheel did not reach slot {slot} after {polls} polls (last seen at {last:?})")]
    Timeout {
        slot: u8,
        polls: u32,
        last: Option<char>,
    },
}

/// Move the wheel to `slot` and wait for it to report arrival.
///
/// Every slot, 0 included, is confirmed by polling the reported position. A
/// failed status read before the move is logged and the order is sent anyway.
/// A failed status read during the move counts against the poll budget.
pub fn move_filter_wheel<D: CameraDevice>(
    dev: &mut D,
    slot: u8,
    opts: &FilterWheelOptions,
) -> Result<WheelOutcome, WheelError> {
    if slot > MAX_SLOT {
        return Err(WheelError::InvalidSlot(slot));
    }
    if !dev.cfw_plugged() {
        info!("No filter wheel detected");
        return Ok(WheelOutcome::Absent);
    }

    let order = b'0' + slot;
    match dev.cfw_status() {
        Ok(current) => {
            info!(
                "Filter wheel is plugged in and is at position {}",
                current as char
            );
            if current == order {
                return Ok(WheelOutcome::AlreadyInPosition);
            }
        }
        Err(e) => warn!("Could not get filter wheel status: {e}"),
    }

    dev.cfw_move(order).map_err(WheelError::Order)?;
    info!("Filter wheel is moving to position {}", order as char);

    let mut last = None;
    for poll in 1..=opts.max_polls {
        sleep(opts.poll_interval);
        match dev.cfw_status() {
            Ok(pos) if pos == order => {
                info!("Filter wheel has been moved to position {}", order as char);
                return Ok(WheelOutcome::Arrived { polls: poll });
            }
            Ok(pos) => {
                last = Some(pos as char);
                info!("Filter wheel is still moving ({})", pos as char);
            }
            Err(e) => warn!("Could not get filter wheel status: {e}"),
        }
    }
    Err(WheelError::Timeout {
        slot,
        polls: opts.max_polls,
        last,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::SimulatedCamera;

    const FAST: FilterWheelOptions = FilterWheelOptions {
        poll_interval: Duration::ZERO,
        max_polls: 10,
    };

    #[test]
    fn absent_wheel_is_not_an_error() {
        let mut cam = SimulatedCamera::new("sim", 8, 8);
        assert_eq!(
            move_filter_wheel(&mut cam, 2, &FAST),
            Ok(WheelOutcome::Absent)
        );
    }

    #[test]
    fn no_move_when_in_position() {
        let mut cam = SimulatedCamera::new("sim", 8, 8).with_filter_wheel(7, 2, 3);
        assert_eq!(
            move_filter_wheel(&mut cam, 2, &FAST),
            Ok(WheelOutcome::AlreadyInPosition)
        );
    }

    #[test]
    fn polls_until_every_slot_arrives() {
        for slot in 0..7u8 {
            let start = (slot + 3) % 7;
            let mut cam = SimulatedCamera::new("sim", 8, 8).with_filter_wheel(7, start, 4);
            let out = move_filter_wheel(&mut cam, slot, &FAST).unwrap();
            assert_eq!(out, WheelOutcome::Arrived { polls: 5 }, "slot {slot}");
            assert_eq!(cam.wheel_position(), Some(slot));
        }
    }

    #[test]
    fn stuck_wheel_times_out() {
        let mut cam = SimulatedCamera::new("sim", 8, 8)
            .with_filter_wheel(7, 4, 0)
            .with_stuck_wheel();
        let err = move_filter_wheel(&mut cam, 0, &FAST).unwrap_err();
        assert_eq!(
            err,
            WheelError::Timeout {
                slot: 0,
                polls: 10,
                last: Some('4')
            }
        );
    }

    #[test]
    fn moves_when_first_status_read_fails() {
        let mut cam = SimulatedCamera::new("sim", 8, 8)
            .with_filter_wheel(7, 1, 2)
            .with_failing_wheel_status(1);
        let out = move_filter_wheel(&mut cam, 5, &FAST).unwrap();
        assert_eq!(out, WheelOutcome::Arrived { polls: 3 });
        assert_eq!(cam.wheel_position(), Some(5));
    }

    #[test]
    fn rejects_unaddressable_slot() {
        let mut cam = SimulatedCamera::new("sim", 8, 8).with_filter_wheel(7, 0, 0);
        assert_eq!(
            move_filter_wheel(&mut cam, 10, &FAST),
            Err(WheelError::InvalidSlot(10))
        );
        assert!(matches!(
            move_filter_wheel(&mut cam, 8, &FAST),
            Err(WheelError::Order(_))
        ));
    }
}
