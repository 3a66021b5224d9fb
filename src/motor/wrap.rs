// Encoder rollover handling
//
// The encoder reports an absolute angle modulo RESOLUTION. Moving forward the
// count falls, moving backward it rises. A jump against the commanded
// direction larger than `tolerance` is read as the count rolling over the
// 0/RESOLUTION boundary; smaller jumps are read noise.

use crate::config::RESOLUTION;

use super::MotionDirection;

/// Result of one tracker step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WrapStep {
    /// Unsigned motion this tick, in encoder counts
    pub delta: u16,
    /// Value to store as `previous` for the next tick, in [0, RESOLUTION - 1]
    pub corrected_previous: u16,
    pub wrapped: bool,
}

/// Pure rollover arithmetic on two consecutive raw angles
pub fn advance(
    previous: u16,
    current: u16,
    direction: MotionDirection,
    tolerance: u16,
) -> WrapStep {
    let (mut previous, mut current) = (u32::from(previous), u32::from(current));
    let (resolution, tolerance) = (u32::from(RESOLUTION), u32::from(tolerance));

    let wrapped = match direction {
        MotionDirection::Backward if previous > current + tolerance => {
            current += resolution;
            true
        }
        MotionDirection::Forward if current > previous + tolerance => {
            previous += resolution;
            true
        }
        _ => false,
    };

    let delta = current.abs_diff(previous);

    if current >= resolution {
        current -= resolution;
    }

    WrapStep {
        delta: delta as u16,
        corrected_previous: (current % resolution) as u16,
        wrapped,
    }
}

/// Holds the previous sample between ticks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WrapTracker {
    previous: u16,
    tolerance: u16,
}

impl WrapTracker {
    pub fn new(seed: u16, tolerance: u16) -> Self {
        Self {
            previous: seed % RESOLUTION,
            tolerance,
        }
    }

    pub fn previous(&self) -> u16 {
        self.previous
    }

    pub fn tolerance(&self) -> u16 {
        self.tolerance
    }

    /// Fold `current` into the tracker, returning this tick's motion
    pub fn advance(&mut self, current: u16, direction: MotionDirection) -> WrapStep {
        let step = advance(self.previous, current, direction, self.tolerance);
        self.previous = step.corrected_previous;
        step
    }
}
