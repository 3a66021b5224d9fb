// Closed-loop control for the two-wheel actuator board
//
// Provides:
// - Encoder frame decoding and DAC frame encoding
// - Rollover-safe encoder deltas
// - Brake/direction outputs
// - PI control and the per-wheel control loop driver

pub mod dac;
pub mod direction;
mod driver;
pub mod encoder;
pub mod pi;
pub mod wrap;

use serde::{Deserialize, Serialize};

use crate::config::PinMap;
use crate::error::ControlError;
use crate::hw::BusChannel;

pub use dac::{DacAddress, DacCommand};
pub use direction::DirectionController;
pub use driver::{ControlLoopDriver, OdometryMonitor, WheelControlState};
pub use encoder::{EncoderSample, EncoderStatus};
pub use pi::{PiController, PiGains, PiStep};
pub use wrap::{WrapStep, WrapTracker};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Wheel {
    Left,
    Right,
}

impl Wheel {
    pub const BOTH: [Wheel; 2] = [Wheel::Left, Wheel::Right];

    pub fn encoder_channel(self) -> BusChannel {
        match self {
            Wheel::Left => BusChannel::EncoderLeft,
            Wheel::Right => BusChannel::EncoderRight,
        }
    }

    pub fn dac_address(self) -> DacAddress {
        match self {
            Wheel::Left => DacAddress::Left,
            Wheel::Right => DacAddress::Right,
        }
    }

    pub fn brake_pin(self, pins: &PinMap) -> u8 {
        match self {
            Wheel::Left => pins.brake_left,
            Wheel::Right => pins.brake_right,
        }
    }

    pub fn direction_pin(self, pins: &PinMap) -> u8 {
        match self {
            Wheel::Left => pins.direction_left,
            Wheel::Right => pins.direction_right,
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Wheel::Left => 0,
            Wheel::Right => 1,
        }
    }
}

impl TryFrom<u8> for Wheel {
    type Error = ControlError;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        match raw {
            0 => Ok(Wheel::Left),
            1 => Ok(Wheel::Right),
            other => Err(ControlError::InvalidArgument(format!(
                "wheel selector {} (expected 0=left, 1=right)",
                other
            ))),
        }
    }
}

/// Commanded direction of travel (never measured)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum MotionDirection {
    Forward,
    Backward,
}

impl MotionDirection {
    pub fn reversed(self) -> Self {
        match self {
            MotionDirection::Forward => MotionDirection::Backward,
            MotionDirection::Backward => MotionDirection::Forward,
        }
    }

    /// Level on the direction-select line
    pub fn level(self) -> bool {
        matches!(self, MotionDirection::Forward)
    }
}

/// Which quantity the loop regulates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ControlMode {
    /// Degrees travelled since the session started
    Position,
    /// Degrees per second
    Velocity,
}

impl TryFrom<u8> for ControlMode {
    type Error = ControlError;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        match raw {
            0 => Ok(ControlMode::Position),
            1 => Ok(ControlMode::Velocity),
            other => Err(ControlError::InvalidArgument(format!(
                "control mode selector {}",
                other
            ))),
        }
    }
}
