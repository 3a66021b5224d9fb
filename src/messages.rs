// Telemetry records emitted by the control loop

use serde::{Deserialize, Serialize};

use crate::motor::{ControlMode, Wheel};

/// Result of one closed-loop tick
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickReport {
    pub wheel: Wheel,
    pub mode: ControlMode,
    pub tick: u64,
    /// Raw angle read this tick
    pub angle: u16,
    /// Encoder counts moved since the previous tick
    pub delta: u16,
    pub wrapped: bool,
    /// Degrees (position) or degrees per second (velocity)
    pub feedback: f32,
    pub error: f32,
    pub integral: f32,
    /// Controller output before DAC saturation
    pub output: f32,
    /// Value actually written to the DAC
    pub dac_value: u16,
    /// Direction line was driven opposite to the commanded direction
    pub reversed: bool,
}

/// Open-loop odometry sample
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OdometryReport {
    pub wheel: Wheel,
    pub angle: u16,
    pub delta: u16,
    pub position_degrees: f32,
    /// Degrees per second over the last tick
    pub instant_speed: f32,
    /// Degrees per second since the monitor started
    pub average_speed: f32,
}

/// Per-wheel health
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ControllerHealth {
    Ok,
    /// Recent encoder reads failed; `previous_angle` is out of date
    EncoderStale,
    /// Brake latched after too many consecutive failures
    Halted,
}
