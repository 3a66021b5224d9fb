// PI controller with separate position and velocity accumulators
//
// The two modes accumulate differently and are kept that way:
// - Position: output = Kp*e + Ki*I, recomputed every tick.
// - Velocity: output += Kp*e + Ki*I, so the proportional term is itself
//   integrated tick over tick.
// Neither integral is bounded (no anti-windup).

use crate::config::{KI, KP, RESOLUTION};

use super::ControlMode;

/// Raw encoder counts to wheel-shaft degrees
pub fn delta_degrees(raw_delta: u16, gear_ratio: f32) -> f32 {
    f32::from(raw_delta) * 360.0 / f32::from(RESOLUTION) / gear_ratio
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PiGains {
    pub kp: f32,
    pub ki: f32,
}

impl Default for PiGains {
    fn default() -> Self {
        Self { kp: KP, ki: KI }
    }
}

/// What one controller step produced
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PiStep {
    pub error: f32,
    pub integral: f32,
    /// Unclamped drive command; the DAC codec saturates it
    pub output: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Accumulator {
    integral: f32,
    output: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PiController {
    gains: PiGains,
    position: Accumulator,
    velocity: Accumulator,
}

impl PiController {
    pub fn new(gains: PiGains) -> Self {
        Self {
            gains,
            position: Accumulator::default(),
            velocity: Accumulator::default(),
        }
    }

    pub fn gains(&self) -> PiGains {
        self.gains
    }

    /// Integral accumulated so far in `mode`
    pub fn integral(&self, mode: ControlMode) -> f32 {
        match mode {
            ControlMode::Position => self.position.integral,
            ControlMode::Velocity => self.velocity.integral,
        }
    }

    pub fn reset(&mut self) {
        self.position = Accumulator::default();
        self.velocity = Accumulator::default();
    }

    /// Run one step against `feedback`: accumulated degrees in position mode,
    /// degrees per second in velocity mode
    pub fn step(&mut self, mode: ControlMode, target: f32, feedback: f32, dt: f32) -> PiStep {
        let PiGains { kp, ki } = self.gains;
        let error = target - feedback;

        let acc = match mode {
            ControlMode::Position => &mut self.position,
            ControlMode::Velocity => &mut self.velocity,
        };
        acc.integral += error * dt;

        let correction = kp * error + ki * acc.integral;
        acc.output = match mode {
            ControlMode::Position => correction,
            // Intentional second integration, see module docs
            ControlMode::Velocity => acc.output + correction,
        };

        PiStep {
            error,
            integral: acc.integral,
            output: acc.output,
        }
    }
}

impl Default for PiController {
    fn default() -> Self {
        Self::new(PiGains::default())
    }
}
