// Board wiring, bus timing and controller tuning
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ControlError, Result};
use crate::hw::{check_pin, BusChannel, SpiSettings};

// Discrete outputs (BCM numbering)
pub const PIN_BRAKE_LEFT: u8 = 5;
pub const PIN_BRAKE_RIGHT: u8 = 6;
pub const PIN_DIRECTION_LEFT: u8 = 13;
pub const PIN_DIRECTION_RIGHT: u8 = 19;

// SPI clocks
pub const DAC_CLOCK_HZ: u32 = 1_000_000;
pub const ENCODER_CLOCK_HZ: u32 = 10_000;
pub const SPI_MODE: u8 = 0;
pub const SPI_BITS_PER_WORD: u8 = 8;
pub const SPI_DELAY_US: u16 = 0;

/// Encoder counts per revolution (fixed by the sensor)
pub const RESOLUTION: u16 = 4095;

/// Motor shaft to wheel shaft reduction
pub const GEAR_RATIO: f32 = 10.0;

// PI gains
pub const KP: f32 = 3.5;
pub const KI: f32 = 0.5;

/// Counts of reverse motion still read as noise rather than a rollover
pub const WRAP_TOLERANCE: u16 = 2;

/// Control loop sample period
pub const SAMPLE_PERIOD: Duration = Duration::from_millis(1);

/// Consecutive failed encoder reads before the brake is latched
pub const STALE_TICK_LIMIT: u32 = 10;

// Demo run
pub const DEMO_TARGET_DEGREES: f32 = 360.0;
pub const DEMO_TICKS: u32 = 2000;

/// Drive left on the DAC after an open-loop monitor run
pub const MONITOR_IDLE_VALUE: i32 = 0x10;

/// Simulated encoder counts per read for each DAC unit of drive
pub const SIM_COUNTS_PER_DRIVE_UNIT: f32 = 0.5;

/// Pin numbers for the four discrete outputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinMap {
    pub brake_left: u8,
    pub brake_right: u8,
    pub direction_left: u8,
    pub direction_right: u8,
}

impl Default for PinMap {
    fn default() -> Self {
        Self {
            brake_left: PIN_BRAKE_LEFT,
            brake_right: PIN_BRAKE_RIGHT,
            direction_left: PIN_DIRECTION_LEFT,
            direction_right: PIN_DIRECTION_RIGHT,
        }
    }
}

impl PinMap {
    pub fn all(&self) -> [u8; 4] {
        [
            self.brake_left,
            self.brake_right,
            self.direction_left,
            self.direction_right,
        ]
    }

    /// Every pin on the header and no pin bound twice
    pub fn validate(&self) -> Result<()> {
        let pins = self.all();
        for (i, pin) in pins.iter().enumerate() {
            check_pin(*pin)?;
            if pins[..i].contains(pin) {
                return Err(ControlError::InvalidArgument(format!(
                    "GPIO {} bound to more than one output",
                    pin
                )));
            }
        }
        Ok(())
    }
}

/// Tunables for one control session, loadable from JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoardConfig {
    pub kp: f32,
    pub ki: f32,
    pub gear_ratio: f32,
    pub wrap_tolerance: u16,
    /// Sample period in seconds, used both as the PI `dt` and the tick cadence
    pub dt: f32,
    /// `None` disables the staleness guard
    pub stale_tick_limit: Option<u32>,
    pub pins: PinMap,
    pub dac_bus: SpiSettings,
    pub encoder_bus: SpiSettings,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            kp: KP,
            ki: KI,
            gear_ratio: GEAR_RATIO,
            wrap_tolerance: WRAP_TOLERANCE,
            dt: SAMPLE_PERIOD.as_secs_f32(),
            stale_tick_limit: Some(STALE_TICK_LIMIT),
            pins: PinMap::default(),
            dac_bus: SpiSettings::with_clock(DAC_CLOCK_HZ),
            encoder_bus: SpiSettings::with_clock(ENCODER_CLOCK_HZ),
        }
    }
}

impl BoardConfig {
    /// Read a JSON config file; missing fields fall back to the board defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the control loop cannot run with
    pub fn validate(&self) -> Result<()> {
        positive("dt", self.dt)?;
        positive("gear_ratio", self.gear_ratio)?;
        for (name, gain) in [("kp", self.kp), ("ki", self.ki)] {
            if !gain.is_finite() {
                return Err(ControlError::InvalidArgument(format!(
                    "{} must be finite, got {}",
                    name, gain
                )));
            }
        }
        if self.stale_tick_limit == Some(0) {
            return Err(ControlError::InvalidArgument(
                "stale_tick_limit must be at least 1 (null disables it)".to_string(),
            ));
        }
        self.pins.validate()?;
        self.dac_bus.validate()?;
        self.encoder_bus.validate()
    }

    pub fn bus_settings(&self, channel: BusChannel) -> SpiSettings {
        match channel {
            BusChannel::Dac => self.dac_bus,
            BusChannel::EncoderLeft | BusChannel::EncoderRight => self.encoder_bus,
        }
    }

    pub fn sample_period(&self) -> Result<Duration> {
        positive("dt", self.dt)?;
        Duration::try_from_secs_f32(self.dt)
            .ok()
            .filter(|period| !period.is_zero())
            .ok_or_else(|| {
                ControlError::InvalidArgument(format!("dt {} is not a usable period", self.dt))
            })
    }
}

fn positive(name: &str, value: f32) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ControlError::InvalidArgument(format!(
            "{} must be finite and positive, got {}",
            name, value
        )))
    }
}
