// Brake and direction-select outputs

use tracing::{debug, info};

use crate::config::PinMap;
use crate::error::Result;
use crate::hw::GpioPort;

use super::{MotionDirection, Wheel};

/// Brake lines are active low
const BRAKE_ENGAGED_LEVEL: bool = false;

/// Writes the discrete outputs for each wheel. Failures are returned as-is,
/// retrying is up to the caller.
#[derive(Debug, Clone, Copy)]
pub struct DirectionController {
    pins: PinMap,
}

impl DirectionController {
    pub fn new(pins: PinMap) -> Self {
        Self { pins }
    }

    pub fn pins(&self) -> &PinMap {
        &self.pins
    }

    /// Configure all four lines as outputs and drive them high
    /// (brakes released, both wheels forward)
    pub fn init<G: GpioPort + ?Sized>(&self, gpio: &mut G) -> Result<()> {
        for pin in self.pins.all() {
            gpio.configure_output(pin)?;
            gpio.write(pin, true)?;
        }
        info!("Brake/direction outputs configured: {:?}", self.pins);
        Ok(())
    }

    pub fn set_brake<G: GpioPort + ?Sized>(
        &self,
        gpio: &mut G,
        wheel: Wheel,
        engaged: bool,
    ) -> Result<()> {
        let level = if engaged {
            BRAKE_ENGAGED_LEVEL
        } else {
            !BRAKE_ENGAGED_LEVEL
        };
        gpio.write(wheel.brake_pin(&self.pins), level)?;
        debug!("Brake {:?} wheel {}", wheel, if engaged { "on" } else { "off" });
        Ok(())
    }

    pub fn set_direction<G: GpioPort + ?Sized>(
        &self,
        gpio: &mut G,
        wheel: Wheel,
        direction: MotionDirection,
    ) -> Result<()> {
        gpio.write(wheel.direction_pin(&self.pins), direction.level())?;
        debug!("Direction {:?} wheel {:?}", wheel, direction);
        Ok(())
    }
}
