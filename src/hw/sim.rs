// Simulated actuator board
//
// Stands in for the real GPIO and SPI devices in tests and `--simulate` runs.
// An encoder either advances by a fixed signed number of counts per read, or
// follows a plant: counts per read proportional to the last DAC value for
// its wheel, signed by the direction line and stopped by the brake. DAC
// frames and pin writes are recorded for inspection.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::trace;

use super::{check_pin, BusChannel, Frame, GpioPort, SpiSettings, SpiTransport};
use crate::config::{PinMap, RESOLUTION};
use crate::error::{ControlError, Link, Result};
use crate::motor::dac::{self, DacAddress, DacCommand};
use crate::motor::{EncoderSample, EncoderStatus, Wheel};

#[derive(Debug, Clone, Copy)]
struct SimEncoder {
    angle: u16,
    /// Counts per read; negative counts down (forward travel)
    step: i32,
    /// Encoder counts per read for each DAC unit of drive; overrides `step`
    counts_per_unit: Option<f32>,
    flags: u8,
    fail_reads: u32,
}

impl Default for SimEncoder {
    fn default() -> Self {
        Self {
            angle: 0,
            step: 0,
            counts_per_unit: None,
            flags: EncoderStatus::OCF,
            fail_reads: 0,
        }
    }
}

#[derive(Debug, Default)]
struct BoardModel {
    outputs: HashSet<u8>,
    levels: HashMap<u8, bool>,
    writes: HashMap<u8, u32>,
    fail_gpio: bool,
    gpio_released: bool,

    configured: HashMap<BusChannel, SpiSettings>,
    encoders: [SimEncoder; 2],
    drive: [u16; 2],
    dac_frames: Vec<Frame>,
    fail_dac: u32,
    bus_released: bool,
}

impl BoardModel {
    fn encoder(&mut self, wheel: Wheel) -> &mut SimEncoder {
        &mut self.encoders[wheel.index()]
    }

    /// Latch the output value of a decoded DAC command
    fn apply_dac(&mut self, frame: Frame) {
        let Ok((address, command, value)) = dac::decode(frame) else {
            return;
        };
        let value = match command {
            DacCommand::WriteUpdate | DacCommand::WriteUpdateAll => value,
            DacCommand::PowerDown | DacCommand::PowerDownAll => 0,
            _ => return,
        };
        match address {
            DacAddress::Left => self.drive[Wheel::Left.index()] = value,
            DacAddress::Right => self.drive[Wheel::Right.index()] = value,
            DacAddress::All => self.drive = [value; 2],
        }
    }

    /// Signed counts the encoder moves on this read
    fn encoder_step(&self, wheel: Wheel) -> i32 {
        let enc = &self.encoders[wheel.index()];
        let Some(gain) = enc.counts_per_unit else {
            return enc.step;
        };
        let pins = PinMap::default();
        // Brake is active-low
        if self.levels.get(&wheel.brake_pin(&pins)) == Some(&false) {
            return 0;
        }
        let counts = (f32::from(self.drive[wheel.index()]) * gain).round() as i32;
        // Forward travel counts down
        match self.levels.get(&wheel.direction_pin(&pins)) {
            Some(false) => counts,
            _ => -counts,
        }
    }
}

/// Shared model behind the simulated GPIO and SPI handles
#[derive(Debug, Clone, Default)]
pub struct SimBoard {
    model: Arc<Mutex<BoardModel>>,
}

impl SimBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start `wheel`'s encoder at `angle`, moving `step` counts per read
    pub fn with_encoder(self, wheel: Wheel, angle: u16, step: i32) -> Self {
        self.set_encoder(wheel, angle, step);
        self
    }

    fn lock(&self) -> MutexGuard<'_, BoardModel> {
        self.model.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn gpio(&self) -> SimGpio {
        SimGpio {
            model: Arc::clone(&self.model),
        }
    }

    pub fn bus(&self) -> SimBus {
        SimBus {
            model: Arc::clone(&self.model),
        }
    }

    pub fn set_encoder(&self, wheel: Wheel, angle: u16, step: i32) {
        let mut model = self.lock();
        let enc = model.encoder(wheel);
        enc.angle = angle % RESOLUTION;
        enc.step = step;
    }

    /// Start `wheel`'s encoder at `angle`, moving `counts_per_unit` counts per
    /// read for each unit of its DAC output
    pub fn with_plant(self, wheel: Wheel, angle: u16, counts_per_unit: f32) -> Self {
        {
            let mut model = self.lock();
            let enc = model.encoder(wheel);
            enc.angle = angle % RESOLUTION;
            enc.counts_per_unit = Some(counts_per_unit);
        }
        self
    }

    /// Status flags reported with every subsequent read (parity is added)
    pub fn set_encoder_flags(&self, wheel: Wheel, flags: u8) {
        self.lock().encoder(wheel).flags = flags;
    }

    pub fn encoder_angle(&self, wheel: Wheel) -> u16 {
        self.lock().encoder(wheel).angle
    }

    /// Make the next `count` reads of `wheel`'s encoder fail
    pub fn fail_encoder_reads(&self, wheel: Wheel, count: u32) {
        self.lock().encoder(wheel).fail_reads = count;
    }

    /// Make the next `count` DAC transfers fail
    pub fn fail_dac_writes(&self, count: u32) {
        self.lock().fail_dac = count;
    }

    /// Output value currently latched for `wheel`
    pub fn drive(&self, wheel: Wheel) -> u16 {
        self.lock().drive[wheel.index()]
    }

    pub fn fail_gpio_writes(&self, fail: bool) {
        self.lock().fail_gpio = fail;
    }

    pub fn pin_level(&self, pin: u8) -> Option<bool> {
        self.lock().levels.get(&pin).copied()
    }

    pub fn is_output(&self, pin: u8) -> bool {
        self.lock().outputs.contains(&pin)
    }

    /// Successful writes to `pin` so far
    pub fn pin_writes(&self, pin: u8) -> u32 {
        self.lock().writes.get(&pin).copied().unwrap_or(0)
    }

    pub fn dac_frames(&self) -> Vec<Frame> {
        self.lock().dac_frames.clone()
    }

    pub fn configured(&self, channel: BusChannel) -> Option<SpiSettings> {
        self.lock().configured.get(&channel).copied()
    }

    pub fn bus_released(&self) -> bool {
        self.lock().bus_released
    }

    pub fn gpio_released(&self) -> bool {
        self.lock().gpio_released
    }
}

#[derive(Debug, Clone)]
pub struct SimGpio {
    model: Arc<Mutex<BoardModel>>,
}

impl SimGpio {
    fn lock(&self) -> MutexGuard<'_, BoardModel> {
        self.model.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl GpioPort for SimGpio {
    fn configure_output(&mut self, pin: u8) -> Result<()> {
        check_pin(pin)?;
        let mut model = self.lock();
        if model.gpio_released {
            return Err(ControlError::Released);
        }
        model.outputs.insert(pin);
        Ok(())
    }

    fn write(&mut self, pin: u8, level: bool) -> Result<()> {
        check_pin(pin)?;
        let mut model = self.lock();
        if model.gpio_released {
            return Err(ControlError::Released);
        }
        if model.fail_gpio {
            return Err(ControlError::transport(Link::Gpio(pin), "simulated write failure"));
        }
        if !model.outputs.contains(&pin) {
            return Err(ControlError::transport(Link::Gpio(pin), "pin is not an output"));
        }
        model.levels.insert(pin, level);
        *model.writes.entry(pin).or_default() += 1;
        Ok(())
    }

    fn read(&mut self, pin: u8) -> Result<bool> {
        check_pin(pin)?;
        Ok(self.lock().levels.get(&pin).copied().unwrap_or(false))
    }

    fn release(&mut self) {
        self.lock().gpio_released = true;
    }
}

#[derive(Debug, Clone)]
pub struct SimBus {
    model: Arc<Mutex<BoardModel>>,
}

impl SimBus {
    fn lock(&self) -> MutexGuard<'_, BoardModel> {
        self.model.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl SpiTransport for SimBus {
    fn configure(&mut self, channel: BusChannel, settings: SpiSettings) -> Result<()> {
        settings.validate()?;
        self.lock().configured.insert(channel, settings);
        Ok(())
    }

    fn transfer(&mut self, channel: BusChannel, frame: Frame) -> Result<Frame> {
        let link = Link::Spi(channel);
        let mut model = self.lock();
        if model.bus_released {
            return Err(ControlError::transport(link, "device closed"));
        }
        if !model.configured.contains_key(&channel) {
            return Err(ControlError::transport(link, "channel not configured"));
        }

        let wheel = match channel {
            BusChannel::Dac => {
                if model.fail_dac > 0 {
                    model.fail_dac -= 1;
                    return Err(ControlError::transport(link, "simulated write failure"));
                }
                model.apply_dac(frame);
                model.dac_frames.push(frame);
                trace!("sim DAC frame {:02X?}", frame);
                return Ok([0; 3]);
            }
            BusChannel::EncoderLeft => Wheel::Left,
            BusChannel::EncoderRight => Wheel::Right,
        };

        let step = model.encoder_step(wheel);
        let enc = model.encoder(wheel);
        if enc.fail_reads > 0 {
            enc.fail_reads -= 1;
            return Err(ControlError::transport(link, "simulated read failure"));
        }
        let reply = EncoderSample::with_even_parity(enc.angle, enc.flags).encode();
        let next = (i32::from(enc.angle) + step).rem_euclid(i32::from(RESOLUTION));
        enc.angle = next as u16;
        Ok(reply)
    }

    fn release(&mut self) {
        self.lock().bus_released = true;
    }
}
