// Raspberry Pi backend: BCM GPIO and spidev0.N through rppal

use std::collections::HashMap;

use rppal::gpio::{Gpio, Level, OutputPin};
use rppal::spi::{Bus, Mode, Segment, SlaveSelect, Spi};
use tracing::{debug, info};

use super::{check_pin, BusChannel, Frame, GpioPort, SpiSettings, SpiTransport};
use crate::error::{ControlError, Link, Result};

pub struct RpiGpio {
    gpio: Gpio,
    outputs: HashMap<u8, OutputPin>,
}

impl RpiGpio {
    pub fn open() -> Result<Self> {
        let gpio = Gpio::new().map_err(|e| ControlError::setup("GPIO", e))?;
        Ok(Self {
            gpio,
            outputs: HashMap::new(),
        })
    }
}

impl GpioPort for RpiGpio {
    fn configure_output(&mut self, pin: u8) -> Result<()> {
        check_pin(pin)?;
        let output = self
            .gpio
            .get(pin)
            .map_err(|e| ControlError::setup(format!("GPIO {}", pin), e))?
            .into_output();
        self.outputs.insert(pin, output);
        debug!("GPIO {} configured as output", pin);
        Ok(())
    }

    fn write(&mut self, pin: u8, level: bool) -> Result<()> {
        check_pin(pin)?;
        let output = self
            .outputs
            .get_mut(&pin)
            .ok_or_else(|| ControlError::transport(Link::Gpio(pin), "pin is not an output"))?;
        output.write(if level { Level::High } else { Level::Low });
        Ok(())
    }

    fn read(&mut self, pin: u8) -> Result<bool> {
        check_pin(pin)?;
        if let Some(output) = self.outputs.get(&pin) {
            return Ok(output.is_set_high());
        }
        let input = self
            .gpio
            .get(pin)
            .map_err(|e| ControlError::transport(Link::Gpio(pin), e))?;
        Ok(input.read() == Level::High)
    }

    fn release(&mut self) {
        if !self.outputs.is_empty() {
            info!("Releasing {} GPIO outputs", self.outputs.len());
        }
        self.outputs.clear();
    }
}

struct Device {
    spi: Spi,
    settings: SpiSettings,
}

/// spidev0.0 (DAC), spidev0.1 and spidev0.2 (encoders)
#[derive(Default)]
pub struct RpiSpi {
    devices: HashMap<BusChannel, Device>,
}

impl RpiSpi {
    pub fn new() -> Self {
        Self::default()
    }
}

fn slave_select(channel: BusChannel) -> SlaveSelect {
    match channel {
        BusChannel::Dac => SlaveSelect::Ss0,
        BusChannel::EncoderLeft => SlaveSelect::Ss1,
        BusChannel::EncoderRight => SlaveSelect::Ss2,
    }
}

fn spi_mode(mode: u8) -> Result<Mode> {
    match mode {
        0 => Ok(Mode::Mode0),
        1 => Ok(Mode::Mode1),
        2 => Ok(Mode::Mode2),
        3 => Ok(Mode::Mode3),
        other => Err(ControlError::InvalidArgument(format!("SPI mode {}", other))),
    }
}

impl SpiTransport for RpiSpi {
    fn configure(&mut self, channel: BusChannel, settings: SpiSettings) -> Result<()> {
        settings.validate()?;
        let what = format!("spidev0.{}", channel.index());
        let spi = Spi::new(
            Bus::Spi0,
            slave_select(channel),
            settings.clock_hz,
            spi_mode(settings.mode)?,
        )
        .map_err(|e| ControlError::setup(what.clone(), e))?;
        spi.set_bits_per_word(settings.bits_per_word)
            .map_err(|e| ControlError::setup(what, e))?;
        self.devices.insert(channel, Device { spi, settings });
        Ok(())
    }

    fn transfer(&mut self, channel: BusChannel, frame: Frame) -> Result<Frame> {
        let link = Link::Spi(channel);
        let device = self
            .devices
            .get(&channel)
            .ok_or_else(|| ControlError::transport(link, "channel not configured"))?;

        let mut reply = [0u8; 3];
        let mut segment = Segment::new(&mut reply, &frame);
        segment.set_delay(device.settings.delay_us);
        device
            .spi
            .transfer_segments(&[segment])
            .map_err(|e| ControlError::transport(link, e))?;
        Ok(reply)
    }

    fn release(&mut self) {
        if !self.devices.is_empty() {
            info!("Closing {} SPI devices", self.devices.len());
        }
        self.devices.clear();
    }
}
