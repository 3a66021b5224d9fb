// Hardware collaborators for the actuator board
//
// Provides:
// - GpioPort / SpiTransport traits the control loop is written against
// - SharedBus for serializing one physical SPI bus across threads
// - A simulated board for tests and dry runs
// - The Raspberry Pi backend (feature `rpi`)

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::config::{SPI_BITS_PER_WORD, SPI_DELAY_US, SPI_MODE};
use crate::error::{ControlError, Link, Result};

#[cfg(feature = "rpi")]
pub mod rpi;
pub mod sim;

/// Every frame on this board is 24 bits, MSB first
pub type Frame = [u8; 3];

/// Highest BCM GPIO number broken out on the 40-pin header
pub const MAX_BCM_PIN: u8 = 27;

/// Logical SPI channels, one chip-select each
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BusChannel {
    Dac,
    EncoderLeft,
    EncoderRight,
}

impl BusChannel {
    pub const ALL: [BusChannel; 3] = [
        BusChannel::Dac,
        BusChannel::EncoderLeft,
        BusChannel::EncoderRight,
    ];

    /// Chip-select index (spidev0.N)
    pub fn index(self) -> u8 {
        match self {
            BusChannel::Dac => 0,
            BusChannel::EncoderLeft => 1,
            BusChannel::EncoderRight => 2,
        }
    }
}

/// Per-channel SPI parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpiSettings {
    pub mode: u8,
    pub bits_per_word: u8,
    pub clock_hz: u32,
    pub delay_us: u16,
}

impl SpiSettings {
    pub fn with_clock(clock_hz: u32) -> Self {
        Self {
            mode: SPI_MODE,
            bits_per_word: SPI_BITS_PER_WORD,
            clock_hz,
            delay_us: SPI_DELAY_US,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.mode > 3 {
            return Err(ControlError::InvalidArgument(format!(
                "SPI mode {} out of range 0..=3",
                self.mode
            )));
        }
        if self.clock_hz == 0 || self.bits_per_word == 0 {
            return Err(ControlError::InvalidArgument(
                "SPI clock and word size must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Reject BCM numbers that are not on the header
pub fn check_pin(pin: u8) -> Result<()> {
    if pin > MAX_BCM_PIN {
        return Err(ControlError::InvalidArgument(format!(
            "GPIO {} out of range 0..={}",
            pin, MAX_BCM_PIN
        )));
    }
    Ok(())
}

/// Discrete digital I/O
pub trait GpioPort {
    fn configure_output(&mut self, pin: u8) -> Result<()>;
    fn write(&mut self, pin: u8, level: bool) -> Result<()>;
    fn read(&mut self, pin: u8) -> Result<bool>;

    /// Give the pins back to the OS. Must be safe to call more than once.
    fn release(&mut self) {}
}

/// Full-duplex, 3-byte SPI exchange on a selected channel
pub trait SpiTransport {
    fn configure(&mut self, channel: BusChannel, settings: SpiSettings) -> Result<()>;

    /// Clock `frame` out and return what was clocked in during the same transfer
    fn transfer(&mut self, channel: BusChannel, frame: Frame) -> Result<Frame>;

    /// Close the device handles. Must be safe to call more than once.
    fn release(&mut self) {}
}

impl<T: GpioPort + ?Sized> GpioPort for Box<T> {
    fn configure_output(&mut self, pin: u8) -> Result<()> {
        (**self).configure_output(pin)
    }

    fn write(&mut self, pin: u8, level: bool) -> Result<()> {
        (**self).write(pin, level)
    }

    fn read(&mut self, pin: u8) -> Result<bool> {
        (**self).read(pin)
    }

    fn release(&mut self) {
        (**self).release()
    }
}

impl<T: SpiTransport + ?Sized> SpiTransport for Box<T> {
    fn configure(&mut self, channel: BusChannel, settings: SpiSettings) -> Result<()> {
        (**self).configure(channel, settings)
    }

    fn transfer(&mut self, channel: BusChannel, frame: Frame) -> Result<Frame> {
        (**self).transfer(channel, frame)
    }

    fn release(&mut self) {
        (**self).release()
    }
}

/// One physical bus shared between control loops on different threads.
///
/// The lock is held for the whole of each transfer (select, clock, deselect),
/// so two transfers can never interleave on the wire. The device is closed
/// once every handle has been released or dropped.
pub struct SharedBus<T: SpiTransport> {
    inner: Arc<SharedInner<T>>,
    released: bool,
}

struct SharedInner<T> {
    bus: Mutex<T>,
    /// Handles not yet released
    live: AtomicUsize,
}

impl<T: SpiTransport> Clone for SharedBus<T> {
    fn clone(&self) -> Self {
        self.inner.live.fetch_add(1, Ordering::AcqRel);
        Self {
            inner: Arc::clone(&self.inner),
            released: false,
        }
    }
}

impl<T: SpiTransport> SharedBus<T> {
    pub fn new(bus: T) -> Self {
        Self {
            inner: Arc::new(SharedInner {
                bus: Mutex::new(bus),
                live: AtomicUsize::new(1),
            }),
            released: false,
        }
    }

    fn with_bus<R>(&self, channel: BusChannel, f: impl FnOnce(&mut T) -> Result<R>) -> Result<R> {
        let mut bus = self
            .inner
            .bus
            .lock()
            .map_err(|_| ControlError::transport(Link::Spi(channel), "bus lock poisoned"))?;
        f(&mut bus)
    }
}

impl<T: SpiTransport> SpiTransport for SharedBus<T> {
    fn configure(&mut self, channel: BusChannel, settings: SpiSettings) -> Result<()> {
        self.with_bus(channel, |bus| bus.configure(channel, settings))
    }

    fn transfer(&mut self, channel: BusChannel, frame: Frame) -> Result<Frame> {
        self.with_bus(channel, |bus| bus.transfer(channel, frame))
    }

    // Only the last live handle closes the device
    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if self.inner.live.fetch_sub(1, Ordering::AcqRel) == 1 {
            let mut bus = self.inner.bus.lock().unwrap_or_else(|e| e.into_inner());
            bus.release();
        }
    }
}

impl<T: SpiTransport> Drop for SharedBus<T> {
    fn drop(&mut self) {
        self.release();
    }
}
