// Absolute magnetic rotary encoder frame codec
//
// A read clocks out 24 bits, MSB first:
// [dummy, A11..A0, OCF, COF, LIN, MagINC, MagDEC, PAR, x x x x x]
// The leading bit and the trailing five are don't-care.

use tracing::{debug, warn};

use crate::config::RESOLUTION;
use crate::error::Result;
use crate::hw::{Frame, SpiTransport};

use super::Wheel;

const PAYLOAD_SHIFT: u32 = 5;
const PAYLOAD_MASK: u32 = 0x0003_FFFF; // 12 angle + 6 status bits
const STATUS_BITS: u32 = 6;
const STATUS_MASK: u32 = 0x3F;

/// The six status bits trailing the angle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EncoderStatus(u8);

impl EncoderStatus {
    pub const OCF: u8 = 0x20;
    pub const COF: u8 = 0x10;
    pub const LIN: u8 = 0x08;
    pub const MAG_INC: u8 = 0x04;
    pub const MAG_DEC: u8 = 0x02;
    pub const PARITY: u8 = 0x01;

    pub fn from_bits(bits: u8) -> Self {
        Self(bits & STATUS_MASK as u8)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    /// Offset compensation finished
    pub fn offset_compensated(self) -> bool {
        self.0 & Self::OCF != 0
    }

    /// CORDIC overflow; the angle is invalid
    pub fn cordic_overflow(self) -> bool {
        self.0 & Self::COF != 0
    }

    /// Linearity alarm; the angle may be invalid
    pub fn linearity_alarm(self) -> bool {
        self.0 & Self::LIN != 0
    }

    pub fn magnet_increasing(self) -> bool {
        self.0 & Self::MAG_INC != 0
    }

    pub fn magnet_decreasing(self) -> bool {
        self.0 & Self::MAG_DEC != 0
    }

    pub fn parity_bit(self) -> bool {
        self.0 & Self::PARITY != 0
    }
}

/// One decoded encoder read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderSample {
    /// Always in [0, RESOLUTION - 1]
    pub angle: u16,
    pub status: EncoderStatus,
    /// The raw 12-bit angle field, before folding into the resolution range
    raw_angle: u16,
}

impl EncoderSample {
    pub fn new(angle: u16, status: EncoderStatus) -> Self {
        let raw_angle = angle & 0x0FFF;
        Self {
            angle: raw_angle % RESOLUTION,
            status,
            raw_angle,
        }
    }

    /// Decode a 24-bit frame. Alarm bits are reported, never treated as errors.
    pub fn decode(frame: Frame) -> Self {
        let word = u32::from(frame[0]) << 16 | u32::from(frame[1]) << 8 | u32::from(frame[2]);
        let payload = (word >> PAYLOAD_SHIFT) & PAYLOAD_MASK;
        let raw_angle = (payload >> STATUS_BITS) as u16;
        let status = EncoderStatus::from_bits((payload & STATUS_MASK) as u8);
        Self::new(raw_angle, status)
    }

    /// Inverse of [`decode`](Self::decode) for frames whose don't-care bits are zero
    pub fn encode(&self) -> Frame {
        let payload = u32::from(self.raw_angle) << STATUS_BITS | u32::from(self.status.bits());
        let word = (payload & PAYLOAD_MASK) << PAYLOAD_SHIFT;
        [(word >> 16) as u8, (word >> 8) as u8, word as u8]
    }

    /// Build a sample whose parity bit makes the 18-bit payload even
    pub fn with_even_parity(angle: u16, flags: u8) -> Self {
        let flags = flags & !EncoderStatus::PARITY & STATUS_MASK as u8;
        let ones = (angle & 0x0FFF).count_ones() + flags.count_ones();
        let parity = if ones % 2 == 1 { EncoderStatus::PARITY } else { 0 };
        Self::new(angle, EncoderStatus::from_bits(flags | parity))
    }

    /// Even parity over angle and status, parity bit included
    pub fn parity_ok(&self) -> bool {
        (self.raw_angle.count_ones() + self.status.bits().count_ones()) % 2 == 0
    }

    /// False when the sensor flags the angle as unusable
    pub fn data_valid(&self) -> bool {
        !self.status.cordic_overflow()
    }
}

/// Clock one frame out of the wheel's encoder and decode it
pub fn read<B: SpiTransport + ?Sized>(bus: &mut B, wheel: Wheel) -> Result<EncoderSample> {
    let frame = bus.transfer(wheel.encoder_channel(), [0; 3])?;
    let sample = EncoderSample::decode(frame);
    let s = sample.status;
    debug!(
        "{:?} encoder frame {:02X?}: angle={} OCF={} COF={} LIN={} MagINC={} MagDEC={} PAR={}",
        wheel,
        frame,
        sample.angle,
        s.offset_compensated() as u8,
        s.cordic_overflow() as u8,
        s.linearity_alarm() as u8,
        s.magnet_increasing() as u8,
        s.magnet_decreasing() as u8,
        s.parity_bit() as u8,
    );
    if !sample.data_valid() || s.linearity_alarm() {
        warn!("{:?} encoder alarm: status=0x{:02X}", wheel, s.bits());
    }
    Ok(sample)
}
