// Dual-channel 10-bit DAC serial protocol
//
// 24-bit frame, MSB first:
// [C3 C2 C1 C0 A3 A2 A1 A0 | D9..D2 | D1 D0 x x x x x x]

use tracing::debug;

use crate::error::{ControlError, Result};
use crate::hw::{BusChannel, Frame, SpiTransport};

pub const DAC_VALUE_MIN: i32 = 0;
pub const DAC_VALUE_MAX: i32 = 0x3FF;

const DATA_SHIFT: u32 = 6;

/// Command nibble
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum DacCommand {
    /// Write to input register n
    WriteInput = 0x0,
    /// Update (power up) DAC register n
    Update = 0x1,
    /// Write to input register n, update (power up) all
    WriteUpdateAll = 0x2,
    /// Write to and update DAC register n
    WriteUpdate = 0x3,
    PowerDown = 0x4,
    /// Power down the chip, both DACs and the reference
    PowerDownAll = 0x5,
    InternalReference = 0x6,
    ExternalReference = 0x7,
    NoOp = 0xF,
}

impl TryFrom<u8> for DacCommand {
    type Error = ControlError;

    fn try_from(raw: u8) -> Result<Self> {
        Ok(match raw {
            0x0 => DacCommand::WriteInput,
            0x1 => DacCommand::Update,
            0x2 => DacCommand::WriteUpdateAll,
            0x3 => DacCommand::WriteUpdate,
            0x4 => DacCommand::PowerDown,
            0x5 => DacCommand::PowerDownAll,
            0x6 => DacCommand::InternalReference,
            0x7 => DacCommand::ExternalReference,
            0xF => DacCommand::NoOp,
            other => {
                return Err(ControlError::InvalidArgument(format!(
                    "DAC command 0x{:X}",
                    other
                )))
            }
        })
    }
}

/// Address nibble
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum DacAddress {
    /// DAC A
    Left = 0x0,
    /// DAC B
    Right = 0x1,
    All = 0xF,
}

impl TryFrom<u8> for DacAddress {
    type Error = ControlError;

    fn try_from(raw: u8) -> Result<Self> {
        match raw {
            0x0 => Ok(DacAddress::Left),
            0x1 => Ok(DacAddress::Right),
            0xF => Ok(DacAddress::All),
            other => Err(ControlError::InvalidArgument(format!(
                "DAC address 0x{:X}",
                other
            ))),
        }
    }
}

/// Saturate a drive value into the 10-bit data range
pub fn clamp_value(value: i32) -> u16 {
    value.clamp(DAC_VALUE_MIN, DAC_VALUE_MAX) as u16
}

/// Build the 3-byte frame. Out-of-range values saturate silently.
pub fn encode(address: DacAddress, command: DacCommand, value: i32) -> Frame {
    let data = clamp_value(value) << DATA_SHIFT;
    [
        (command as u8) << 4 | address as u8,
        (data >> 8) as u8,
        data as u8,
    ]
}

/// Split a frame back into its fields (for logs and the simulator)
pub fn decode(frame: Frame) -> Result<(DacAddress, DacCommand, u16)> {
    let address = DacAddress::try_from(frame[0] & 0x0F)?;
    let command = DacCommand::try_from(frame[0] >> 4)?;
    let data = u16::from_be_bytes([frame[1], frame[2]]) >> DATA_SHIFT;
    Ok((address, command, data))
}

/// Encode and send one command on the DAC channel
pub fn write<B: SpiTransport + ?Sized>(
    bus: &mut B,
    address: DacAddress,
    command: DacCommand,
    value: i32,
) -> Result<()> {
    let frame = encode(address, command, value);
    debug!(
        "DAC {:?} {:?}: value={} frame=0x{:06X}",
        address,
        command,
        clamp_value(value),
        u32::from(frame[0]) << 16 | u32::from(frame[1]) << 8 | u32::from(frame[2])
    );
    bus.transfer(BusChannel::Dac, frame)?;
    Ok(())
}
