// Error taxonomy shared by the hardware layer and the control loop

use std::fmt;

use crate::hw::BusChannel;
use crate::motor::Wheel;

/// Which physical line a transfer failed on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Link {
    Spi(BusChannel),
    Gpio(u8),
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Link::Spi(channel) => write!(f, "SPI channel {} ({:?})", channel.index(), channel),
            Link::Gpio(pin) => write!(f, "GPIO {}", pin),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("Setup of {what} failed: {reason}")]
    Setup { what: String, reason: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Transfer on {link} failed: {reason}")]
    Transport { link: Link, reason: String },

    #[error("{wheel:?} wheel halted after repeated encoder failures")]
    Halted { wheel: Wheel },

    #[error("Hardware handles already released")]
    Released,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(#[from] serde_json::Error),
}

impl ControlError {
    pub fn setup(what: impl Into<String>, reason: impl fmt::Display) -> Self {
        ControlError::Setup {
            what: what.into(),
            reason: reason.to_string(),
        }
    }

    pub fn transport(link: Link, reason: impl fmt::Display) -> Self {
        ControlError::Transport {
            link,
            reason: reason.to_string(),
        }
    }

    /// True for failures of a single transfer, which the caller may retry
    pub fn is_transport(&self) -> bool {
        matches!(self, ControlError::Transport { .. })
    }

    /// True when an encoder channel transfer failed
    pub fn is_encoder_read(&self) -> bool {
        matches!(
            self,
            ControlError::Transport {
                link: Link::Spi(BusChannel::EncoderLeft | BusChannel::EncoderRight),
                ..
            }
        )
    }
}

pub type Result<T> = std::result::Result<T, ControlError>;
