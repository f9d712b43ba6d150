// Copyright 2020, 2021 Adam Greig
// Licensed under the Apache-2.0 and MIT licenses.

//! nrf24-spi-flash
//!
//! This crate reprograms the boot loader of an nRF24LU1+ radio by
//! bit-banging its SPI flash programming interface over GPIO lines.
//!
//! The crate is layered:
//!
//! * [`Gpio`] is the line-level capability the crate consumes, implemented
//!   by [`sim::SimDevice`] and, with the `gpio-cdev` feature, by
//!   `cdev::CdevGpio` for Linux GPIO character devices.
//! * [`Transceiver`] builds a full-duplex SPI byte exchange from pin toggles.
//! * [`Flash`] speaks the device's flash command set on top of the transceiver.
//! * [`Session`] sequences an entire boot loader flashing session.

use core::time::Duration;

pub mod bitbang;
#[cfg(feature = "gpio-cdev")]
pub mod cdev;
pub mod image;
pub mod pins;
pub mod poll;
pub mod profile;
pub mod protocol;
pub mod session;
pub mod sim;
pub mod sreg;

pub use bitbang::{Timing, Transceiver};
pub use image::{FirmwareImage, Strategy};
pub use pins::{Pin, PinMap};
pub use poll::{CancelToken, PollPolicy};
pub use profile::{DeviceProfile, Opcode, Region};
pub use protocol::Flash;
pub use session::{
    ChipId, Session, SessionConfig, SessionReport, SessionState, Verification, VerifyPolicy,
};
pub use sreg::FlashStatus;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Could not enable writing (status 0x{status:02X}), check the connection and try again.")]
    WriteEnableFailed { status: u8 },
    #[error("Device still busy after {waited:?}.")]
    Unresponsive { waited: Duration },
    #[error("Operation cancelled while waiting for the device.")]
    Cancelled,
    #[error("{what} verification failed at 0x{address:04X}: wrote 0x{wrote:02X}, read 0x{read:02X}.")]
    VerifyFailed { what: &'static str, address: u16, wrote: u8, read: u8 },
    #[error("Address out of range for {region:?}: 0x{address:05X}.")]
    InvalidAddress { region: Region, address: u32 },
    #[error("No device detected: reset line is not pulled up.")]
    NotConnected,
    #[error("Image is empty.")]
    ImageEmpty,
    #[error("Image of {len} bytes does not fit in {max} bytes of flash.")]
    ImageTooLarge { len: usize, max: usize },
    #[error("Image of {len} bytes has no data past boot loader offset 0x{offset:04X}.")]
    ImageTooShort { len: usize, offset: usize },
    #[error("IO error reading firmware image: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Access(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

pub type AnyhowResult<T> = anyhow::Result<T>;

/// Logic level of a GPIO line.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Level {
    Low,
    High,
}

impl Level {
    /// Level for a single bit.
    pub fn from_bit(bit: bool) -> Self {
        if bit { Level::High } else { Level::Low }
    }

    pub fn is_high(self) -> bool {
        self == Level::High
    }
}

/// Direction of a GPIO line, with the initial level for outputs.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PinMode {
    Input,
    Output(Level),
}

/// Trait for objects which provide access to GPIO lines.
///
/// Providers configure, drive, and sample individual lines identified by
/// a [`Pin`], and provide the sleep used for signal settling. Nothing else
/// touches the lines while a [`Session`] holds the provider.
pub trait Gpio {
    /// Configure `pin` as an input, or as an output driven to an initial level.
    fn configure(&mut self, pin: Pin, mode: PinMode) -> AnyhowResult<()>;

    /// Drive an output line.
    fn write(&mut self, pin: Pin, level: Level) -> AnyhowResult<()>;

    /// Sample a line.
    fn read(&mut self, pin: Pin) -> AnyhowResult<Level>;

    fn sleep(&mut self, dur: Duration);
}
