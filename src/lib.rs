//! UART flash bootloader.
//!
//! A point-to-point, XOR checksummed packet protocol for querying a
//! device, writing a new application image into flash and handing off
//! execution to it. The [`engine`] module is the device side, the
//! [`loader`] module the host side; both share the [`codec`].

#[macro_use]
extern crate log;

#[macro_use(block)]
extern crate nb;

extern crate embedded_hal;

#[cfg(feature = "structopt")]
extern crate structopt;

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;

pub mod codec;
pub mod engine;
pub mod flash;
pub mod loader;
pub mod protocol;
pub mod transport;

#[cfg(feature = "linux")]
pub mod linux;

#[cfg(test)]
mod mock;

pub use engine::{Engine, EngineOptions, Session, State};
pub use flash::{FlashStore, MemFlash};
pub use loader::{Loader, Options};
pub use protocol::{Command, Packet, PacketStatus};
pub use transport::{HalTransport, Transport};

#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum Error<SerialError: core::fmt::Debug> {
    #[error("serial error: {0:?}")]
    Serial(SerialError),

    #[error("timeout waiting for response")]
    ResponseTimeout,

    #[error("malformed response packet")]
    InvalidResponse,

    #[error("packet rejected by device")]
    Rejected,

    #[error("unexpected response 0x{actual:02x} (expected 0x{expected:02x})")]
    UnexpectedResponse { expected: u8, actual: u8 },

    #[error("device rejected write at offset {offset}")]
    WriteRejected { offset: usize },

    #[error("payload of {0} bytes exceeds packet capacity")]
    PayloadTooLarge(usize),

    #[error("invalid option: {0}")]
    InvalidOption(&'static str),
}

impl<SerialError: core::fmt::Debug> From<SerialError> for Error<SerialError> {
    fn from(e: SerialError) -> Self {
        Self::Serial(e)
    }
}
