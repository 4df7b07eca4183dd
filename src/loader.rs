//! Host side of the bootloader protocol

use core::marker::PhantomData;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

use crate::codec::{read_packet, send_packet};
use crate::protocol::{Command, Packet, PacketStatus, EMPTY_PAYLOAD, MAX_PAYLOAD_SIZE};
use crate::transport::HalTransport;
use crate::Error;

pub trait SerialPort<E>: Write<u8, Error = E> + Read<u8, Error = E> {
    fn set_rts(&mut self, level: bool) -> Result<(), E>;
    fn set_dtr(&mut self, level: bool) -> Result<(), E>;
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Do not reset the device on connection
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub no_reset: bool,

    /// Timeout to wait for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1000"))]
    pub response_timeout_ms: u32,

    /// Period to poll for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1"))]
    pub poll_delay_ms: u32,

    /// Period to wait for bootloader init after reset
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "100"))]
    pub init_delay_ms: u32,

    /// Image bytes per write request (1 to 252)
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "128"))]
    pub chunk_size: usize,

    /// Retries for a write the device rejects
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "3"))]
    pub retries: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            no_reset: false,
            response_timeout_ms: 1000,
            poll_delay_ms: 1,
            init_delay_ms: 100,
            chunk_size: 128,
            retries: 3,
        }
    }
}

pub struct Loader<P, D, E> {
    options: Options,
    transport: HalTransport<P, D>,
    written: usize,
    _err: PhantomData<E>,
}

impl<P, D, E> Loader<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    /// Create a new loader instance
    pub fn new(port: P, delay: D, options: Options) -> Self {
        let transport = HalTransport::new(port, delay, options.poll_delay_ms);
        Self {
            options,
            transport,
            written: 0,
            _err: PhantomData,
        }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Image bytes acknowledged by the device so far
    pub fn written(&self) -> usize {
        self.written
    }

    pub fn port_mut(&mut self) -> &mut P {
        self.transport.port_mut()
    }

    /// Reset the device into the bootloader and clear the line
    pub fn init(&mut self) -> Result<(), Error<E>> {
        if !self.options.no_reset {
            debug!("Resetting device");

            self.transport.port_mut().set_dtr(true)?;
            self.transport.port_mut().set_rts(true)?;

            self.transport.delay_ms(100u32);

            self.transport.port_mut().set_dtr(false)?;
            self.transport.port_mut().set_rts(false)?;

            self.transport.delay_ms(self.options.init_delay_ms);
        }

        let stale = self.transport.drain()?;
        if stale > 0 {
            debug!("Discarded {} stale bytes", stale);
        }

        self.written = 0;

        Ok(())
    }

    /// Send a request and await a single response packet
    pub fn request(&mut self, command: Command, payload: &[u8]) -> Result<Packet, Error<E>> {
        let payload = if payload.is_empty() {
            &EMPTY_PAYLOAD[..]
        } else {
            payload
        };

        send_packet(&mut self.transport, command as u8, payload)?;

        let p = read_packet(&mut self.transport, self.options.response_timeout_ms)
            .map_err(Error::Serial)?;

        match p.status {
            PacketStatus::Incomplete => {
                error!("Response timeout");
                Err(Error::ResponseTimeout)
            }
            PacketStatus::Bad => {
                debug!("Received malformed response: {:?}", p);
                Err(Error::InvalidResponse)
            }
            PacketStatus::Ok if p.command == Command::BadPacketResponse as u8 => {
                debug!("Received bad packet response");
                Err(Error::Rejected)
            }
            PacketStatus::Ok => Ok(p),
        }
    }

    fn expect(&mut self, command: Command, payload: &[u8], expected: Command) -> Result<Packet, Error<E>> {
        let p = self.request(command, payload)?;

        if p.command != expected as u8 {
            debug!("Received unexpected response: {:?}", p);
            return Err(Error::UnexpectedResponse {
                expected: expected as u8,
                actual: p.command,
            });
        }

        Ok(p)
    }

    fn text(&mut self, command: Command, expected: Command) -> Result<String, Error<E>> {
        let p = self.expect(command, &[], expected)?;
        String::from_utf8(p.data().to_vec()).map_err(|_| Error::InvalidResponse)
    }

    /// Fetch the platform identifier
    pub fn platform(&mut self) -> Result<String, Error<E>> {
        self.text(Command::PlatformRequest, Command::PlatformResponse)
    }

    /// Fetch the firmware version
    pub fn version(&mut self) -> Result<String, Error<E>> {
        self.text(Command::VersionRequest, Command::VersionResponse)
    }

    /// Write a chunk at the device's current cursor
    pub fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), Error<E>> {
        if chunk.is_empty() {
            return Ok(());
        }
        if chunk.len() > MAX_PAYLOAD_SIZE {
            return Err(Error::PayloadTooLarge(chunk.len()));
        }

        let p = self.request(Command::WriteDataRequest, chunk)?;

        match p.kind() {
            Some(Command::WriteDataResponseOk) => {
                self.written += chunk.len();
                Ok(())
            }
            Some(Command::WriteDataResponseErr) => Err(Error::WriteRejected {
                offset: self.written,
            }),
            _ => Err(Error::UnexpectedResponse {
                expected: Command::WriteDataResponseOk as u8,
                actual: p.command,
            }),
        }
    }

    /// Stream `image` to the device, calling `progress` with the number of
    /// bytes written after each chunk.
    ///
    /// Rejected chunks are resent, the device cursor does not move on a
    /// failed write. Timeouts are not retried as the device state is then
    /// unknown.
    pub fn write_image<F>(&mut self, image: &[u8], mut progress: F) -> Result<(), Error<E>>
    where
        F: FnMut(usize),
    {
        let chunk_size = self.options.chunk_size;
        if chunk_size == 0 || chunk_size > MAX_PAYLOAD_SIZE {
            return Err(Error::InvalidOption("chunk size must be between 1 and 252"));
        }

        for chunk in image.chunks(chunk_size) {
            let mut attempt = 0;

            loop {
                match self.write_chunk(chunk) {
                    Ok(()) => break,
                    Err(Error::WriteRejected { offset }) if attempt < self.options.retries => {
                        attempt += 1;
                        warn!("Write at offset {} rejected, retry {}", offset, attempt);
                    }
                    Err(e) => return Err(e),
                }
            }

            progress(self.written);
        }

        Ok(())
    }

    /// Hand off to the application, the bootloader stops responding after this
    pub fn start_app(&mut self) -> Result<(), Error<E>> {
        self.expect(Command::StartAppRequest, &[], Command::StartAppResponse)?;
        Ok(())
    }
}
