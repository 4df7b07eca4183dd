use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

/// Failure to receive a byte
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum ReceiveError<E> {
    /// Nothing arrived within the timeout
    Timeout,
    /// The underlying port reported an error
    Serial(E),
}

impl<E> From<E> for ReceiveError<E> {
    fn from(e: E) -> Self {
        Self::Serial(e)
    }
}

/// Byte oriented serial link
pub trait Transport {
    type Error: core::fmt::Debug;

    /// Block until a byte arrives or `timeout_ms` elapses
    fn receive_byte(&mut self, timeout_ms: u32) -> Result<u8, ReceiveError<Self::Error>>;

    fn send_byte(&mut self, byte: u8) -> Result<(), Self::Error>;

    /// Wait for queued bytes to leave the port
    fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// [`Transport`] over an `embedded-hal` serial port, timing out receives
/// by polling the port every `poll_delay_ms`.
pub struct HalTransport<P, D> {
    port: P,
    delay: D,
    poll_delay_ms: u32,
}

impl<P, D, E> HalTransport<P, D>
where
    P: Read<u8, Error = E> + Write<u8, Error = E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    pub fn new(port: P, delay: D, poll_delay_ms: u32) -> Self {
        Self {
            port,
            delay,
            poll_delay_ms,
        }
    }

    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    pub fn delay_ms(&mut self, ms: u32) {
        self.delay.delay_ms(ms)
    }

    /// Discard anything already buffered by the port
    pub fn drain(&mut self) -> Result<usize, E> {
        let mut n = 0;
        loop {
            match self.port.read() {
                Ok(_) => n += 1,
                Err(nb::Error::WouldBlock) => return Ok(n),
                Err(nb::Error::Other(e)) => return Err(e),
            }
        }
    }

    pub fn release(self) -> (P, D) {
        (self.port, self.delay)
    }
}

impl<P, D, E> Transport for HalTransport<P, D>
where
    P: Read<u8, Error = E> + Write<u8, Error = E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    type Error = E;

    fn receive_byte(&mut self, timeout_ms: u32) -> Result<u8, ReceiveError<E>> {
        let mut t = 0;

        loop {
            match self.port.read() {
                Err(nb::Error::WouldBlock) => (),
                Err(nb::Error::Other(e)) => return Err(e.into()),
                Ok(v) => return Ok(v),
            };

            if t >= timeout_ms {
                return Err(ReceiveError::Timeout);
            }

            // Wait for delay period
            self.delay.delay_ms(self.poll_delay_ms);
            t += self.poll_delay_ms.max(1);
        }
    }

    fn send_byte(&mut self, byte: u8) -> Result<(), E> {
        block!(self.port.write(byte))
    }

    fn flush(&mut self) -> Result<(), E> {
        block!(self.port.flush())
    }
}
