//! Scripted serial port and delay for unit tests

use std::collections::VecDeque;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

use crate::loader::SerialPort;

#[derive(Debug, Default)]
pub struct MockPort {
    pub rx: VecDeque<u8>,
    pub tx: Vec<u8>,
    pub polls: usize,
    pub flushes: usize,
    pub fail_reads: bool,
    pub lines: Vec<(&'static str, bool)>,
}

impl MockPort {
    pub fn with_rx(data: &[u8]) -> Self {
        let mut p = Self::default();
        p.push_rx(data);
        p
    }

    pub fn push_rx(&mut self, data: &[u8]) {
        self.rx.extend(data.iter().copied());
    }
}

impl Read<u8> for MockPort {
    type Error = ();

    fn read(&mut self) -> nb::Result<u8, ()> {
        self.polls += 1;
        if self.fail_reads {
            return Err(nb::Error::Other(()));
        }
        self.rx.pop_front().ok_or(nb::Error::WouldBlock)
    }
}

impl Write<u8> for MockPort {
    type Error = ();

    fn write(&mut self, word: u8) -> nb::Result<(), ()> {
        self.tx.push(word);
        Ok(())
    }

    fn flush(&mut self) -> nb::Result<(), ()> {
        self.flushes += 1;
        Ok(())
    }
}

impl SerialPort<()> for MockPort {
    fn set_rts(&mut self, level: bool) -> Result<(), ()> {
        self.lines.push(("rts", level));
        Ok(())
    }

    fn set_dtr(&mut self, level: bool) -> Result<(), ()> {
        self.lines.push(("dtr", level));
        Ok(())
    }
}

pub struct NoDelay;

impl DelayMs<u32> for NoDelay {
    fn delay_ms(&mut self, _ms: u32) {}
}
