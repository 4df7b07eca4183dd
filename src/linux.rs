//! Linux serial devices

use std::io::{Error as IoError, ErrorKind as IoErrorKind};
use std::path::Path;
use std::str::FromStr;

use linux_embedded_hal::serial_core::{
    BaudRate, CharSize, Error as SerialError, FlowControl, Parity, SerialDevice as _,
    SerialPortSettings as _, StopBits,
};
use linux_embedded_hal::{Delay, Serial};

use crate::loader::{Loader, Options, SerialPort};

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum LineParity {
    None,
    Even,
    Odd,
}

impl FromStr for LineParity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "n" => Ok(LineParity::None),
            "even" | "e" => Ok(LineParity::Even),
            "odd" | "o" => Ok(LineParity::Odd),
            other => Err(format!("unknown parity '{}'", other)),
        }
    }
}

impl From<LineParity> for Parity {
    fn from(p: LineParity) -> Parity {
        match p {
            LineParity::None => Parity::ParityNone,
            LineParity::Even => Parity::ParityEven,
            LineParity::Odd => Parity::ParityOdd,
        }
    }
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct LineSettings {
    /// Serial port to connect to
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "/dev/ttyUSB0"))]
    pub port: String,

    /// Serial port baud rate
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "115200"))]
    pub baud: usize,

    /// Line parity (none, even, odd)
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "none"))]
    pub parity: LineParity,
}

/// Open `line.port` as 8 data bits, 1 stop bit, no flow control
pub fn open(line: &LineSettings) -> Result<Serial, SerialError> {
    let mut port = Serial::open(Path::new(&line.port))?;
    let mut settings = port.0.read_settings()?;

    settings.set_baud_rate(BaudRate::from_speed(line.baud))?;
    settings.set_char_size(CharSize::Bits8);
    settings.set_parity(line.parity.into());
    settings.set_stop_bits(StopBits::Stop1);
    settings.set_flow_control(FlowControl::FlowNone);

    port.0.write_settings(&settings)?;

    debug!(
        "Opened {} at {} baud, {:?} parity",
        line.port, line.baud, line.parity
    );

    Ok(port)
}

fn control_line(name: &str, e: SerialError) -> IoErrorKind {
    error!("Failed to drive {}: {}", name, e);
    IoError::from(e).kind()
}

impl SerialPort<IoErrorKind> for Serial {
    fn set_rts(&mut self, level: bool) -> Result<(), IoErrorKind> {
        self.0.set_rts(level).map_err(|e| control_line("RTS", e))
    }

    fn set_dtr(&mut self, level: bool) -> Result<(), IoErrorKind> {
        self.0.set_dtr(level).map_err(|e| control_line("DTR", e))
    }
}

impl Loader<Serial, Delay, IoErrorKind> {
    /// Create a loader on a Linux serial device
    pub fn linux(line: &LineSettings, options: Options) -> Result<Self, SerialError> {
        let port = open(line)?;
        Ok(Self::new(port, Delay, options))
    }
}
