use core::convert::TryFrom;
use core::fmt;

/// Largest value the length byte can describe
pub const PROTOCOL_MAX_DATA_SIZE: usize = 255;

/// Command, length and checksum bytes
pub const PROTOCOL_CONTROL_PACKET_SIZE: usize = 3;

/// Largest payload a single packet can carry
pub const MAX_PAYLOAD_SIZE: usize = PROTOCOL_MAX_DATA_SIZE - PROTOCOL_CONTROL_PACKET_SIZE;

/// Largest encoded packet
pub const MAX_PACKET_SIZE: usize = PROTOCOL_MAX_DATA_SIZE;

/// Filler payload for packets without meaningful data, a frame must
/// carry at least one data byte.
pub const EMPTY_PAYLOAD: [u8; 1] = [0x00];

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Command {
    /// Ask for the platform identifier
    PlatformRequest = 0x00,
    /// Platform identifier text
    PlatformResponse = 0x01,

    /// Ask for the firmware version
    VersionRequest = 0x02,
    /// Firmware version text
    VersionResponse = 0x03,

    /// Raw image bytes to be written at the session cursor
    WriteDataRequest = 0x04,
    /// Bytes written, cursor advanced
    WriteDataResponseOk = 0x05,
    /// Write rejected, cursor unchanged
    WriteDataResponseErr = 0x06,

    /// Hand off execution to the application
    StartAppRequest = 0x07,
    /// Sent immediately before the hand-off
    StartAppResponse = 0x08,

    /// Malformed packet or unrecognized command
    BadPacketResponse = 0xFF,
}

impl Command {
    /// Whether the device acts on this command
    pub fn is_request(self) -> bool {
        matches!(
            self,
            Command::PlatformRequest
                | Command::VersionRequest
                | Command::WriteDataRequest
                | Command::StartAppRequest
        )
    }
}

impl From<Command> for u8 {
    fn from(c: Command) -> u8 {
        c as u8
    }
}

impl TryFrom<u8> for Command {
    type Error = u8;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        let c = match v {
            0x00 => Command::PlatformRequest,
            0x01 => Command::PlatformResponse,
            0x02 => Command::VersionRequest,
            0x03 => Command::VersionResponse,
            0x04 => Command::WriteDataRequest,
            0x05 => Command::WriteDataResponseOk,
            0x06 => Command::WriteDataResponseErr,
            0x07 => Command::StartAppRequest,
            0x08 => Command::StartAppResponse,
            0xFF => Command::BadPacketResponse,
            other => return Err(other),
        };
        Ok(c)
    }
}

/// Decode result of a packet.
///
/// Discriminants match the values used on existing devices, `2` has no
/// assigned meaning.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum PacketStatus {
    /// Malformed length or checksum mismatch
    Bad = 0,
    /// The peer went silent before the packet was complete
    Incomplete = 1,
    /// Length and checksum verified
    Ok = 3,
}

/// A single decoded protocol message
#[derive(Clone)]
pub struct Packet {
    pub status: PacketStatus,
    pub command: u8,
    data: [u8; PROTOCOL_MAX_DATA_SIZE],
    data_size: u8,
}

impl Packet {
    pub(crate) fn with_status(status: PacketStatus, command: u8) -> Self {
        Self {
            status,
            command,
            data: [0u8; PROTOCOL_MAX_DATA_SIZE],
            data_size: 0,
        }
    }

    /// Packet for a read that timed out
    pub fn incomplete() -> Self {
        Self::with_status(PacketStatus::Incomplete, 0)
    }

    /// Packet that failed framing or integrity checks
    pub fn bad(command: u8) -> Self {
        Self::with_status(PacketStatus::Bad, command)
    }

    /// Build a verified packet from a command and payload
    pub fn new(command: u8, data: &[u8]) -> Option<Self> {
        if data.len() > MAX_PAYLOAD_SIZE {
            return None;
        }

        let mut p = Self::with_status(PacketStatus::Ok, command);
        p.data[..data.len()].copy_from_slice(data);
        p.data_size = data.len() as u8;
        Some(p)
    }

    /// Meaningful payload bytes
    pub fn data(&self) -> &[u8] {
        &self.data[..self.data_size as usize]
    }

    pub fn data_size(&self) -> usize {
        self.data_size as usize
    }

    pub(crate) fn buffer_mut(&mut self, data_size: u8) -> &mut [u8] {
        self.data_size = data_size;
        &mut self.data[..data_size as usize]
    }

    pub fn is_ok(&self) -> bool {
        self.status == PacketStatus::Ok
    }

    /// Recognized command, if any
    pub fn kind(&self) -> Option<Command> {
        Command::try_from(self.command).ok()
    }
}

impl PartialEq for Packet {
    fn eq(&self, other: &Self) -> bool {
        self.status == other.status && self.command == other.command && self.data() == other.data()
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("status", &self.status)
            .field("command", &format_args!("0x{:02x}", self.command))
            .field("data", &format_args!("{:02x?}", self.data()))
            .finish()
    }
}
