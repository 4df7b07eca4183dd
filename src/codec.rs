//! Packet framing.
//!
//! ```text
//! <command> <length> <data: length - 3 bytes> <checksum>
//! ```
//!
//! `length` counts the whole packet including the three control bytes and
//! `checksum` is the XOR of every preceding byte. At least one data byte
//! is required, a packet with `length == 3` is malformed.

use crate::protocol::{
    Packet, PacketStatus, MAX_PACKET_SIZE, MAX_PAYLOAD_SIZE, PROTOCOL_CONTROL_PACKET_SIZE,
};
use crate::transport::{ReceiveError, Transport};
use crate::Error;

#[derive(Copy, Clone, PartialEq, Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("payload of {0} bytes exceeds packet capacity")]
    PayloadTooLarge(usize),

    #[error("buffer too small, {needed} bytes required")]
    BufferTooSmall { needed: usize },
}

impl EncodeError {
    fn into_error<E: core::fmt::Debug>(self) -> Error<E> {
        match self {
            EncodeError::PayloadTooLarge(n) => Error::PayloadTooLarge(n),
            EncodeError::BufferTooSmall { needed } => Error::PayloadTooLarge(needed),
        }
    }
}

/// Running XOR over `bytes`
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}

/// Encode a packet into `buff`, returning the number of bytes used.
///
/// An empty payload is encoded as-is and will be rejected by the receiver.
pub fn encode(command: u8, data: &[u8], buff: &mut [u8]) -> Result<usize, EncodeError> {
    if data.len() > MAX_PAYLOAD_SIZE {
        return Err(EncodeError::PayloadTooLarge(data.len()));
    }

    let len = data.len() + PROTOCOL_CONTROL_PACKET_SIZE;
    if buff.len() < len {
        return Err(EncodeError::BufferTooSmall { needed: len });
    }

    buff[0] = command;
    buff[1] = len as u8;
    buff[2..len - 1].copy_from_slice(data);
    buff[len - 1] = checksum(&buff[..len - 1]);

    Ok(len)
}

/// Encode and transmit a packet
pub fn send_packet<T: Transport>(t: &mut T, command: u8, data: &[u8]) -> Result<(), Error<T::Error>> {
    let mut buff = [0u8; MAX_PACKET_SIZE];
    let n = encode(command, data, &mut buff).map_err(EncodeError::into_error)?;

    trace!("Sending packet: {:02x?}", &buff[..n]);

    for b in &buff[..n] {
        t.send_byte(*b)?;
    }
    t.flush()?;

    Ok(())
}

/// Transmit `text` as the payload, stopping at the first NUL if present
pub fn send_string_packet<T: Transport>(t: &mut T, command: u8, text: &str) -> Result<(), Error<T::Error>> {
    let bytes = text.as_bytes();
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());

    send_packet(t, command, &bytes[..end])
}

fn next<T: Transport>(t: &mut T, timeout_ms: u32) -> Result<Option<u8>, T::Error> {
    match t.receive_byte(timeout_ms) {
        Ok(v) => Ok(Some(v)),
        Err(ReceiveError::Timeout) => Ok(None),
        Err(ReceiveError::Serial(e)) => Err(e),
    }
}

/// Read and verify one packet.
///
/// A timeout at any point yields [`PacketStatus::Incomplete`] and the
/// partial packet is discarded. Framing or checksum failures yield
/// [`PacketStatus::Bad`]. Only port errors are returned as `Err`.
pub fn read_packet<T: Transport>(t: &mut T, timeout_ms: u32) -> Result<Packet, T::Error> {
    let command = match next(t, timeout_ms)? {
        Some(v) => v,
        None => return Ok(Packet::incomplete()),
    };

    let length = match next(t, timeout_ms)? {
        Some(v) => v,
        None => return Ok(Packet::incomplete()),
    };

    let data_size = match (length as usize).checked_sub(PROTOCOL_CONTROL_PACKET_SIZE) {
        Some(n) if n > 0 && n <= MAX_PAYLOAD_SIZE => n,
        Some(_) => {
            // Well delimited but empty, consume the checksum so the next
            // read starts on a packet boundary
            debug!("Empty packet (command 0x{:02x})", command);
            if next(t, timeout_ms)?.is_none() {
                return Ok(Packet::incomplete());
            }
            return Ok(Packet::bad(command));
        }
        None => {
            debug!("Invalid packet length {} (command 0x{:02x})", length, command);
            return Ok(Packet::bad(command));
        }
    };

    let mut packet = Packet::with_status(PacketStatus::Incomplete, command);
    let mut sum = command ^ length;

    for b in packet.buffer_mut(data_size as u8).iter_mut() {
        match next(t, timeout_ms)? {
            Some(v) => {
                *b = v;
                sum ^= v;
            }
            None => return Ok(Packet::incomplete()),
        }
    }

    let received = match next(t, timeout_ms)? {
        Some(v) => v,
        None => return Ok(Packet::incomplete()),
    };

    if received != sum {
        debug!(
            "Checksum mismatch (command 0x{:02x}, expected 0x{:02x}, received 0x{:02x})",
            command, sum, received
        );
        packet.status = PacketStatus::Bad;
    } else {
        packet.status = PacketStatus::Ok;
    }

    Ok(packet)
}
