//! Fan-out framing: a 4-byte big-endian length followed by that many bytes of JPEG.
//!
//! There is no version byte or message type; every message is one frame.

use std::io::{self, Read, Write};

use crate::error::FanoutError;

/// Size of the length prefix.
pub const HEADER_LEN: usize = 4;

/// Largest payload a subscriber accepts unless told otherwise.
pub const DEFAULT_MAX_FRAME: u32 = 64 * 1024 * 1024;

/// Build one complete message (`length || payload`).
pub fn encode_message(payload: &[u8]) -> Result<Vec<u8>, FanoutError> {
    let len = u32::try_from(payload.len())
        .map_err(|_| FanoutError::FrameTooLarge(u32::MAX))?;
    let mut message = Vec::with_capacity(HEADER_LEN + payload.len());
    message.extend_from_slice(&len.to_be_bytes());
    message.extend_from_slice(payload);
    Ok(message)
}

pub fn write_message<W: Write>(writer: &mut W, payload: &[u8]) -> Result<(), FanoutError> {
    writer.write_all(&encode_message(payload)?)?;
    Ok(())
}

/// Read one message, rejecting payloads above `max_len`.
///
/// A stream that ends anywhere inside a message reports `ConnectionClosed`.
pub fn read_message<R: Read>(reader: &mut R, max_len: u32) -> Result<Vec<u8>, FanoutError> {
    let mut header = [0u8; HEADER_LEN];
    read_full(reader, &mut header)?;
    let len = u32::from_be_bytes(header);
    if len > max_len {
        return Err(FanoutError::FrameTooLarge(len));
    }
    let mut payload = vec![0u8; len as usize];
    read_full(reader, &mut payload)?;
    Ok(payload)
}

fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<(), FanoutError> {
    reader.read_exact(buf).map_err(|err| match err.kind() {
        io::ErrorKind::UnexpectedEof => FanoutError::ConnectionClosed,
        _ => FanoutError::Io(err),
    })
}
