//! Blocking reads and writes of frames and handshake fields on a byte stream.

use super::message::{Envelope, DISCONNECT_MESSAGE};
use crate::{Result, SbwError};
use bytes::Bytes;
use std::io::{Read, Write};

/// Upper bound for a handshake string (session key or module name).
pub const MAX_HANDSHAKE_STRING: usize = 64 * 1024;

/// Upper bound for a frame's `[length]`; larger frames are refused unread.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Smallest valid `[length]`: length, destination, kind and message id.
const MIN_FRAME_LEN: i32 = 13;

/// What the reader found in the length slot.
#[derive(Debug)]
pub enum Incoming {
    /// The peer announced it is going away.
    Disconnect,
    /// A frame addressed to `destination`; `body` starts at the kind byte.
    Frame { destination: i32, body: Bytes },
}

impl Incoming {
    pub fn into_envelope(self) -> Result<Option<Envelope>> {
        // ---
        match self {
            Incoming::Disconnect => Ok(None),
            Incoming::Frame { destination, body } => Envelope::from_body(destination, body).map(Some),
        }
    }
}

pub fn read_i32<R: Read>(stream: &mut R) -> std::io::Result<i32> {
    // ---
    let mut word = [0u8; 4];
    stream.read_exact(&mut word)?;
    Ok(i32::from_le_bytes(word))
}

pub fn write_i32<W: Write>(stream: &mut W, value: i32) -> std::io::Result<()> {
    stream.write_all(&value.to_le_bytes())
}

/// Read one frame, or the disconnect notice.
pub fn read_incoming<R: Read>(stream: &mut R) -> Result<Incoming> {
    // ---
    let length = read_i32(stream)?;
    if length == DISCONNECT_MESSAGE {
        return Ok(Incoming::Disconnect);
    }
    if length < MIN_FRAME_LEN || length as usize > MAX_FRAME_LEN {
        return Err(SbwError::communication(format!(
            "invalid frame length {length}"
        )));
    }

    let destination = read_i32(stream)?;
    let mut body = vec![0u8; length as usize - 8];
    stream.read_exact(&mut body)?;
    Ok(Incoming::Frame {
        destination,
        body: Bytes::from(body),
    })
}

/// Handshake strings are length-prefixed with no type tag.
pub fn write_handshake_string<W: Write>(stream: &mut W, value: &str) -> std::io::Result<()> {
    // ---
    write_i32(stream, value.len() as i32)?;
    stream.write_all(value.as_bytes())
}

pub fn read_handshake_string<R: Read>(stream: &mut R) -> Result<String> {
    // ---
    let len = read_i32(stream)?;
    let len = usize::try_from(len)
        .ok()
        .filter(|n| *n <= MAX_HANDSHAKE_STRING)
        .ok_or_else(|| SbwError::communication(format!("invalid handshake field length {len}")))?;
    let mut bytes = vec![0u8; len];
    stream.read_exact(&mut bytes)?;
    String::from_utf8(bytes)
        .map_err(|_| SbwError::communication("handshake field is not UTF-8"))
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::protocol::{encode_call, encode_disconnect, DataBlockWriter, MessageKind};
    use std::io::Cursor;

    #[test]
    fn test_reads_frame_then_disconnect() {
        // ---
        let mut wire = encode_call(3, 1, 7, 1, 2, &DataBlockWriter::new()).to_vec();
        wire.extend_from_slice(&encode_disconnect());
        let mut cursor = Cursor::new(wire);

        let env = read_incoming(&mut cursor).unwrap().into_envelope().unwrap().unwrap();
        assert_eq!(env.destination, 3);
        assert_eq!(env.kind, MessageKind::Call);
        assert!(matches!(read_incoming(&mut cursor).unwrap(), Incoming::Disconnect));
    }

    #[test]
    fn test_short_stream_is_io_error() {
        // ---
        let wire = encode_call(3, 1, 7, 1, 2, &DataBlockWriter::new());
        let mut cursor = Cursor::new(wire[..wire.len() - 2].to_vec());
        assert!(matches!(read_incoming(&mut cursor), Err(SbwError::Io(_))));
    }

    #[test]
    fn test_oversized_frame_rejected_before_body() {
        // ---
        let mut wire = Vec::new();
        write_i32(&mut wire, i32::MAX).unwrap();
        write_i32(&mut wire, 3).unwrap();
        let mut cursor = Cursor::new(wire);

        let err = read_incoming(&mut cursor).unwrap_err();
        assert!(matches!(err, SbwError::Communication { .. }));
        assert_eq!(err.message(), format!("invalid frame length {}", i32::MAX));
        // Only the length slot was consumed.
        assert_eq!(cursor.position(), 4);
    }

    #[test]
    fn test_handshake_string_round_trip() {
        // ---
        let mut buf = Vec::new();
        write_handshake_string(&mut buf, "ABCDEF").unwrap();
        write_handshake_string(&mut buf, "").unwrap();
        assert_eq!(&buf[..4], &[6, 0, 0, 0]);

        let mut cursor = Cursor::new(buf);
        assert_eq!(read_handshake_string(&mut cursor).unwrap(), "ABCDEF");
        assert_eq!(read_handshake_string(&mut cursor).unwrap(), "");
    }

    #[test]
    fn test_oversized_handshake_string_rejected() {
        // ---
        let mut buf = Vec::new();
        write_i32(&mut buf, i32::MAX).unwrap();
        let mut cursor = Cursor::new(buf);
        assert!(read_handshake_string(&mut cursor).is_err());
    }
}
