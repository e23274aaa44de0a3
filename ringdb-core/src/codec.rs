//! Checksummed record framing shared by the volume files and the series
//! metadata log.
//!
//! Frame layout:
//! - 4 bytes: payload length (little endian)
//! - 4 bytes: CRC32 of the payload
//! - N bytes: payload
//!
//! A zero length marks the end of the written region.

use crate::{Result, RingError};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the frame header
pub const FRAME_HEADER: usize = 8;

/// Outcome of decoding a frame from the front of a buffer
#[derive(Debug)]
pub enum Decoded {
    /// A complete frame: payload and total bytes consumed
    Frame(Bytes, usize),
    /// Zero-length terminator
    End,
    /// Not enough bytes for the declared length (torn write)
    Incomplete,
}

/// Wrap a payload in a length + CRC header
pub fn encode_frame(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER + payload.len());
    buf.put_u32_le(payload.len() as u32);
    buf.put_u32_le(crc32fast::hash(payload));
    buf.put_slice(payload);
    buf.freeze()
}

/// Decode the frame at the start of `data`, validating its checksum
pub fn decode_frame(data: &[u8]) -> Result<Decoded> {
    if data.len() < FRAME_HEADER {
        return Ok(if data.len() >= 4 && data[..4] == [0, 0, 0, 0] {
            Decoded::End
        } else {
            Decoded::Incomplete
        });
    }

    let mut header = &data[..FRAME_HEADER];
    let len = header.get_u32_le() as usize;
    let expected = header.get_u32_le();
    if len == 0 {
        return Ok(Decoded::End);
    }
    if data.len() < FRAME_HEADER + len {
        return Ok(Decoded::Incomplete);
    }

    let payload = &data[FRAME_HEADER..FRAME_HEADER + len];
    let actual = crc32fast::hash(payload);
    if expected != actual {
        return Err(RingError::ChecksumMismatch { expected, actual });
    }

    Ok(Decoded::Frame(
        Bytes::copy_from_slice(payload),
        FRAME_HEADER + len,
    ))
}
