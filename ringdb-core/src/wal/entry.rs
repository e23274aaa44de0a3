//! Input log entries and their on-disk framing
//!
//! ```text
//! | len: u32 | kind: u8 | payload_len: u32 | payload | crc32: u32 |
//! ```
//!
//! `len` counts every byte after itself. The checksum covers `kind`,
//! `payload_len` and `payload`. Integers are little endian.

use crate::{Record, Result, RingError, SeriesId, SeriesKey};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// `kind` + `payload_len` + `crc32`
const OVERHEAD: usize = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum WalEntryType {
    /// A series was assigned an id
    Series = 1,
    /// Samples accepted from one frame
    Samples = 2,
}

impl TryFrom<u8> for WalEntryType {
    type Error = RingError;

    fn try_from(tag: u8) -> Result<Self> {
        [Self::Series, Self::Samples]
            .into_iter()
            .find(|kind| *kind as u8 == tag)
            .ok_or_else(|| RingError::Corruption(format!("unknown input log entry kind {}", tag)))
    }
}

/// What an entry says once its payload is decoded
#[derive(Debug, Clone, PartialEq)]
pub enum WalRecord {
    Series { id: SeriesId, key: SeriesKey },
    Samples(Vec<Record>),
}

#[derive(Debug, Clone)]
pub struct WalEntry {
    pub entry_type: WalEntryType,
    /// bincode-encoded body
    pub payload: Vec<u8>,
}

impl WalEntry {
    pub fn series(id: SeriesId, key: &SeriesKey) -> Result<Self> {
        Ok(Self {
            entry_type: WalEntryType::Series,
            payload: bincode::serialize(&(id, key.canonical()))?,
        })
    }

    pub fn samples(records: &[Record]) -> Result<Self> {
        Ok(Self {
            entry_type: WalEntryType::Samples,
            payload: bincode::serialize(records)?,
        })
    }

    /// Frame the entry for appending to a segment
    pub fn serialize_with_checksum(&self) -> Bytes {
        let body_len = 5 + self.payload.len();
        let mut frame = BytesMut::with_capacity(4 + body_len + 4);
        frame.put_u32_le((body_len + 4) as u32);
        frame.put_u8(self.entry_type as u8);
        frame.put_u32_le(self.payload.len() as u32);
        frame.put_slice(&self.payload);
        let crc = crc32fast::hash(&frame[4..]);
        frame.put_u32_le(crc);
        frame.freeze()
    }

    /// Read one frame from the front of `data`, returning the entry and the
    /// number of bytes it took. A frame cut short is `InvalidFormat`; one
    /// that is complete but wrong is `ChecksumMismatch` or `Corruption`.
    pub fn deserialize_with_checksum(data: &[u8]) -> Result<(Self, usize)> {
        let mut input = data;
        if input.remaining() < 4 {
            return Err(RingError::InvalidFormat("truncated entry header".into()));
        }
        let len = input.get_u32_le() as usize;
        if len < OVERHEAD {
            return Err(RingError::Corruption(format!("input log entry length {}", len)));
        }
        if input.remaining() < len {
            return Err(RingError::InvalidFormat("truncated entry".into()));
        }

        let (mut body, mut tail) = input[..len].split_at(len - 4);
        let expected = tail.get_u32_le();
        let actual = crc32fast::hash(body);
        if expected != actual {
            return Err(RingError::ChecksumMismatch { expected, actual });
        }

        let entry_type = WalEntryType::try_from(body.get_u8())?;
        if body.get_u32_le() as usize != body.len() {
            return Err(RingError::Corruption("input log payload length mismatch".into()));
        }
        let entry = Self {
            entry_type,
            payload: body.to_vec(),
        };
        Ok((entry, 4 + len))
    }

    pub fn decode(&self) -> Result<WalRecord> {
        Ok(match self.entry_type {
            WalEntryType::Series => {
                let (id, name): (SeriesId, String) = bincode::deserialize(&self.payload)?;
                WalRecord::Series {
                    id,
                    key: SeriesKey::parse(&name)?,
                }
            }
            WalEntryType::Samples => WalRecord::Samples(bincode::deserialize(&self.payload)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Value;

    #[test]
    fn test_entry_serialization() {
        let records = vec![Record {
            seq: 3,
            series: 1,
            timestamp: 1_000_000,
            value: Value::Float(23.5),
        }];

        let entry = WalEntry::samples(&records).unwrap();
        let serialized = entry.serialize_with_checksum();

        let (deserialized, len) = WalEntry::deserialize_with_checksum(&serialized).unwrap();
        assert_eq!(len, serialized.len());
        assert_eq!(deserialized.entry_type, WalEntryType::Samples);
        assert_eq!(deserialized.decode().unwrap(), WalRecord::Samples(records));
    }

    #[test]
    fn test_series_entry() {
        let key = SeriesKey::parse("cpu host=A").unwrap();
        let entry = WalEntry::series(4, &key).unwrap();
        let bytes = entry.serialize_with_checksum();
        let (decoded, _) = WalEntry::deserialize_with_checksum(&bytes).unwrap();
        assert_eq!(decoded.decode().unwrap(), WalRecord::Series { id: 4, key });
    }

    #[test]
    fn test_short_input_is_torn() {
        let key = SeriesKey::parse("cpu host=A").unwrap();
        let frame = WalEntry::series(1, &key).unwrap().serialize_with_checksum();
        for cut in [0, 3, frame.len() - 1] {
            assert!(matches!(
                WalEntry::deserialize_with_checksum(&frame[..cut]),
                Err(RingError::InvalidFormat(_))
            ));
        }
    }

    #[test]
    fn test_checksum_validation() {
        let key = SeriesKey::parse("cpu host=A").unwrap();
        let entry = WalEntry::series(1, &key).unwrap();
        let mut serialized = entry.serialize_with_checksum().to_vec();

        serialized[10] ^= 0xFF;

        let result = WalEntry::deserialize_with_checksum(&serialized);
        assert!(matches!(result, Err(RingError::ChecksumMismatch { .. })));
    }
}
