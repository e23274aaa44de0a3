//! A single fixed-capacity volume file
//!
//! Layout:
//! - 32-byte header: magic, version, ring index, generation, capacity
//! - block frames (see `codec`), each an LZ4-compressed bincode `Block`
//! - a zero terminator after the last block
//!
//! The file is preallocated to `capacity` bytes. Every block carries the
//! volume generation so that data left over from before a recycle is never
//! mistaken for current data.

use crate::codec::{decode_frame, encode_frame, Decoded, FRAME_HEADER};
use crate::{Record, Result, RingError};
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

const MAGIC: &[u8; 4] = b"RNGV";
const VERSION: u32 = 1;

/// Size of the volume header
pub const HEADER_SIZE: u64 = 32;

/// Bytes reserved after the last block for the terminator
const TERMINATOR: u64 = 4;

#[derive(Debug, Serialize, Deserialize)]
struct Block {
    generation: u64,
    records: Vec<Record>,
}

/// Volume statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeStats {
    pub index: u32,
    pub path: PathBuf,
    pub capacity: u64,
    pub free_space: u64,
    pub generation: u64,
}

/// An open volume file
pub struct Volume {
    path: PathBuf,
    file: File,
    index: u32,
    generation: u64,
    capacity: u64,
    used: u64,
}

impl Volume {
    /// Allocate a new empty volume file
    pub fn create(path: impl AsRef<Path>, index: u32, capacity: u64) -> Result<Self> {
        if capacity < HEADER_SIZE + TERMINATOR + FRAME_HEADER as u64 {
            return Err(RingError::Config(format!(
                "volume capacity {} is too small",
                capacity
            )));
        }
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        file.set_len(capacity)?;

        let mut volume = Self {
            path,
            file,
            index,
            generation: 0,
            capacity,
            used: HEADER_SIZE,
        };
        volume.reset(0)?;
        Ok(volume)
    }

    /// Open an existing volume and scan its blocks.
    ///
    /// Returns the volume together with every readable record. A corrupt
    /// block ends the scan; the volume is then treated as filled up to it.
    pub fn open(path: impl AsRef<Path>) -> Result<(Self, Vec<Record>)> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;

        let mut header = [0u8; HEADER_SIZE as usize];
        file.read_exact(&mut header)?;
        if &header[..4] != MAGIC {
            return Err(RingError::Corruption(format!("{:?}: bad magic", path)));
        }
        let mut cursor = &header[4..];
        let version = cursor.get_u32_le();
        if version != VERSION {
            return Err(RingError::InvalidFormat(format!(
                "{:?}: unsupported version {}",
                path, version
            )));
        }
        let index = cursor.get_u32_le();
        let generation = cursor.get_u64_le();
        let capacity = cursor.get_u64_le();

        let mut volume = Self {
            path,
            file,
            index,
            generation,
            capacity,
            used: HEADER_SIZE,
        };
        let records = volume.scan()?;
        Ok((volume, records))
    }

    /// Read every block of the current generation
    pub fn scan(&mut self) -> Result<Vec<Record>> {
        let mut data = Vec::new();
        self.file.seek(SeekFrom::Start(HEADER_SIZE))?;
        (&mut self.file)
            .take(self.capacity.saturating_sub(HEADER_SIZE))
            .read_to_end(&mut data)?;

        let mut records = Vec::new();
        let mut offset = 0usize;
        while offset < data.len() {
            let (payload, consumed) = match decode_frame(&data[offset..]) {
                Ok(Decoded::Frame(payload, consumed)) => (payload, consumed),
                Ok(Decoded::End) => break,
                Ok(Decoded::Incomplete) => {
                    warn!("Torn block at offset {} in {:?}", offset, self.path);
                    break;
                }
                Err(e) => {
                    warn!("Corrupt block at offset {} in {:?}: {}", offset, self.path, e);
                    break;
                }
            };

            let block = match Self::decode_block(&payload) {
                Ok(block) => block,
                Err(e) => {
                    warn!("Undecodable block at offset {} in {:?}: {}", offset, self.path, e);
                    break;
                }
            };
            if block.generation != self.generation {
                break;
            }
            records.extend(block.records);
            offset += consumed;
        }

        self.used = HEADER_SIZE + offset as u64;
        Ok(records)
    }

    /// Append one block. Returns `false`, writing nothing, when the block
    /// does not fit in the remaining space.
    pub fn append(&mut self, records: &[Record]) -> Result<bool> {
        let block = Block {
            generation: self.generation,
            records: records.to_vec(),
        };
        let serialized = bincode::serialize(&block)?;
        let frame = encode_frame(&lz4_flex::compress_prepend_size(&serialized));

        if self.used + frame.len() as u64 + TERMINATOR > self.capacity {
            return Ok(false);
        }

        let mut buf = BytesMut::with_capacity(frame.len() + TERMINATOR as usize);
        buf.put_slice(&frame);
        buf.put_u32_le(0);

        self.file.seek(SeekFrom::Start(self.used))?;
        self.file.write_all(&buf)?;
        self.used += frame.len() as u64;
        Ok(true)
    }

    /// Forget all blocks and start a new generation
    pub fn reset(&mut self, generation: u64) -> Result<()> {
        self.generation = generation;

        let mut header = BytesMut::with_capacity(HEADER_SIZE as usize + TERMINATOR as usize);
        header.put_slice(MAGIC);
        header.put_u32_le(VERSION);
        header.put_u32_le(self.index);
        header.put_u64_le(self.generation);
        header.put_u64_le(self.capacity);
        header.resize(HEADER_SIZE as usize, 0);
        header.put_u32_le(0);

        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header)?;
        self.used = HEADER_SIZE;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.used == HEADER_SIZE
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn free_space(&self) -> u64 {
        self.capacity - self.used
    }

    pub fn stats(&self) -> VolumeStats {
        VolumeStats {
            index: self.index,
            path: self.path.clone(),
            capacity: self.capacity,
            free_space: self.free_space(),
            generation: self.generation,
        }
    }

    fn decode_block(payload: &[u8]) -> Result<Block> {
        let raw = lz4_flex::decompress_size_prepended(payload)
            .map_err(|e| RingError::Corruption(e.to_string()))?;
        Ok(bincode::deserialize(&raw)?)
    }
}
