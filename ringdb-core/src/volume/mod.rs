//! Fixed-size storage volumes reused as a ring
//!
//! Committed samples are written as compressed blocks into the active
//! volume. When it is full the ring advances; a volume that still holds
//! data when the ring reaches it again is recycled and its samples are
//! evicted. Recycling is the only form of retention.

mod file;
mod ring;

pub use file::{Volume, VolumeStats, HEADER_SIZE};
pub use ring::VolumeRing;

use std::path::{Path, PathBuf};

/// Path of the volume file with ring position `index`
pub fn volume_path(dir: &Path, index: usize) -> PathBuf {
    dir.join(format!("volume_{}.vol", index))
}
