//! Ring of volumes reused in circular order

use super::{volume_path, Volume, VolumeStats};
use crate::{Record, Result, RingError};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// The set of volumes owned by one storage instance
pub struct VolumeRing {
    dir: PathBuf,
    volumes: Vec<Volume>,
    active: usize,
    block_samples: usize,
}

impl VolumeRing {
    /// Allocate `count` empty volumes of `capacity` bytes in `dir`
    pub fn create(dir: &Path, count: usize, capacity: u64, block_samples: usize) -> Result<Self> {
        if count == 0 {
            return Err(RingError::Config("at least one volume is required".into()));
        }
        fs::create_dir_all(dir)?;

        let mut volumes = Vec::with_capacity(count);
        for i in 0..count {
            volumes.push(Volume::create(volume_path(dir, i), i as u32, capacity)?);
        }
        volumes[0].reset(1)?;
        for volume in &volumes {
            volume.sync()?;
        }

        info!("Created {} volumes of {} bytes in {:?}", count, capacity, dir);
        Ok(Self {
            dir: dir.to_path_buf(),
            volumes,
            active: 0,
            block_samples: block_samples.max(1),
        })
    }

    /// Open every volume in `dir` and collect their records, oldest
    /// generation first. Unreadable volumes are logged and reinitialised;
    /// if none can be read the open fails.
    pub fn open(dir: &Path, block_samples: usize) -> Result<(Self, Vec<Record>)> {
        let mut paths = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if let Some(index) = parse_volume_name(&path) {
                paths.push((index, path));
            }
        }
        paths.sort_by_key(|(index, _)| *index);
        if paths.is_empty() {
            return Err(RingError::Recovery(format!("no volumes in {:?}", dir)));
        }

        let mut opened: Vec<Option<(Volume, Vec<Record>)>> = Vec::with_capacity(paths.len());
        for (_, path) in &paths {
            match Volume::open(path) {
                Ok(volume) => opened.push(Some(volume)),
                Err(e) => {
                    warn!("Volume {:?} is unreadable: {}", path, e);
                    opened.push(None);
                }
            }
        }

        let capacity = opened
            .iter()
            .flatten()
            .map(|(volume, _)| volume.stats().capacity)
            .next()
            .ok_or_else(|| RingError::Recovery("all volumes are unreadable".into()))?;

        let mut volumes = Vec::with_capacity(opened.len());
        let mut by_generation = Vec::new();
        for (slot, entry) in opened.into_iter().enumerate() {
            match entry {
                Some((volume, records)) => {
                    by_generation.push((volume.generation(), records));
                    volumes.push(volume);
                }
                None => {
                    let (index, path) = &paths[slot];
                    fs::remove_file(path)?;
                    volumes.push(Volume::create(path, *index as u32, capacity)?);
                }
            }
        }

        let active = volumes
            .iter()
            .enumerate()
            .max_by_key(|(_, volume)| volume.generation())
            .map(|(i, _)| i)
            .unwrap_or(0);
        if volumes[active].generation() == 0 {
            volumes[active].reset(1)?;
        }

        by_generation.sort_by_key(|(generation, _)| *generation);
        let records: Vec<Record> = by_generation
            .into_iter()
            .flat_map(|(_, records)| records)
            .collect();

        info!(
            "Opened {} volumes, active volume {}, {} committed samples",
            volumes.len(),
            active,
            records.len()
        );

        Ok((
            Self {
                dir: dir.to_path_buf(),
                volumes,
                active,
                block_samples: block_samples.max(1),
            },
            records,
        ))
    }

    /// Persist records, advancing through the ring as volumes fill up.
    ///
    /// Returns the records of every volume recycled along the way; they are
    /// no longer readable from disk and must be dropped from memory.
    pub fn write(&mut self, records: &[Record]) -> Result<Vec<Record>> {
        let mut evicted = Vec::new();
        let mut touched = BTreeSet::new();
        let mut pending: Vec<&[Record]> = records.chunks(self.block_samples).rev().collect();

        while let Some(chunk) = pending.pop() {
            if self.volumes[self.active].append(chunk)? {
                touched.insert(self.active);
                continue;
            }
            if chunk.len() > 1 {
                let (head, tail) = chunk.split_at(chunk.len() / 2);
                pending.push(tail);
                pending.push(head);
                continue;
            }
            if self.volumes[self.active].is_empty() {
                return Err(RingError::Config(
                    "sample does not fit in an empty volume".into(),
                ));
            }
            evicted.extend(self.advance()?);
            touched.insert(self.active);
            pending.push(chunk);
        }

        for index in touched {
            self.volumes[index].sync()?;
        }
        Ok(evicted)
    }

    /// Move to the next volume, recycling it if it holds data
    fn advance(&mut self) -> Result<Vec<Record>> {
        let next = (self.active + 1) % self.volumes.len();
        let generation = self
            .volumes
            .iter()
            .map(|v| v.generation())
            .max()
            .unwrap_or(0)
            + 1;

        let volume = &mut self.volumes[next];
        let evicted = if volume.is_empty() {
            Vec::new()
        } else {
            let old = volume.scan()?;
            info!(
                "Recycling volume {} (generation {}, {} samples)",
                next,
                volume.generation(),
                old.len()
            );
            old
        };
        volume.reset(generation)?;
        self.active = next;
        Ok(evicted)
    }

    pub fn active(&self) -> usize {
        self.active
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn stats(&self) -> Vec<VolumeStats> {
        self.volumes.iter().map(|v| v.stats()).collect()
    }
}

fn parse_volume_name(path: &Path) -> Option<usize> {
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.strip_prefix("volume_"))
        .and_then(|n| n.strip_suffix(".vol"))
        .and_then(|n| n.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Value;
    use tempfile::TempDir;

    fn records(range: std::ops::Range<u64>) -> Vec<Record> {
        range
            .map(|i| Record {
                seq: i,
                series: 1 + i % 3,
                timestamp: i as i64 * 1_000,
                value: Value::Float(i as f64),
            })
            .collect()
    }

    #[test]
    fn test_create_and_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let mut ring = VolumeRing::create(dir.path(), 3, 64 * 1024, 100).unwrap();
            assert!(ring.write(&records(1..501)).unwrap().is_empty());
        }
        let (ring, recovered) = VolumeRing::open(dir.path(), 100).unwrap();
        assert_eq!(recovered, records(1..501));
        assert_eq!(ring.stats().len(), 3);
        assert_eq!(ring.active(), 0);
    }

    #[test]
    fn test_recycle_keeps_contiguous_tail() {
        let dir = TempDir::new().unwrap();
        let mut ring = VolumeRing::create(dir.path(), 3, 4 * 1024, 50).unwrap();

        let mut evicted = Vec::new();
        let mut next = 1u64;
        while evicted.is_empty() {
            evicted = ring.write(&records(next..next + 50)).unwrap();
            next += 50;
        }
        assert_eq!(evicted.first().map(|r| r.seq), Some(1));

        drop(ring);
        let (ring, recovered) = VolumeRing::open(dir.path(), 50).unwrap();
        let seqs: Vec<u64> = recovered.iter().map(|r| r.seq).collect();

        // a missing prefix followed by an intact run up to the last write
        let first = seqs[0];
        assert!(first > 1);
        assert_eq!(seqs, (first..next).collect::<Vec<_>>());
        assert!(evicted.iter().all(|r| r.seq < first));

        let generations: Vec<u64> = ring.stats().iter().map(|s| s.generation).collect();
        assert_eq!(generations.iter().max(), Some(&4));
    }

    #[test]
    fn test_unreadable_volume_is_reinitialised() {
        let dir = TempDir::new().unwrap();
        {
            let mut ring = VolumeRing::create(dir.path(), 2, 16 * 1024, 10).unwrap();
            ring.write(&records(1..21)).unwrap();
        }
        fs::write(volume_path(dir.path(), 1), b"garbage").unwrap();

        let (ring, recovered) = VolumeRing::open(dir.path(), 10).unwrap();
        assert_eq!(recovered.len(), 20);
        assert_eq!(ring.stats()[1].free_space, 16 * 1024 - super::super::HEADER_SIZE);
    }

    #[test]
    fn test_reinitialised_volume_keeps_file_index() {
        let dir = TempDir::new().unwrap();
        {
            let mut ring = VolumeRing::create(dir.path(), 3, 16 * 1024, 10).unwrap();
            ring.write(&records(1..21)).unwrap();
        }
        fs::remove_file(volume_path(dir.path(), 0)).unwrap();
        fs::write(volume_path(dir.path(), 2), b"garbage").unwrap();

        let (ring, _) = VolumeRing::open(dir.path(), 10).unwrap();
        let stats = ring.stats();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[1].index, 2);
        assert_eq!(stats[1].path, volume_path(dir.path(), 2));

        drop(ring);
        let (volume, records) = Volume::open(volume_path(dir.path(), 2)).unwrap();
        assert_eq!(volume.index(), 2);
        assert!(records.is_empty());
    }

    #[test]
    fn test_all_volumes_unreadable() {
        let dir = TempDir::new().unwrap();
        VolumeRing::create(dir.path(), 2, 16 * 1024, 10).unwrap();
        for i in 0..2 {
            fs::write(volume_path(dir.path(), i), b"garbage").unwrap();
        }
        assert!(matches!(
            VolumeRing::open(dir.path(), 10),
            Err(RingError::Recovery(_))
        ));
    }
}
