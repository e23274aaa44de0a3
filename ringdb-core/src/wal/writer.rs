//! Appending side of the input log

use super::{list_segments, segment_name, SyncPolicy, WalConfig, WalEntry};
use crate::Result;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info};

/// The segment currently being appended to
struct Segment {
    id: u64,
    out: BufWriter<File>,
    len: usize,
    unsynced: usize,
    synced_at: Instant,
}

impl Segment {
    fn create(dir: &Path, id: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(segment_name(id)))?;
        Ok(Self {
            id,
            out: BufWriter::new(file),
            len: 0,
            unsynced: 0,
            synced_at: Instant::now(),
        })
    }

    fn due(&self, policy: SyncPolicy) -> bool {
        match policy {
            SyncPolicy::Immediate => true,
            SyncPolicy::EveryN(n) => self.unsynced >= n,
            SyncPolicy::Interval { millis } => {
                self.synced_at.elapsed().as_millis() >= u128::from(millis)
            }
            SyncPolicy::None => false,
        }
    }

    fn sync(&mut self) -> Result<()> {
        self.out.flush()?;
        self.out.get_ref().sync_data()?;
        self.unsynced = 0;
        self.synced_at = Instant::now();
        Ok(())
    }
}

/// Appends framed entries to numbered segment files
pub struct WalWriter {
    config: WalConfig,
    segment: Mutex<Segment>,
}

impl WalWriter {
    /// Open the log. Writing continues in a new segment after the newest
    /// one on disk; older segments stay for replay until the next commit.
    pub fn new(config: WalConfig) -> Result<Self> {
        fs::create_dir_all(&config.dir)?;
        let next = list_segments(&config.dir)?
            .last()
            .map_or(0, |(id, _)| id + 1);
        let segment = Segment::create(&config.dir, next)?;
        Ok(Self {
            config,
            segment: Mutex::new(segment),
        })
    }

    /// Append one entry, rolling over to a new segment when full
    pub fn append(&self, entry: &WalEntry) -> Result<()> {
        let frame = entry.serialize_with_checksum();
        let mut segment = self.segment.lock();

        if segment.len > 0 && segment.len + frame.len() > self.config.segment_size {
            self.roll(&mut segment)?;
        }

        segment.out.write_all(&frame)?;
        segment.len += frame.len();
        segment.unsynced += 1;

        if segment.due(self.config.sync_policy) {
            segment.sync()?;
        } else if self.config.sync_policy != SyncPolicy::None {
            segment.out.flush()?;
        }
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.segment.lock().sync()
    }

    pub fn current_segment(&self) -> u64 {
        self.segment.lock().id
    }

    /// Close the current segment and start a new one; returns the new id
    pub fn rotate(&self) -> Result<u64> {
        let mut segment = self.segment.lock();
        self.roll(&mut segment)?;
        Ok(segment.id)
    }

    /// Remove every segment older than `segment_id`
    pub fn truncate_before(&self, segment_id: u64) -> Result<usize> {
        let stale: Vec<_> = list_segments(&self.config.dir)?
            .into_iter()
            .take_while(|(id, _)| *id < segment_id)
            .collect();
        for (_, path) in &stale {
            fs::remove_file(path)?;
        }
        if !stale.is_empty() {
            debug!("Removed {} input log segments before {}", stale.len(), segment_id);
        }
        Ok(stale.len())
    }

    fn roll(&self, segment: &mut Segment) -> Result<()> {
        segment.sync()?;
        *segment = Segment::create(&self.config.dir, segment.id + 1)?;
        info!("Input log rolled over to segment {}", segment.id);
        Ok(())
    }
}
