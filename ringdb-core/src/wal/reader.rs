//! Replay side of the input log

use super::{list_segments, WalConfig, WalEntry};
use crate::{Result, RingError};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

/// Reads back whatever the log holds after a restart
pub struct WalReader {
    config: WalConfig,
}

impl WalReader {
    pub fn new(config: WalConfig) -> Self {
        Self { config }
    }

    /// Every intact entry, oldest segment first. A segment that cannot be
    /// read is skipped; a damaged entry ends its segment.
    pub fn recover(&self) -> Result<Vec<WalEntry>> {
        let mut entries = Vec::new();
        for (id, path) in list_segments(&self.config.dir)? {
            let before = entries.len();
            if let Err(e) = Self::replay_segment(&path, &mut entries) {
                warn!("Skipping input log segment {}: {}", id, e);
                continue;
            }
            if entries.len() > before {
                info!("Segment {}: {} entries recovered", id, entries.len() - before);
            }
        }
        Ok(entries)
    }

    fn replay_segment(path: &Path, out: &mut Vec<WalEntry>) -> Result<()> {
        let data = fs::read(path)?;
        let mut rest = &data[..];
        while !rest.is_empty() {
            match WalEntry::deserialize_with_checksum(rest) {
                Ok((entry, used)) => {
                    out.push(entry);
                    rest = &rest[used..];
                }
                // torn write at the tail
                Err(RingError::InvalidFormat(_)) => break,
                Err(e @ (RingError::ChecksumMismatch { .. } | RingError::Corruption(_))) => {
                    warn!(
                        "Damaged entry at offset {} of {:?} ({}), dropping the rest",
                        data.len() - rest.len(),
                        path,
                        e
                    );
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::{WalRecord, WalWriter};
    use crate::{Record, SeriesKey, Value};
    use std::io::Write;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> WalConfig {
        WalConfig {
            dir: dir.path().to_path_buf(),
            ..Default::default()
        }
    }

    #[test]
    fn test_wal_recovery() {
        let temp_dir = TempDir::new().unwrap();
        let config = config(&temp_dir);
        {
            let writer = WalWriter::new(config.clone()).unwrap();
            let key = SeriesKey::parse("temp id=1").unwrap();
            writer.append(&WalEntry::series(1, &key).unwrap()).unwrap();
            for i in 0..10u64 {
                let record = Record {
                    seq: i + 1,
                    series: 1,
                    timestamp: i as i64 * 1000,
                    value: Value::Float(23.5 + i as f64),
                };
                writer.append(&WalEntry::samples(&[record]).unwrap()).unwrap();
            }
            writer.sync().unwrap();
        }

        let reader = WalReader::new(config);
        let entries = reader.recover().unwrap();
        assert_eq!(entries.len(), 11);
        assert!(matches!(
            entries[0].decode().unwrap(),
            WalRecord::Series { id: 1, .. }
        ));
    }

    #[test]
    fn test_torn_tail_is_ignored() {
        let temp_dir = TempDir::new().unwrap();
        let config = config(&temp_dir);
        {
            let writer = WalWriter::new(config.clone()).unwrap();
            let key = SeriesKey::parse("temp id=1").unwrap();
            writer.append(&WalEntry::series(1, &key).unwrap()).unwrap();
        }

        let path = temp_dir.path().join(crate::wal::segment_name(0));
        let partial = WalEntry::series(2, &SeriesKey::parse("temp id=2").unwrap())
            .unwrap()
            .serialize_with_checksum();
        let mut file = fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&partial[..partial.len() / 2]).unwrap();

        let entries = WalReader::new(config).recover().unwrap();
        assert_eq!(entries.len(), 1);
    }
}
