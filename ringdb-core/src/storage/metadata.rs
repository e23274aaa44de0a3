//! Persistent series definitions (`series.meta`)

use crate::codec::{decode_frame, encode_frame, Decoded};
use crate::{Result, SeriesId, SeriesKey};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Append-only log of `(id, canonical name)` records
pub struct MetadataLog {
    path: PathBuf,
    file: BufWriter<File>,
}

impl MetadataLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: BufWriter::new(file),
        })
    }

    /// Append definitions and sync them
    pub fn append(&mut self, series: &[(SeriesId, SeriesKey)]) -> Result<()> {
        if series.is_empty() {
            return Ok(());
        }
        for (id, key) in series {
            let payload = bincode::serialize(&(*id, key.canonical()))?;
            self.file.write_all(&encode_frame(&payload))?;
        }
        self.file.flush()?;
        self.file.get_ref().sync_data()?;
        Ok(())
    }

    /// Read every intact record; a corrupt or torn record ends the read
    pub fn load(path: impl AsRef<Path>) -> Result<Vec<(SeriesId, SeriesKey)>> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let data = fs::read(path)?;

        let mut out = Vec::new();
        let mut offset = 0;
        while offset < data.len() {
            match decode_frame(&data[offset..]) {
                Ok(Decoded::Frame(payload, consumed)) => {
                    let (id, name): (SeriesId, String) = bincode::deserialize(&payload)?;
                    out.push((id, SeriesKey::parse(&name)?));
                    offset += consumed;
                }
                Ok(Decoded::End) | Ok(Decoded::Incomplete) => break,
                Err(e) => {
                    warn!("Corrupt series metadata at offset {} in {:?}: {}", offset, path, e);
                    break;
                }
            }
        }
        Ok(out)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_append_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("series.meta");
        {
            let mut log = MetadataLog::open(&path).unwrap();
            log.append(&[(1, SeriesKey::parse("cpu host=A").unwrap())])
                .unwrap();
            log.append(&[
                (2, SeriesKey::parse("cpu host=B").unwrap()),
                (3, SeriesKey::parse("!alert sev=1").unwrap()),
            ])
            .unwrap();
        }
        let loaded = MetadataLog::load(&path).unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded[2].0, 3);
        assert_eq!(loaded[2].1.canonical(), "!alert sev=1");
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        assert!(MetadataLog::load(dir.path().join("nope")).unwrap().is_empty());
    }
}
