//! Storage engine - top-level coordinator
//!
//! Write path (under one writer lock): sequence assignment, WAL append,
//! column insert, pending buffer, visibility watermark. The commit moves
//! the pending buffer into the volume ring and truncates the WAL.

use super::worker::CommitWorker;
use super::{MetadataLog, StorageConfig};
use crate::column::{ColumnStore, Cursor};
use crate::index::SeriesIndex;
use crate::volume::{VolumeRing, VolumeStats};
use crate::wal::{WalConfig, WalEntry, WalReader, WalRecord, WalWriter};
use crate::{Record, Result, RingError, Sample, Seq, SeriesId, SeriesKey, TimeRange, Timestamp};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// RingDB storage instance
pub struct Storage {
    config: StorageConfig,
    index: SeriesIndex,
    columns: ColumnStore,
    writer: Mutex<WriterState>,
    visible: AtomicU64,
    worker: Mutex<Option<CommitWorker>>,
}

struct WriterState {
    next_seq: Seq,
    wal: Option<WalWriter>,
    ring: VolumeRing,
    meta: MetadataLog,
    pending: Vec<Record>,
    pending_series: Vec<(SeriesId, SeriesKey)>,
    last_ts: HashMap<SeriesId, Timestamp>,
}

/// Storage statistics
#[derive(Debug, Clone)]
pub struct StorageStats {
    pub volumes: Vec<VolumeStats>,
    pub active_volume: usize,
    pub series: usize,
    pub samples_in_memory: usize,
    pub pending: usize,
}

impl Storage {
    /// Allocate a new database: volume files, metadata and WAL directory
    pub fn create(config: &StorageConfig) -> Result<()> {
        if config.metadata_path().exists() {
            return Err(RingError::Config(format!(
                "database already exists at {:?}",
                config.data_dir
            )));
        }
        std::fs::create_dir_all(&config.data_dir)?;

        VolumeRing::create(
            &config.data_dir,
            config.nvolumes,
            config.volume_size,
            config.block_samples,
        )?;
        if config.wal.enabled {
            std::fs::create_dir_all(config.wal_dir())?;
        }
        MetadataLog::open(config.metadata_path())?;

        info!("Created database at {:?}", config.data_dir);
        Ok(())
    }

    /// Remove a database and everything in its data directory
    pub fn delete(data_dir: &Path) -> Result<()> {
        if data_dir.exists() {
            std::fs::remove_dir_all(data_dir)?;
            info!("Deleted database at {:?}", data_dir);
        }
        Ok(())
    }

    /// Open an existing database. Recovery (metadata, volumes, WAL replay)
    /// completes before this returns.
    pub fn open(config: StorageConfig) -> Result<Arc<Self>> {
        let meta_path = config.metadata_path();
        if !meta_path.exists() {
            return Err(RingError::Config(format!(
                "no database at {:?}, create it first",
                config.data_dir
            )));
        }

        let index = SeriesIndex::new();
        for (id, key) in MetadataLog::load(&meta_path)? {
            index.restore(id, key);
        }

        let (ring, records) = VolumeRing::open(&config.data_dir, config.block_samples)?;

        let columns = ColumnStore::new();
        let mut last_ts: HashMap<SeriesId, Timestamp> = HashMap::new();
        let mut committed: Seq = 0;
        let mut orphans = 0usize;
        for record in &records {
            if index.key(record.series).is_none() {
                orphans += 1;
            }
            columns.insert(record, config.duplicates);
            note_timestamp(&mut last_ts, record);
            committed = committed.max(record.seq);
        }
        if orphans > 0 {
            warn!("{} committed samples belong to unknown series", orphans);
        }

        let mut next_seq = committed + 1;
        let mut pending = Vec::new();
        let mut pending_series = Vec::new();

        let wal = if config.wal.enabled {
            let wal_config = WalConfig {
                dir: config.wal_dir(),
                ..config.wal.clone()
            };
            for entry in WalReader::new(wal_config.clone()).recover()? {
                match entry.decode() {
                    Ok(WalRecord::Series { id, key }) => {
                        if index.key(id).is_none() {
                            index.restore(id, key.clone());
                            pending_series.push((id, key));
                        }
                    }
                    Ok(WalRecord::Samples(batch)) => {
                        for record in batch {
                            next_seq = next_seq.max(record.seq + 1);
                            if record.seq <= committed {
                                continue;
                            }
                            columns.insert(&record, config.duplicates);
                            note_timestamp(&mut last_ts, &record);
                            pending.push(record);
                        }
                    }
                    Err(e) => warn!("Skipping undecodable WAL entry: {}", e),
                }
            }
            Some(WalWriter::new(wal_config)?)
        } else {
            None
        };

        info!(
            "Recovered {} series, {} committed and {} replayed samples",
            index.len(),
            records.len(),
            pending.len()
        );

        let commit_interval = config.commit.interval;
        let storage = Arc::new(Self {
            config,
            index,
            columns,
            writer: Mutex::new(WriterState {
                next_seq,
                wal,
                ring,
                meta: MetadataLog::open(&meta_path)?,
                pending,
                pending_series,
                last_ts,
            }),
            visible: AtomicU64::new(next_seq - 1),
            worker: Mutex::new(None),
        });

        let worker = CommitWorker::spawn(Arc::downgrade(&storage), commit_interval)?;
        *storage.worker.lock() = Some(worker);

        Ok(storage)
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn index(&self) -> &SeriesIndex {
        &self.index
    }

    /// Id for `key`, creating and logging the series on first use
    pub fn series_id(&self, key: &SeriesKey) -> Result<SeriesId> {
        if let Some(id) = self.index.get(&key.canonical()) {
            return Ok(id);
        }

        let mut guard = self.writer.lock();
        let (id, created) = self.index.create(key);
        if created {
            // the index already hands out `id`, so it must reach the metadata log
            guard.pending_series.push((id, key.clone()));
            debug!("New series {} = {}", id, key);
            if let Some(wal) = &guard.wal {
                wal.append(&WalEntry::series(id, key)?)?;
            }
        }
        Ok(id)
    }

    /// Write one frame's samples atomically.
    ///
    /// The whole frame is rejected with `LateWrite` if any sample is older
    /// than its series' newest timestamp minus the late-write window.
    pub fn write(&self, samples: &[Sample]) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }

        let mut guard = self.writer.lock();
        let w = &mut *guard;

        for sample in samples {
            if let Some(last) = w.last_ts.get(&sample.series) {
                if sample.timestamp < last.saturating_sub(self.config.window) {
                    return Err(RingError::LateWrite);
                }
            }
        }

        let records: Vec<Record> = samples
            .iter()
            .map(|s| {
                let seq = w.next_seq;
                w.next_seq += 1;
                Record {
                    seq,
                    series: s.series,
                    timestamp: s.timestamp,
                    value: s.value.clone(),
                }
            })
            .collect();

        if let Some(wal) = &w.wal {
            wal.append(&WalEntry::samples(&records)?)?;
        }

        for record in &records {
            self.columns.insert(record, self.config.duplicates);
            note_timestamp(&mut w.last_ts, record);
        }
        let last_seq = w.next_seq - 1;
        w.pending.extend(records);
        self.visible.store(last_seq, Ordering::Release);

        let nudge = w.pending.len() >= self.config.commit.max_pending;
        drop(guard);
        if nudge {
            if let Some(worker) = self.worker.lock().as_ref() {
                worker.nudge();
            }
        }
        Ok(())
    }

    /// Move pending samples into the volumes. Returns the number committed.
    pub fn commit(&self) -> Result<usize> {
        let mut guard = self.writer.lock();
        let w = &mut *guard;
        if w.pending.is_empty() && w.pending_series.is_empty() {
            return Ok(0);
        }

        w.meta.append(&w.pending_series)?;
        w.pending_series.clear();

        let evicted = w.ring.write(&w.pending)?;
        if !evicted.is_empty() {
            self.columns.evict(&evicted);
            info!("Evicted {} samples from recycled volume", evicted.len());
        }

        let committed = w.pending.len();
        w.pending.clear();

        if let Some(wal) = &w.wal {
            let segment = wal.rotate()?;
            wal.truncate_before(segment)?;
        }

        debug!("Committed {} samples", committed);
        Ok(committed)
    }

    /// Force a commit
    pub fn flush(&self) -> Result<()> {
        self.commit().map(|_| ())
    }

    /// Stop the commit worker and commit what is pending
    pub fn shutdown(&self) -> Result<()> {
        if let Some(mut worker) = self.worker.lock().take() {
            worker.stop();
        }
        self.flush()
    }

    /// Highest sequence number visible to new readers
    pub fn snapshot(&self) -> Seq {
        self.visible.load(Ordering::Acquire)
    }

    /// Time-ordered cursor over one series as of `snapshot`
    pub fn cursor(&self, series: SeriesId, range: TimeRange, snapshot: Seq) -> Option<Cursor> {
        self.columns.cursor(series, range, snapshot)
    }

    pub fn volume_stats(&self) -> Vec<VolumeStats> {
        self.writer.lock().ring.stats()
    }

    pub fn stats(&self) -> StorageStats {
        let w = self.writer.lock();
        StorageStats {
            volumes: w.ring.stats(),
            active_volume: w.ring.active(),
            series: self.index.len(),
            samples_in_memory: self.columns.total_samples(),
            pending: w.pending.len(),
        }
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        if let Some(mut worker) = self.worker.get_mut().take() {
            worker.stop();
        }
        if let Err(e) = self.commit() {
            error!("Final commit failed: {}", e);
        }
    }
}

fn note_timestamp(last_ts: &mut HashMap<SeriesId, Timestamp>, record: &Record) {
    let entry = last_ts.entry(record.series).or_insert(record.timestamp);
    if record.timestamp > *entry {
        *entry = record.timestamp;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::TagFilter;
    use crate::{Direction, Value};
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> StorageConfig {
        StorageConfig {
            data_dir: dir.path().join("db"),
            ..StorageConfig::test_defaults()
        }
    }

    fn fresh(dir: &TempDir) -> Arc<Storage> {
        let config = config(dir);
        Storage::create(&config).unwrap();
        Storage::open(config).unwrap()
    }

    fn fill(storage: &Storage, name: &str, range: std::ops::Range<i64>) -> SeriesId {
        let id = storage.series_id(&SeriesKey::parse(name).unwrap()).unwrap();
        for i in range {
            storage
                .write(&[Sample::new(id, i * 1_000, i as f64)])
                .unwrap();
        }
        id
    }

    fn scan(storage: &Storage, id: SeriesId, range: TimeRange) -> Vec<(Timestamp, Value)> {
        storage
            .cursor(id, range, storage.snapshot())
            .map(|c| c.collect())
            .unwrap_or_default()
    }

    /// Drop a handle without the final commit, like a killed process
    fn crash(storage: Arc<Storage>) {
        if let Some(mut worker) = storage.worker.lock().take() {
            worker.stop();
        }
        std::mem::forget(storage);
    }

    #[test]
    fn test_create_twice_fails() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        Storage::create(&config).unwrap();
        assert!(matches!(Storage::create(&config), Err(RingError::Config(_))));
    }

    #[test]
    fn test_open_missing_database() {
        let dir = TempDir::new().unwrap();
        assert!(Storage::open(config(&dir)).is_err());
    }

    #[test]
    fn test_write_commit_reopen() {
        let dir = TempDir::new().unwrap();
        let id = {
            let storage = fresh(&dir);
            let id = fill(&storage, "cpu host=A", 0..1000);
            assert_eq!(storage.commit().unwrap(), 1000);
            assert_eq!(storage.commit().unwrap(), 0);
            id
        };

        let storage = Storage::open(config(&dir)).unwrap();
        assert_eq!(storage.index().get("cpu host=A"), Some(id));
        let fwd = scan(&storage, id, TimeRange::new(0, 1_000_000));
        assert_eq!(fwd.len(), 1000);
        assert_eq!(fwd[0], (0, Value::Float(0.0)));
        let bwd = scan(&storage, id, TimeRange::new(999_000, -1));
        assert_eq!(bwd.len(), 1000);
        assert_eq!(bwd[0].0, 999_000);
    }

    #[test]
    fn test_wal_replay_after_crash() {
        let dir = TempDir::new().unwrap();
        let storage = fresh(&dir);
        let id = fill(&storage, "cpu host=A", 0..500);
        crash(storage);

        let storage = Storage::open(config(&dir)).unwrap();
        assert_eq!(storage.index().get("cpu host=A"), Some(id));
        assert_eq!(scan(&storage, id, TimeRange::new(0, i64::MAX)).len(), 500);
        assert_eq!(storage.stats().pending, 500);

        // sequence numbers continue after the replayed ones
        fill(&storage, "cpu host=A", 500..510);
        assert_eq!(storage.commit().unwrap(), 510);
    }

    #[test]
    fn test_replay_skips_committed_samples() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir);
        let storage = fresh(&dir);
        let id = fill(&storage, "cpu host=A", 0..100);

        // keep a copy of the WAL as it was before the commit truncated it
        let saved: Vec<(std::path::PathBuf, Vec<u8>)> = std::fs::read_dir(cfg.wal_dir())
            .unwrap()
            .map(|e| {
                let path = e.unwrap().path();
                let data = std::fs::read(&path).unwrap();
                (path, data)
            })
            .collect();
        storage.commit().unwrap();
        crash(storage);
        for (path, data) in saved {
            std::fs::write(path, data).unwrap();
        }

        let storage = Storage::open(cfg).unwrap();
        assert_eq!(scan(&storage, id, TimeRange::new(0, i64::MAX)).len(), 100);
        assert_eq!(storage.stats().pending, 0);
    }

    #[test]
    fn test_no_wal_loses_uncommitted_state() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir);
        cfg.wal.enabled = false;
        Storage::create(&cfg).unwrap();
        let storage = Storage::open(cfg.clone()).unwrap();
        fill(&storage, "cpu host=A", 0..100);
        crash(storage);

        let storage = Storage::open(cfg).unwrap();
        assert!(matches!(
            storage.index().resolve("cpu", &TagFilter::new()),
            Err(RingError::NotFound(_))
        ));
    }

    #[test]
    fn test_series_survives_failed_wal_append() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir);
        cfg.wal.segment_size = 1;
        Storage::create(&cfg).unwrap();
        let storage = Storage::open(cfg.clone()).unwrap();
        storage.series_id(&SeriesKey::parse("cpu host=A").unwrap()).unwrap();

        // every append now rolls over into a directory that is gone
        std::fs::remove_dir_all(cfg.wal_dir()).unwrap();
        let key = SeriesKey::parse("cpu host=B").unwrap();
        assert!(storage.series_id(&key).is_err());
        let id = storage.series_id(&key).unwrap();

        std::fs::create_dir_all(cfg.wal_dir()).unwrap();
        storage.write(&[Sample::new(id, 1_000, 1.0)]).unwrap();
        storage.commit().unwrap();
        drop(storage);

        let storage = Storage::open(cfg).unwrap();
        assert_eq!(storage.index().get("cpu host=B"), Some(id));
        assert_eq!(scan(&storage, id, TimeRange::new(0, i64::MAX)).len(), 1);
    }

    #[test]
    fn test_late_write_is_rejected_and_invisible() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir);
        cfg.window = 5_000;
        Storage::create(&cfg).unwrap();
        let storage = Storage::open(cfg).unwrap();

        let id = fill(&storage, "cpu host=A", 10..20);
        assert!(matches!(
            storage.write(&[Sample::new(id, 1_000, 42.0)]),
            Err(RingError::LateWrite)
        ));
        // within the window is fine
        storage.write(&[Sample::new(id, 15_000, 7.0)]).unwrap();

        let values: Vec<f64> = scan(&storage, id, TimeRange::new(0, i64::MAX))
            .into_iter()
            .filter_map(|(_, v)| v.as_f64())
            .collect();
        assert!(!values.contains(&42.0));
        assert_eq!(values.len(), 11);
    }

    #[test]
    fn test_recycling_keeps_contiguous_suffix() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir);
        cfg.volume_size = 8 * 1024;
        cfg.block_samples = 64;
        Storage::create(&cfg).unwrap();

        // random values compress poorly
        let mut rng = StdRng::seed_from_u64(7);
        let values: Vec<f64> = (0..10_000).map(|_| rng.gen()).collect();

        let id = {
            let storage = Storage::open(cfg.clone()).unwrap();
            let key = SeriesKey::parse("noise host=A").unwrap();
            let id = storage.series_id(&key).unwrap();
            for chunk in 0..100i64 {
                for i in chunk * 100..(chunk + 1) * 100 {
                    storage.write(&[Sample::new(id, i, values[i as usize])]).unwrap();
                }
                storage.commit().unwrap();
            }

            let live = scan(&storage, id, TimeRange::new(i64::MAX, i64::MIN));
            assert!(live.len() < 10_000);
            assert_eq!(live[0].0, 9_999);
            let first_live = live.last().map(|(ts, _)| *ts).unwrap();
            assert_eq!(live.len() as i64, 10_000 - first_live);
            id
        };

        let storage = Storage::open(cfg).unwrap();
        let recovered = scan(&storage, id, TimeRange::new(i64::MAX, i64::MIN));
        let first = recovered.last().map(|(ts, _)| *ts).unwrap();
        assert_eq!(recovered.len() as i64, 10_000 - first);
        for (ts, value) in &recovered {
            assert_eq!(value.as_f64(), Some(values[*ts as usize]));
        }
        assert!(storage.volume_stats().iter().any(|s| s.generation > 4));
    }

    #[test]
    fn test_snapshot_isolation() {
        let dir = TempDir::new().unwrap();
        let storage = fresh(&dir);
        let id = fill(&storage, "cpu host=A", 0..10);
        let snapshot = storage.snapshot();
        fill(&storage, "cpu host=A", 10..20);

        let cursor = storage
            .cursor(id, TimeRange::new(0, i64::MAX), snapshot)
            .unwrap();
        assert_eq!(cursor.count(), 10);
        assert_eq!(TimeRange::new(5, 1).direction(), Direction::Backward);
    }

    #[test]
    fn test_delete() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir);
        Storage::create(&cfg).unwrap();
        Storage::delete(&cfg.data_dir).unwrap();
        assert!(!cfg.data_dir.exists());
    }
}
