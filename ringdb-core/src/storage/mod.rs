//! Storage engine - coordinates index, WAL, column store and volumes

mod engine;
mod metadata;
mod worker;

pub use engine::{Storage, StorageStats};
pub use metadata::MetadataLog;

use crate::wal::WalConfig;
use crate::DuplicatePolicy;
use std::path::PathBuf;
use std::time::Duration;

/// Background commit triggers
#[derive(Debug, Clone)]
pub struct CommitConfig {
    /// Commit at least this often
    pub interval: Duration,
    /// Commit early once this many samples are pending
    pub max_pending: usize,
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(crate::config::COMMIT_INTERVAL_MS),
            max_pending: crate::config::COMMIT_MAX_PENDING,
        }
    }
}

/// Storage engine configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Data directory holding volumes, metadata and the WAL
    pub data_dir: PathBuf,
    /// Number of volumes in the ring
    pub nvolumes: usize,
    /// Size of each volume file in bytes
    pub volume_size: u64,
    /// Late-write window in nanoseconds
    pub window: i64,
    /// Handling of equal timestamps within a series
    pub duplicates: DuplicatePolicy,
    /// Maximum samples per volume block
    pub block_samples: usize,
    /// WAL configuration; `dir` is derived from `data_dir`
    pub wal: WalConfig,
    /// Commit scheduling
    pub commit: CommitConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            nvolumes: crate::config::NVOLUMES,
            volume_size: crate::config::VOLUME_SIZE,
            window: crate::config::LATE_WRITE_WINDOW,
            duplicates: DuplicatePolicy::default(),
            block_samples: crate::config::BLOCK_SAMPLES,
            wal: WalConfig::default(),
            commit: CommitConfig::default(),
        }
    }
}

impl StorageConfig {
    /// Small volumes and a slow commit interval, for tests and `--create-test`
    pub fn test_defaults() -> Self {
        Self {
            nvolumes: 4,
            volume_size: 256 * 1024,
            block_samples: 256,
            commit: CommitConfig {
                interval: Duration::from_secs(3600),
                max_pending: usize::MAX,
            },
            ..Default::default()
        }
    }

    pub fn wal_dir(&self) -> PathBuf {
        self.data_dir.join("wal")
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.data_dir.join("series.meta")
    }
}
