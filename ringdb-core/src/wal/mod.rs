//! Write-Ahead Log (input log)
//!
//! Every accepted sample and every newly created series is appended here
//! before it becomes visible. After a commit moves pending samples into
//! the volumes, the log is rotated and older segments are removed. On
//! startup the remaining segments are replayed.

mod entry;
mod reader;
mod writer;

pub use entry::{WalEntry, WalEntryType, WalRecord};
pub use reader::WalReader;
pub use writer::WalWriter;

use crate::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Segment file name for a segment id
pub(crate) fn segment_name(id: u64) -> String {
    format!("wal_{:020}.ils", id)
}

/// Segment id encoded in a file name, if it is a segment
pub(crate) fn parse_segment_name(name: &str) -> Option<u64> {
    name.strip_prefix("wal_")
        .and_then(|s| s.strip_suffix(".ils"))
        .and_then(|s| s.parse().ok())
}

/// Segments found in `dir`, ordered by id. A missing directory has none.
pub(crate) fn list_segments(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut found = Vec::new();
    for item in fs::read_dir(dir)? {
        let path = item?.path();
        let id = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(parse_segment_name);
        if let Some(id) = id {
            found.push((id, path));
        }
    }
    found.sort_unstable_by_key(|(id, _)| *id);
    Ok(found)
}

/// WAL sync policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncPolicy {
    /// Sync after every write (safest, slowest)
    Immediate,
    /// Sync after N writes
    EveryN(usize),
    /// Sync on interval (trades durability for performance)
    Interval { millis: u64 },
    /// Never sync (OS decides, fastest, least safe)
    None,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        SyncPolicy::Immediate
    }
}

impl SyncPolicy {
    /// Parse `immediate`, `none`, `every:N` or `interval:MILLIS`
    pub fn from_name(s: &str) -> Option<Self> {
        match s.split_once(':') {
            None => match s {
                "immediate" => Some(SyncPolicy::Immediate),
                "none" => Some(SyncPolicy::None),
                _ => None,
            },
            Some(("every", n)) => n.parse().ok().filter(|n| *n > 0).map(SyncPolicy::EveryN),
            Some(("interval", ms)) => ms.parse().ok().map(|millis| SyncPolicy::Interval { millis }),
            Some(_) => None,
        }
    }
}

/// WAL configuration
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Disabled means uncommitted samples are lost on crash
    pub enabled: bool,
    /// Directory for WAL files
    pub dir: PathBuf,
    /// Sync policy
    pub sync_policy: SyncPolicy,
    /// Maximum segment size in bytes
    pub segment_size: usize,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: PathBuf::from("data/wal"),
            sync_policy: SyncPolicy::default(),
            segment_size: crate::config::WAL_SEGMENT_SIZE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_policy_names() {
        assert_eq!(SyncPolicy::from_name("immediate"), Some(SyncPolicy::Immediate));
        assert_eq!(SyncPolicy::from_name("every:16"), Some(SyncPolicy::EveryN(16)));
        assert_eq!(
            SyncPolicy::from_name("interval:250"),
            Some(SyncPolicy::Interval { millis: 250 })
        );
        assert_eq!(SyncPolicy::from_name("every:0"), None);
        assert_eq!(SyncPolicy::from_name("sometimes"), None);
    }

    #[test]
    fn test_segment_names() {
        let name = segment_name(42);
        assert_eq!(name, "wal_00000000000000000042.ils");
        assert_eq!(parse_segment_name(&name), Some(42));
        assert_eq!(parse_segment_name("wal_1.log"), None);
    }
}
