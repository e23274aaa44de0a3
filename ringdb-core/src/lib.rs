//! RingDB Core - time-series storage engine
//!
//! Samples arrive as line-oriented frames, are logged to a WAL, kept in
//! per-series in-memory columns and committed into a fixed ring of
//! storage volumes. The oldest volume is recycled when the ring wraps.
//!
//! # Architecture
//!
//! - **Ingestion**: framing state machine turning bytes into frames
//! - **Series index**: canonical series names to dense ids
//! - **WAL**: durability for samples not yet committed to a volume
//! - **Volumes**: fixed-size files reused circularly
//! - **Columns**: per-series skip lists scanned forward or backward
//! - **Query**: JSON queries executed into streamed CSV rows

pub mod codec;
pub mod column;
pub mod index;
pub mod ingest;
pub mod query;
pub mod storage;
pub mod time;
pub mod volume;
pub mod wal;

mod error;
mod types;

pub use error::{Result, RingError};
pub use types::*;

/// RingDB version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod config {
    /// WAL segment size (16MB)
    pub const WAL_SEGMENT_SIZE: usize = 16 * 1024 * 1024;

    /// Volumes in the ring
    pub const NVOLUMES: usize = 4;

    /// Volume file size (64MB)
    pub const VOLUME_SIZE: u64 = 64 * 1024 * 1024;

    /// Late-write window (10s)
    pub const LATE_WRITE_WINDOW: i64 = 10 * 1_000_000_000;

    /// Samples per volume block
    pub const BLOCK_SAMPLES: usize = 1000;

    /// Background commit interval
    pub const COMMIT_INTERVAL_MS: u64 = 1000;

    /// Pending samples that trigger an early commit
    pub const COMMIT_MAX_PENDING: usize = 100_000;

    pub const HTTP_PORT: u16 = 8181;
    pub const TCP_PORT: u16 = 8282;
    pub const UDP_PORT: u16 = 8383;
}
