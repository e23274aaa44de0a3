//! Daemon configuration
//!
//! Layered as: built-in defaults, optional TOML file, `RINGDB__*`
//! environment variables, then command-line overrides applied by `main`.

use anyhow::{anyhow, Context};
use ::config::{Config, Environment, File};
use ringdb_core::storage::{CommitConfig, StorageConfig};
use ringdb_core::time::parse_duration;
use ringdb_core::wal::{SyncPolicy, WalConfig};
use ringdb_core::DuplicatePolicy;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalSection {
    pub enabled: bool,
    /// `immediate`, `none`, `every:N` or `interval:MILLIS`
    pub sync: String,
    pub segment_size: usize,
}

impl Default for WalSection {
    fn default() -> Self {
        Self {
            enabled: true,
            sync: "immediate".to_string(),
            segment_size: ringdb_core::config::WAL_SEGMENT_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommitSection {
    pub interval_ms: u64,
    pub max_pending: usize,
}

impl Default for CommitSection {
    fn default() -> Self {
        Self {
            interval_ms: ringdb_core::config::COMMIT_INTERVAL_MS,
            max_pending: ringdb_core::config::COMMIT_MAX_PENDING,
        }
    }
}

/// Listen address of one server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listen {
    pub addr: SocketAddr,
}

impl Listen {
    fn any(port: u16) -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], port)),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Data directory
    pub data_dir: PathBuf,
    pub nvolumes: usize,
    pub volume_size: u64,
    /// Late-write window, e.g. `10s` or `500ms`
    pub window: String,
    /// `append` or `overwrite`
    pub duplicates: String,
    pub block_samples: usize,
    pub wal: WalSection,
    pub commit: CommitSection,
    pub http: Listen,
    pub tcp: Listen,
    pub udp: Listen,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            nvolumes: ringdb_core::config::NVOLUMES,
            volume_size: ringdb_core::config::VOLUME_SIZE,
            window: "10s".to_string(),
            duplicates: "append".to_string(),
            block_samples: ringdb_core::config::BLOCK_SAMPLES,
            wal: WalSection::default(),
            commit: CommitSection::default(),
            http: Listen::any(ringdb_core::config::HTTP_PORT),
            tcp: Listen::any(ringdb_core::config::TCP_PORT),
            udp: Listen::any(ringdb_core::config::UDP_PORT),
        }
    }
}

impl ServerConfig {
    /// Load defaults, then `path` if it exists, then the environment
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            if !path.exists() {
                return Err(anyhow!("config file not found: {}", path.display()));
            }
            builder = builder.add_source(File::from(path).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix("RINGDB")
                .separator("__")
                .try_parsing(true)
                .ignore_empty(true),
        );

        let merged = builder.build().context("reading configuration")?;
        let config: ServerConfig = merged
            .try_deserialize()
            .context("invalid configuration")?;
        // fail at startup, not on first use
        config.to_storage_config()?;
        Ok(config)
    }

    pub fn to_storage_config(&self) -> anyhow::Result<StorageConfig> {
        if self.nvolumes < 2 {
            return Err(anyhow!("nvolumes must be at least 2, got {}", self.nvolumes));
        }
        let window = parse_duration(&self.window)
            .map_err(|e| anyhow!("invalid window {:?}: {}", self.window, e))?;
        let duplicates = DuplicatePolicy::from_name(&self.duplicates)
            .ok_or_else(|| anyhow!("invalid duplicates policy {:?}", self.duplicates))?;
        let sync_policy = SyncPolicy::from_name(&self.wal.sync)
            .ok_or_else(|| anyhow!("invalid wal sync policy {:?}", self.wal.sync))?;

        let storage = StorageConfig {
            data_dir: self.data_dir.clone(),
            nvolumes: self.nvolumes,
            volume_size: self.volume_size,
            window,
            duplicates,
            block_samples: self.block_samples.max(1),
            wal: WalConfig {
                enabled: self.wal.enabled,
                dir: self.data_dir.join("wal"),
                sync_policy,
                segment_size: self.wal.segment_size,
            },
            commit: CommitConfig {
                interval: Duration::from_millis(self.commit.interval_ms.max(1)),
                max_pending: self.commit.max_pending,
            },
        };
        Ok(storage)
    }
}
