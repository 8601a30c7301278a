//! Engine-wide configuration (spec §6): root data directory, WAL
//! compaction threshold, column-read cache size, memory budget,
//! compression choice, auto-routing, background sync.
//!
//! Grounded on the teacher's `storage::wal::WALConfig`/
//! `storage::pager::PagerConfig` (one small struct per subsystem with a
//! stated `Default`), generalized into one root config loaded with the
//! `config` crate's layered file/env sources instead of being constructed
//! by hand at each call site.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::wal::WalConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    None,
    Gzip,
    Lz4,
    Snappy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    pub algorithm: CompressionAlgorithm,
    pub level: u8,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            algorithm: CompressionAlgorithm::None,
            level: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    pub compaction_threshold: usize,
    pub column_cache_size: usize,
    pub memory_budget_bytes: u64,
    pub compression: CompressionConfig,
    pub auto_routing: bool,
    pub background_sync: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            compaction_threshold: 1000,
            column_cache_size: 256,
            memory_budget_bytes: 512 * 1024 * 1024,
            compression: CompressionConfig::default(),
            auto_routing: true,
            background_sync: true,
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn wal_config(&self) -> WalConfig {
        WalConfig {
            wal_dir: self.data_dir.join("wal"),
            compaction_threshold: self.compaction_threshold,
        }
    }

    /// Layered load: built-in defaults, then an optional `hybriddb.toml` in
    /// the current directory, then `HYBRIDDB_*` environment overrides
    /// (teacher precedent: `config::Config` builder layering file sources
    /// under env overrides).
    pub fn load() -> EngineResult<Self> {
        let defaults = Self::default();
        let builder = config::Config::builder()
            .set_default("data_dir", defaults.data_dir.to_string_lossy().to_string())
            .map_err(config_err)?
            .set_default("compaction_threshold", defaults.compaction_threshold as i64)
            .map_err(config_err)?
            .set_default("column_cache_size", defaults.column_cache_size as i64)
            .map_err(config_err)?
            .set_default("memory_budget_bytes", defaults.memory_budget_bytes as i64)
            .map_err(config_err)?
            .set_default("auto_routing", defaults.auto_routing)
            .map_err(config_err)?
            .set_default("background_sync", defaults.background_sync)
            .map_err(config_err)?
            .add_source(config::File::with_name("hybriddb").required(false))
            .add_source(config::Environment::with_prefix("HYBRIDDB"));

        let settled = builder.build().map_err(config_err)?;
        let data_dir: String = settled.get("data_dir").map_err(config_err)?;
        let compaction_threshold: i64 = settled.get("compaction_threshold").map_err(config_err)?;
        let column_cache_size: i64 = settled.get("column_cache_size").map_err(config_err)?;
        let memory_budget_bytes: i64 = settled.get("memory_budget_bytes").map_err(config_err)?;
        let auto_routing: bool = settled.get("auto_routing").map_err(config_err)?;
        let background_sync: bool = settled.get("background_sync").map_err(config_err)?;

        Ok(Self {
            data_dir: PathBuf::from(data_dir),
            compaction_threshold: usize::try_from(compaction_threshold).unwrap_or(defaults.compaction_threshold),
            column_cache_size: usize::try_from(column_cache_size).unwrap_or(defaults.column_cache_size),
            memory_budget_bytes: u64::try_from(memory_budget_bytes).unwrap_or(defaults.memory_budget_bytes),
            compression: defaults.compression,
            auto_routing,
            background_sync,
        })
    }
}

fn config_err(e: config::ConfigError) -> EngineError {
    EngineError::config(e.to_string())
}
