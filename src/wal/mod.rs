//! Write-ahead log (spec §4.1).
//!
//! Durable, ordered, append-only journal of entity/edge mutations,
//! sufficient to rebuild the in-memory entity map after an unclean
//! shutdown. Grounded on the teacher's `storage::wal::WALManager`
//! (LSN allocation, checksum framing, segment writer split into its own
//! submodule) but reshaped from page-level before/after images to
//! full-entity-snapshot records, since this engine's row store is an
//! in-memory map rather than a paged file.

mod segment;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::entity::{composite_key, Edge, Entity};
use crate::error::{EngineError, EngineResult};

pub use segment::SegmentWriter;

/// Log Sequence Number: monotonic per-append counter used for ordering and
/// observability (spec §4.1, §5 ordering guarantees).
pub type Lsn = u64;

/// Tagged union of WAL entry kinds (spec §4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WalEntry {
    Insert {
        entity_type: String,
        entity_id: String,
        entity: Entity,
    },
    Update {
        entity_type: String,
        entity_id: String,
        entity: Entity,
    },
    Delete {
        entity_type: String,
        entity_id: String,
    },
    AddEdge {
        entity_type: String,
        entity_id: String,
        edge: Edge,
    },
    RemoveEdge {
        entity_type: String,
        entity_id: String,
        edge: Edge,
    },
}

/// An entry as durably recorded: the tagged union plus ordering metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalRecord {
    pub lsn: Lsn,
    pub timestamp: DateTime<Utc>,
    pub entry: WalEntry,
}

#[derive(Debug, Clone)]
pub struct WalConfig {
    pub wal_dir: PathBuf,
    /// Number of entries after which `maybe_compact` rewrites the log.
    pub compaction_threshold: usize,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            wal_dir: PathBuf::from("data/wal"),
            compaction_threshold: 1000,
        }
    }
}

/// Write-ahead log manager: owns the on-disk segment and the LSN counter.
#[derive(Debug)]
pub struct WalManager {
    config: WalConfig,
    next_lsn: AtomicU64,
    writer: Mutex<SegmentWriter>,
    entry_count: AtomicU64,
}

impl WalManager {
    /// Open (creating if absent) the WAL directory, replay existing
    /// entries into a fresh entity map, and return both (spec §4.1 replay
    /// contract: callers never observe an un-replayed WAL).
    pub async fn open(config: WalConfig) -> EngineResult<(Arc<Self>, BTreeMap<String, Entity>)> {
        tokio::fs::create_dir_all(&config.wal_dir).await?;
        let path = log_path(&config.wal_dir);
        let (writer, records) = SegmentWriter::open_and_read(&path).await?;
        let next_lsn = records.last().map_or(0, |r| r.lsn + 1);

        let manager = Arc::new(Self {
            config,
            next_lsn: AtomicU64::new(next_lsn),
            writer: Mutex::new(writer),
            entry_count: AtomicU64::new(records.len() as u64),
        });

        let map = replay(records);
        info!(entries = map.len(), "WAL replay complete");
        Ok((manager, map))
    }

    fn allocate_lsn(&self) -> Lsn {
        self.next_lsn.fetch_add(1, Ordering::SeqCst)
    }

    /// Append and durably flush one entry (spec §4.1 write contract: must
    /// not return before bytes are flushed).
    pub async fn append(&self, entry: WalEntry) -> EngineResult<Lsn> {
        let lsn = self.allocate_lsn();
        let record = WalRecord {
            lsn,
            timestamp: Utc::now(),
            entry,
        };
        let mut writer = self.writer.lock().await;
        writer.append(&record).await?;
        drop(writer);
        self.entry_count.fetch_add(1, Ordering::SeqCst);
        Ok(lsn)
    }

    #[must_use]
    pub fn current_lsn(&self) -> Lsn {
        self.next_lsn.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn entry_count(&self) -> u64 {
        self.entry_count.load(Ordering::SeqCst)
    }

    /// Compact the log if the entry count has crossed the configured
    /// threshold: produce one `Insert` per currently-live entity, then
    /// atomically replace the old log (spec §4.1 compaction contract).
    pub async fn maybe_compact(&self, live: &BTreeMap<String, Entity>) -> EngineResult<bool> {
        if (self.entry_count.load(Ordering::SeqCst) as usize) < self.config.compaction_threshold {
            return Ok(false);
        }
        self.compact(live).await?;
        Ok(true)
    }

    pub async fn compact(&self, live: &BTreeMap<String, Entity>) -> EngineResult<()> {
        let mut writer = self.writer.lock().await;
        let tmp_path = log_path(&self.config.wal_dir).with_extension("compact");
        let mut tmp = SegmentWriter::create(&tmp_path).await?;

        let mut lsn = 0;
        for entity in live.values() {
            let record = WalRecord {
                lsn,
                timestamp: Utc::now(),
                entry: WalEntry::Insert {
                    entity_type: entity.entity_type.clone(),
                    entity_id: entity.id.clone(),
                    entity: entity.clone(),
                },
            };
            tmp.append(&record).await?;
            lsn += 1;
        }
        tmp.flush().await?;
        drop(tmp);

        let final_path = log_path(&self.config.wal_dir);
        tokio::fs::rename(&tmp_path, &final_path).await?;
        *writer = SegmentWriter::open_and_read(&final_path).await?.0;

        self.next_lsn.store(lsn, Ordering::SeqCst);
        self.entry_count.store(lsn, Ordering::SeqCst);
        info!(entries = lsn, "WAL compacted");
        Ok(())
    }
}

fn log_path(dir: &Path) -> PathBuf {
    dir.join("wal.log")
}

/// Replay entries in file order into an empty map using the same semantics
/// as the live operations (spec §4.1 replay contract, invariant 6).
fn replay(records: Vec<WalRecord>) -> BTreeMap<String, Entity> {
    let mut map = BTreeMap::new();
    for record in records {
        apply(&mut map, record.entry);
    }
    map
}

fn apply(map: &mut BTreeMap<String, Entity>, entry: WalEntry) {
    match entry {
        WalEntry::Insert {
            entity_type,
            entity_id,
            entity,
        }
        | WalEntry::Update {
            entity_type,
            entity_id,
            entity,
        } => {
            map.insert(composite_key(&entity_type, &entity_id), entity);
        }
        WalEntry::Delete {
            entity_type,
            entity_id,
        } => {
            map.remove(&composite_key(&entity_type, &entity_id));
        }
        WalEntry::AddEdge {
            entity_type,
            entity_id,
            edge,
        } => {
            if let Some(e) = map.get_mut(&composite_key(&entity_type, &entity_id)) {
                e.edges.retain(|existing| existing.id != edge.id);
                e.edges.push(edge);
            } else {
                warn!(
                    entity = %composite_key(&entity_type, &entity_id),
                    "WAL AddEdge for missing entity during replay, ignoring"
                );
            }
        }
        WalEntry::RemoveEdge {
            entity_type,
            entity_id,
            edge,
        } => {
            if let Some(e) = map.get_mut(&composite_key(&entity_type, &entity_id)) {
                e.edges.retain(|existing| existing.id != edge.id);
            }
        }
    }
}

/// Surfaced by `WalManager::open` when corruption is found before any
/// readable tail (spec §7: fatal to `initialize`).
pub fn fatal_corruption(msg: impl Into<String>) -> EngineError {
    EngineError::WalCorruption(msg.into())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::entity::Entity;
    use tempfile::TempDir;

    #[tokio::test]
    async fn open_empty_dir_yields_empty_map() {
        let dir = TempDir::new().unwrap();
        let (_wal, map) = WalManager::open(WalConfig {
            wal_dir: dir.path().to_path_buf(),
            ..Default::default()
        })
        .await
        .unwrap();
        assert!(map.is_empty());
    }

    #[tokio::test]
    async fn append_then_reopen_replays_state() {
        let dir = TempDir::new().unwrap();
        let cfg = WalConfig {
            wal_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let entity = Entity::new(
            "user",
            "U1",
            BTreeMap::new(),
            BTreeMap::new(),
            vec![],
            Utc::now(),
        )
        .unwrap();

        {
            let (wal, _map) = WalManager::open(cfg.clone()).await.unwrap();
            wal.append(WalEntry::Insert {
                entity_type: "user".into(),
                entity_id: "U1".into(),
                entity,
            })
            .await
            .unwrap();
        }

        let (_wal2, map) = WalManager::open(cfg).await.unwrap();
        assert_eq!(map.len(), 1);
        assert!(map.contains_key("user:U1"));
    }

    #[tokio::test]
    async fn delete_after_insert_removes_on_replay() {
        let dir = TempDir::new().unwrap();
        let cfg = WalConfig {
            wal_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let entity = Entity::new(
            "user",
            "U1",
            BTreeMap::new(),
            BTreeMap::new(),
            vec![],
            Utc::now(),
        )
        .unwrap();
        {
            let (wal, _map) = WalManager::open(cfg.clone()).await.unwrap();
            wal.append(WalEntry::Insert {
                entity_type: "user".into(),
                entity_id: "U1".into(),
                entity,
            })
            .await
            .unwrap();
            wal.append(WalEntry::Delete {
                entity_type: "user".into(),
                entity_id: "U1".into(),
            })
            .await
            .unwrap();
        }
        let (_wal, map) = WalManager::open(cfg).await.unwrap();
        assert!(map.is_empty());
    }

    #[tokio::test]
    async fn compaction_collapses_history_to_live_inserts() {
        let dir = TempDir::new().unwrap();
        let cfg = WalConfig {
            wal_dir: dir.path().to_path_buf(),
            compaction_threshold: 2,
        };
        let mut entity = Entity::new(
            "user",
            "U1",
            BTreeMap::new(),
            BTreeMap::new(),
            vec![],
            Utc::now(),
        )
        .unwrap();
        let (wal, mut map) = WalManager::open(cfg).await.unwrap();
        wal.append(WalEntry::Insert {
            entity_type: "user".into(),
            entity_id: "U1".into(),
            entity: entity.clone(),
        })
        .await
        .unwrap();
        map.insert("user:U1".into(), entity.clone());

        entity.apply_update(BTreeMap::new(), BTreeMap::new(), None, Utc::now());
        wal.append(WalEntry::Update {
            entity_type: "user".into(),
            entity_id: "U1".into(),
            entity: entity.clone(),
        })
        .await
        .unwrap();
        map.insert("user:U1".into(), entity);

        assert!(wal.maybe_compact(&map).await.unwrap());
        assert_eq!(wal.entry_count(), 1);
    }
}
