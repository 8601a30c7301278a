//! # HybridDB
//!
//! An embeddable hybrid row/column database engine. Application data is
//! stored as entities (attributes + named document collections + typed
//! outgoing edges); a dual coordinator transparently maintains an
//! optional per-entity-type column-store projection, and a query
//! analyzer/smart router dispatches each query to whichever storage (or
//! combination) answers it fastest — identical application code gets
//! transactional single-record access and analytic aggregate throughput
//! without the caller choosing a storage.

pub mod column;
pub mod config;
pub mod coordinator;
pub mod entity;
pub mod error;
pub mod index;
pub mod lock;
pub mod query;
pub mod row_engine;
pub mod value;
pub mod wal;

pub use column::{ColumnOp, ColumnarConfig, ConsistencyIssue, IssueKind, RepairAction, Severity, SyncMode};
pub use config::EngineConfig;
pub use coordinator::{Coordinator, ConsistencyReport, EngineStats, Overall, QueryOutcome};
pub use entity::{composite_key, Edge, Entity, EntityMetadata, Temporal};
pub use error::{EngineError, EngineResult};
pub use query::{AggregateOp, ExecutionPlan, QuerySpec, Strategy, WhereClause};
pub use value::Value;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::OnceCell;
use tracing::info;

use crate::query::spec::ForceStorage;
use crate::row_engine::RowEngine;
use crate::wal::WalManager;

/// Query metrics attached by `enhanced_query` when `include_metrics` is
/// requested (spec §6 `enhancedQuery`).
#[derive(Debug, Clone, Serialize)]
pub struct QueryMetrics {
    pub took_ms: u64,
    pub row_count: usize,
}

#[derive(Debug)]
pub struct EnhancedQueryResult {
    pub outcome: QueryOutcome,
    pub metrics: Option<QueryMetrics>,
}

/// Top-level façade (spec §6): owns the coordinator and is the crate's
/// single entry point. Grounded on the teacher's `NeuromorphicCore`
/// (one struct wrapping its subsystems, constructed from a config,
/// exposing a flat operation surface) generalized to wrap `Coordinator`.
#[derive(Debug)]
pub struct Engine {
    coordinator: Arc<Coordinator>,
    config: EngineConfig,
}

impl Engine {
    /// Load configuration (file/env, falling back to documented defaults)
    /// and open the engine against it.
    pub async fn initialize() -> EngineResult<Self> {
        Self::with_config(EngineConfig::load()?).await
    }

    /// Open the engine against an explicit configuration: creates the WAL
    /// directory if absent, replays it, and rebuilds indexes from the
    /// resulting live entity map (spec §4.3 "indexes are rebuilt ... after
    /// WAL replay on startup").
    pub async fn with_config(config: EngineConfig) -> EngineResult<Self> {
        let (wal, initial) = WalManager::open(config.wal_config()).await?;
        info!(entities = initial.len(), "HybridDB engine initialized");
        let row_engine = Arc::new(RowEngine::new(wal, initial));
        let coordinator = Arc::new(Coordinator::new(row_engine));
        Ok(Self { coordinator, config })
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Flush pending projections and compact the WAL (spec §5 `close()`).
    pub async fn close(&self) -> EngineResult<()> {
        self.coordinator.close().await
    }

    pub async fn save_entity(
        &self,
        entity_type: &str,
        id: &str,
        attributes: BTreeMap<String, Value>,
        documents: BTreeMap<String, Vec<BTreeMap<String, Value>>>,
    ) -> EngineResult<Entity> {
        self.coordinator.save_entity(entity_type, id, attributes, documents).await
    }

    pub async fn get_entity(&self, entity_type: &str, id: &str) -> EngineResult<Option<Entity>> {
        self.coordinator.row_engine().get_entity(entity_type, id).await
    }

    pub async fn delete_entity(&self, entity_type: &str, id: &str) -> EngineResult<bool> {
        self.coordinator.delete_entity(entity_type, id).await
    }

    pub async fn get_all_entities(&self, entity_type: &str) -> Vec<Entity> {
        self.coordinator.row_engine().get_all_entities(entity_type).await
    }

    pub async fn add_edge(&self, entity_type: &str, id: &str, edge: Edge) -> EngineResult<()> {
        self.coordinator.add_edge(entity_type, id, edge).await
    }

    pub async fn remove_edge(&self, entity_type: &str, id: &str, edge_id: &str) -> EngineResult<bool> {
        self.coordinator.remove_edge(entity_type, id, edge_id).await
    }

    pub async fn find_paths(&self, from: &str, to: &str, max_depth: usize) -> Vec<Vec<String>> {
        self.coordinator.row_engine().find_paths(from, to, max_depth).await
    }

    /// Run a query, letting the analyzer/router choose a strategy (spec §6
    /// `query(params)`).
    pub async fn query(&self, spec: &QuerySpec) -> EngineResult<QueryOutcome> {
        self.coordinator.query(spec).await
    }

    /// Force a strategy before routing (spec §6 `queryWithStrategy`); any
    /// string other than `"entity"`/`"columnar"` is treated as `"auto"`.
    pub async fn query_with_strategy(&self, mut spec: QuerySpec, strategy: &str) -> EngineResult<QueryOutcome> {
        spec.force_storage = match strategy {
            "entity" => Some(ForceStorage::Entity),
            "columnar" => Some(ForceStorage::Columnar),
            _ => None,
        };
        self.coordinator.query(&spec).await
    }

    /// `query` plus optional wall-clock/row-count metrics (spec §6
    /// `enhancedQuery`).
    pub async fn enhanced_query(&self, spec: &QuerySpec, include_metrics: bool) -> EngineResult<EnhancedQueryResult> {
        let start = Instant::now();
        let outcome = self.coordinator.query(spec).await?;
        let metrics = include_metrics.then(|| QueryMetrics {
            took_ms: u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
            row_count: outcome.rows.len(),
        });
        Ok(EnhancedQueryResult { outcome, metrics })
    }

    pub async fn enable_columnar_storage(&self, entity_type: &str, cfg: ColumnarConfig) -> EngineResult<()> {
        self.coordinator.enable_columnar_storage(entity_type, cfg).await
    }

    pub async fn disable_columnar_storage(&self, entity_type: &str) {
        self.coordinator.disable_columnar_storage(entity_type).await;
    }

    pub async fn add_columnar_columns(&self, entity_type: &str, columns: std::collections::BTreeSet<String>) -> EngineResult<()> {
        self.coordinator.add_columnar_columns(entity_type, columns).await
    }

    pub async fn remove_columnar_columns(
        &self,
        entity_type: &str,
        columns: &std::collections::BTreeSet<String>,
    ) -> EngineResult<()> {
        self.coordinator.remove_columnar_columns(entity_type, columns).await
    }

    /// Bulk-apply a map of `entityType -> ColumnarConfig` (spec §6
    /// `configureColumnarStorage(map)`).
    pub async fn configure_columnar_storage(&self, configs: BTreeMap<String, ColumnarConfig>) -> EngineResult<()> {
        for (entity_type, cfg) in configs {
            self.coordinator.enable_columnar_storage(&entity_type, cfg).await?;
        }
        Ok(())
    }

    pub async fn sync_entity_type_to_columnar(&self, entity_type: &str) -> EngineResult<()> {
        self.coordinator.sync_entity_type_to_columnar(entity_type).await
    }

    pub async fn check_consistency(&self) -> ConsistencyReport {
        self.coordinator.check_consistency().await
    }

    pub async fn get_columnar_metrics(&self, entity_type: &str) -> BTreeMap<String, usize> {
        self.coordinator.get_columnar_metrics(entity_type).await
    }

    pub async fn get_stats(&self) -> EngineStats {
        self.coordinator.get_stats().await
    }
}

static DEFAULT_ENGINE: OnceCell<Arc<Engine>> = OnceCell::const_new();

/// Lazily construct (with default configuration) and return the
/// process-wide default instance (spec §9 design note: convenience, not
/// load-bearing — most callers should hold their own `Engine`).
pub async fn default_engine() -> EngineResult<Arc<Engine>> {
    let engine = DEFAULT_ENGINE
        .get_or_try_init(|| async { Engine::initialize().await.map(Arc::new) })
        .await?;
    Ok(engine.clone())
}

/// Flush and compact the default instance, if one was ever constructed.
pub async fn shutdown_default() -> EngineResult<()> {
    if let Some(engine) = DEFAULT_ENGINE.get() {
        engine.close().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use tempfile::TempDir;

    async fn engine() -> (TempDir, Engine) {
        let dir = TempDir::new().expect("tempdir");
        let cfg = EngineConfig {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        (dir, Engine::with_config(cfg).await.expect("engine init"))
    }

    #[tokio::test]
    async fn initialize_then_save_and_get_roundtrips() {
        let (_dir, engine) = engine().await;
        engine
            .save_entity("user", "U1", BTreeMap::from([("name".to_string(), Value::String("Ada".into()))]), BTreeMap::new())
            .await
            .unwrap();
        let got = engine.get_entity("user", "U1").await.unwrap().unwrap();
        assert_eq!(got.attribute("name"), Value::String("Ada".into()));
    }

    #[tokio::test]
    async fn close_then_reopen_recovers_state() {
        let dir = TempDir::new().unwrap();
        let cfg = EngineConfig {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        {
            let engine = Engine::with_config(cfg.clone()).await.unwrap();
            engine.save_entity("user", "U1", BTreeMap::new(), BTreeMap::new()).await.unwrap();
            engine.close().await.unwrap();
        }
        let engine = Engine::with_config(cfg).await.unwrap();
        assert!(engine.get_entity("user", "U1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn check_consistency_is_clean_with_no_columnar_types() {
        let (_dir, engine) = engine().await;
        let report = engine.check_consistency().await;
        assert_eq!(report.overall, Overall::Consistent);
    }
}
