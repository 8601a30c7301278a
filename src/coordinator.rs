//! Dual coordinator (spec §4.8): mediates the row engine and the column
//! store, owns the per-entity-type columnar configuration, and is the
//! single entry point writes and reads flow through.
//!
//! Grounded on the teacher's `storage::engine::mod::StorageEngine`
//! (a top-level struct holding `Arc`-wrapped subsystems it mediates
//! between — there, WAL and buffer pool; here, row engine and column
//! store) and `storage::buffer::flusher` for the bounded-channel,
//! periodic-drain background worker idiom used for `batch`/`scheduled`
//! projection sync.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::column::{ColumnOp, ColumnStore, ColumnarConfig, ConsistencyIssue, Severity, SyncMode};
use crate::entity::{Edge, Entity};
use crate::error::{EngineError, EngineResult};
use crate::lock::LockStats;
use crate::query::spec::AttributePredicate;
use crate::query::{classify, ExecutionPlan, QuerySpec, Strategy};
use crate::row_engine::{project, sort_entities, RowEngine};
use crate::value::Value;

const PROJECTION_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnarState {
    Backfilling,
    Active,
    Disabled,
}

struct ProjectionJob {
    entity_type: String,
    columns: BTreeSet<String>,
    indexed: BTreeSet<String>,
    entity: Entity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Overall {
    Consistent,
    MinorIssues,
    MajorIssues,
}

#[derive(Debug)]
pub struct ConsistencyReport {
    pub overall: Overall,
    pub issues: Vec<ConsistencyIssue>,
}

#[derive(Debug)]
pub struct QueryOutcome {
    pub rows: Vec<JsonValue>,
    pub strategy: Strategy,
    pub plan: ExecutionPlan,
}

#[derive(Debug, Serialize)]
pub struct EngineStats {
    pub columnar_configured_types: Vec<String>,
    pub wal_entries: u64,
    pub lock_stats_queued_waiters: usize,
    pub lock_stats_active_write_locks: usize,
    pub lock_stats_active_read_locks: usize,
}

/// Mediates `RowEngine` and `ColumnStore` per spec §4.8: every `saveEntity`
/// flows through here first, then conditionally projects; every read goes
/// Analyzer → (this coordinator's dispatch) → one or both storages.
#[derive(Debug)]
pub struct Coordinator {
    row_engine: Arc<RowEngine>,
    column_store: Arc<ColumnStore>,
    configs: RwLock<BTreeMap<String, ColumnarConfig>>,
    states: RwLock<BTreeMap<String, ColumnarState>>,
    queue_tx: Mutex<Option<mpsc::Sender<ProjectionJob>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Coordinator {
    #[must_use]
    pub fn new(row_engine: Arc<RowEngine>) -> Self {
        let column_store = Arc::new(ColumnStore::new());
        let (tx, rx) = mpsc::channel(PROJECTION_QUEUE_CAPACITY);
        let worker_store = column_store.clone();
        let handle = tokio::spawn(run_projection_worker(worker_store, rx));
        Self {
            row_engine,
            column_store,
            configs: RwLock::new(BTreeMap::new()),
            states: RwLock::new(BTreeMap::new()),
            queue_tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(handle)),
        }
    }

    #[must_use]
    pub fn row_engine(&self) -> &Arc<RowEngine> {
        &self.row_engine
    }

    // ---- columnar configuration (spec §4.8) ----

    /// Register a columnar configuration and backfill every currently-live
    /// entity of `entity_type` before returning (spec §4.8 `Unconfigured →
    /// Backfilling → Active`; queries against a `Backfilling` type are
    /// never observed since the state flips to `Active` only after the
    /// backfill loop below completes).
    pub async fn enable_columnar_storage(&self, entity_type: &str, cfg: ColumnarConfig) -> EngineResult<()> {
        if cfg.columns.is_empty() {
            return Err(EngineError::config("columnar config must declare at least one column"));
        }
        self.states.write().await.insert(entity_type.to_string(), ColumnarState::Backfilling);

        let live = self.row_engine.get_all_entities(entity_type).await;
        for entity in &live {
            self.column_store.project_entity(entity_type, &cfg.columns, &cfg.indexes, entity).await;
        }

        self.configs.write().await.insert(entity_type.to_string(), cfg);
        self.states.write().await.insert(entity_type.to_string(), ColumnarState::Active);
        Ok(())
    }

    /// Drop the configuration; column files are left in place for re-enable
    /// (spec §4.8).
    pub async fn disable_columnar_storage(&self, entity_type: &str) {
        self.configs.write().await.remove(entity_type);
        self.states.write().await.insert(entity_type.to_string(), ColumnarState::Disabled);
    }

    /// Union new columns into the configuration and backfill only those
    /// (spec §4.8 `addColumnarColumns`).
    pub async fn add_columnar_columns(&self, entity_type: &str, columns: BTreeSet<String>) -> EngineResult<()> {
        let (new_columns, indexed_subset) = {
            let mut configs = self.configs.write().await;
            let cfg = configs
                .get_mut(entity_type)
                .ok_or_else(|| EngineError::config(format!("'{entity_type}' is not columnar-configured")))?;
            let new_columns: BTreeSet<String> = columns.difference(&cfg.columns).cloned().collect();
            cfg.columns.extend(columns);
            let indexed_subset: BTreeSet<String> = cfg.indexes.intersection(&new_columns).cloned().collect();
            (new_columns, indexed_subset)
        };

        if !new_columns.is_empty() {
            let live = self.row_engine.get_all_entities(entity_type).await;
            for entity in &live {
                self.column_store
                    .project_entity(entity_type, &new_columns, &indexed_subset, entity)
                    .await;
            }
        }
        Ok(())
    }

    /// Drop columns from the configuration; files are left behind (spec
    /// §4.8 `removeColumnarColumns`).
    pub async fn remove_columnar_columns(&self, entity_type: &str, columns: &BTreeSet<String>) -> EngineResult<()> {
        let mut configs = self.configs.write().await;
        let cfg = configs
            .get_mut(entity_type)
            .ok_or_else(|| EngineError::config(format!("'{entity_type}' is not columnar-configured")))?;
        for column in columns {
            cfg.columns.remove(column);
            cfg.indexes.remove(column);
        }
        Ok(())
    }

    pub async fn sync_entity_type_to_columnar(&self, entity_type: &str) -> EngineResult<()> {
        let cfg = self
            .configs
            .read()
            .await
            .get(entity_type)
            .cloned()
            .ok_or_else(|| EngineError::config(format!("'{entity_type}' is not columnar-configured")))?;
        let live = self.row_engine.get_all_entities(entity_type).await;
        for entity in &live {
            self.column_store.project_entity(entity_type, &cfg.columns, &cfg.indexes, entity).await;
        }
        Ok(())
    }

    // ---- write path (spec §4.8) ----

    pub async fn save_entity(
        &self,
        entity_type: &str,
        id: &str,
        attributes: BTreeMap<String, Value>,
        documents: BTreeMap<String, Vec<BTreeMap<String, Value>>>,
    ) -> EngineResult<Entity> {
        let entity = self.row_engine.save_entity(entity_type, id, attributes, documents).await?;
        self.maybe_project(entity_type, &entity).await;
        Ok(entity)
    }

    pub async fn add_edge(&self, entity_type: &str, id: &str, edge: Edge) -> EngineResult<()> {
        self.row_engine.add_edge(entity_type, id, edge).await
    }

    pub async fn remove_edge(&self, entity_type: &str, id: &str, edge_id: &str) -> EngineResult<bool> {
        self.row_engine.remove_edge(entity_type, id, edge_id).await
    }

    pub async fn delete_entity(&self, entity_type: &str, id: &str) -> EngineResult<bool> {
        let deleted = self.row_engine.delete_entity(entity_type, id).await?;
        if deleted {
            if let Some(cfg) = self.configs.read().await.get(entity_type) {
                self.column_store.remove_entity(entity_type, id, &cfg.columns).await;
            }
        }
        Ok(deleted)
    }

    /// Project into the column store per `syncMode`: synchronous under
    /// `immediate`, enqueued under `batch`/`scheduled` (spec §4.8 write
    /// path — a projection failure never rolls back the row write, it only
    /// surfaces at the next consistency check, so enqueue failures are
    /// logged and dropped here rather than propagated).
    async fn maybe_project(&self, entity_type: &str, entity: &Entity) {
        let (columns, indexed, sync_mode, auto_sync) = {
            let configs = self.configs.read().await;
            let Some(cfg) = configs.get(entity_type) else {
                return;
            };
            (cfg.columns.clone(), cfg.indexes.clone(), cfg.sync_mode, cfg.auto_sync)
        };
        if !auto_sync {
            return;
        }
        let is_active = matches!(self.states.read().await.get(entity_type), Some(ColumnarState::Active));
        if !is_active {
            return;
        }

        match sync_mode {
            SyncMode::Immediate => {
                self.column_store.project_entity(entity_type, &columns, &indexed, entity).await;
            }
            SyncMode::Batch | SyncMode::Scheduled => {
                let job = ProjectionJob {
                    entity_type: entity_type.to_string(),
                    columns,
                    indexed,
                    entity: entity.clone(),
                };
                let tx = self.queue_tx.lock().await.clone();
                if let Some(tx) = tx {
                    if let Err(err) = tx.send(job).await {
                        warn!(entity_type, error = %err, "projection queue closed, dropping deferred projection");
                    }
                }
            }
        }
    }

    // ---- read path (spec §4.6, §4.7) ----

    pub async fn query(&self, spec: &QuerySpec) -> EngineResult<QueryOutcome> {
        let columnar_configured = {
            let configs = self.configs.read().await;
            let states = self.states.read().await;
            let active = matches!(states.get(&spec.primary), Some(ColumnarState::Active));
            match configs.get(&spec.primary) {
                Some(cfg) if active => spec.required_columns().iter().all(|c| cfg.columns.contains(c)),
                _ => false,
            }
        };

        let classification = classify(spec, columnar_configured);
        let plan = match classification.strategy {
            Strategy::EntityOnly => ExecutionPlan::entity_only(classification.reason.clone()),
            Strategy::ColumnarOnly => ExecutionPlan::columnar_only(classification.reason.clone(), 1),
            Strategy::Hybrid => ExecutionPlan::hybrid(classification.reason.clone()),
        };

        let (rows, strategy) = match self.execute(spec, classification.strategy).await {
            Ok(rows) => (rows, classification.strategy),
            Err(err) if err.is_columnar_recoverable() && classification.strategy != Strategy::EntityOnly => {
                warn!(error = %err, "Fallback to entity store due to columnar error");
                (self.row_engine.query(spec).await?, Strategy::EntityOnly)
            }
            Err(err) => return Err(err),
        };

        Ok(QueryOutcome { rows, strategy, plan })
    }

    async fn execute(&self, spec: &QuerySpec, strategy: Strategy) -> EngineResult<Vec<JsonValue>> {
        match strategy {
            Strategy::EntityOnly => self.row_engine.query(spec).await,
            Strategy::ColumnarOnly => self.execute_columnar(spec).await,
            Strategy::Hybrid => self.execute_hybrid(spec).await,
        }
    }

    async fn execute_columnar(&self, spec: &QuerySpec) -> EngineResult<Vec<JsonValue>> {
        let candidate_ids = self.where_to_id_set(spec).await?;

        if let Some(group_by) = &spec.group_by {
            let group_col = group_by
                .first()
                .ok_or_else(|| EngineError::validation("group_by requires at least one column"))?;
            let (agg_col, op) = spec
                .aggregate
                .as_ref()
                .and_then(|m| m.iter().next())
                .ok_or_else(|| EngineError::validation("group_by query requires an aggregate"))?;
            let grouped = self.column_store.group_by_aggregate(&spec.primary, group_col, agg_col, *op).await?;
            return Ok(grouped
                .into_iter()
                .map(|(group, value)| serde_json::json!({ "group": group, "value": value }))
                .collect());
        }

        if let Some(aggregate) = &spec.aggregate {
            let mut result = serde_json::Map::new();
            for (column, op) in aggregate {
                let value = self
                    .column_store
                    .aggregate_column(&spec.primary, column, *op, candidate_ids.as_ref())
                    .await?;
                result.insert(column.clone(), serde_json::json!(value));
            }
            return Ok(vec![JsonValue::Object(result)]);
        }

        let ids = candidate_ids.unwrap_or_default();
        Ok(ids.into_iter().map(|id| serde_json::json!({ "id": id })).collect())
    }

    async fn execute_hybrid(&self, spec: &QuerySpec) -> EngineResult<Vec<JsonValue>> {
        let ids = self.where_to_id_set(spec).await?.unwrap_or_default();
        let mut entities = Vec::with_capacity(ids.len());
        for entity_id in &ids {
            if let Some(entity) = self.row_engine.get_entity(&spec.primary, entity_id).await? {
                entities.push(entity);
            }
        }

        if let Some(order_by) = &spec.order_by {
            sort_entities(&mut entities, order_by);
        }

        let offset = spec.offset.unwrap_or(0);
        let limit = spec.limit.unwrap_or(usize::MAX);
        Ok(entities
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|e| project(&e, spec.include.as_deref(), spec.exclude.as_deref()))
            .collect())
    }

    /// Evaluate each attribute predicate in the where-clause to a candidate
    /// id set via the column store, intersecting across operators within a
    /// predicate and across predicates (spec §4.7 "where → id-set
    /// composition"). `nin`/`exists` have no columnar equivalent and are
    /// left unconstrained here — callers only reach this path when the
    /// analyzer judged the query safe for columnar/hybrid execution.
    async fn where_to_id_set(&self, spec: &QuerySpec) -> EngineResult<Option<HashSet<String>>> {
        let Some(where_clause) = &spec.where_clause else {
            return Ok(None);
        };
        if where_clause.is_empty() {
            return Ok(None);
        }

        let mut result: Option<HashSet<String>> = None;
        for (field, pred) in &where_clause.attributes {
            let ops = predicate_to_column_ops(pred);
            let mut field_set: Option<HashSet<String>> = None;
            for op in ops {
                let set = self.column_store.filter_by_column(&spec.primary, field, &op).await;
                field_set = Some(match field_set {
                    Some(existing) => existing.intersection(&set).cloned().collect(),
                    None => set,
                });
            }
            if let Some(field_set) = field_set {
                result = Some(match result {
                    Some(existing) => existing.intersection(&field_set).cloned().collect(),
                    None => field_set,
                });
            }
        }
        Ok(result)
    }

    // ---- admin (spec §6) ----

    pub async fn check_consistency(&self) -> ConsistencyReport {
        let configs = self.configs.read().await.clone();
        let mut live_counts = BTreeMap::new();
        for entity_type in configs.keys() {
            live_counts.insert(entity_type.clone(), self.row_engine.get_all_entities(entity_type).await.len());
        }
        let issues = self.column_store.check_consistency(&configs, &live_counts).await;
        let overall = if issues.is_empty() {
            Overall::Consistent
        } else if issues.iter().any(|i| i.severity == Severity::Major) {
            Overall::MajorIssues
        } else {
            Overall::MinorIssues
        };
        ConsistencyReport { overall, issues }
    }

    pub async fn get_columnar_metrics(&self, entity_type: &str) -> BTreeMap<String, usize> {
        self.column_store.column_record_counts(entity_type).await
    }

    pub async fn get_stats(&self) -> EngineStats {
        let configs = self.configs.read().await;
        let lock_stats: LockStats = self.row_engine.lock_manager().stats();
        EngineStats {
            columnar_configured_types: configs.keys().cloned().collect(),
            wal_entries: self.row_engine.wal_entry_count(),
            lock_stats_queued_waiters: lock_stats.queued_waiters,
            lock_stats_active_write_locks: lock_stats.active_write_locks,
            lock_stats_active_read_locks: lock_stats.active_read_locks,
        }
    }

    /// Stop the projection worker, drain nothing further, and compact the
    /// WAL (spec §5 `close()` contract).
    pub async fn close(&self) -> EngineResult<()> {
        if let Some(tx) = self.queue_tx.lock().await.take() {
            drop(tx);
        }
        if let Some(handle) = self.worker.lock().await.take() {
            let _ = handle.await;
        }
        self.row_engine.compact_wal().await
    }
}

fn predicate_to_column_ops(pred: &AttributePredicate) -> Vec<ColumnOp> {
    let mut ops = Vec::new();
    if let Some(v) = &pred.eq {
        ops.push(ColumnOp::Eq(v.clone()));
    }
    if let Some(v) = &pred.ne {
        ops.push(ColumnOp::Ne(v.clone()));
    }
    if let Some(vs) = &pred.in_ {
        ops.push(ColumnOp::In(vs.clone()));
    }
    if let Some(v) = &pred.gt {
        ops.push(ColumnOp::Gt(v.clone()));
    }
    if let Some(v) = &pred.gte {
        ops.push(ColumnOp::Gte(v.clone()));
    }
    if let Some(v) = &pred.lt {
        ops.push(ColumnOp::Lt(v.clone()));
    }
    if let Some(v) = &pred.lte {
        ops.push(ColumnOp::Lte(v.clone()));
    }
    ops
}

async fn run_projection_worker(store: Arc<ColumnStore>, mut rx: mpsc::Receiver<ProjectionJob>) {
    while let Some(job) = rx.recv().await {
        store.project_entity(&job.entity_type, &job.columns, &job.indexed, &job.entity).await;
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::wal::{WalConfig, WalManager};
    use tempfile::TempDir;

    async fn coordinator() -> (TempDir, Coordinator) {
        let dir = TempDir::new().expect("tempdir");
        let (wal, initial) = WalManager::open(WalConfig {
            wal_dir: dir.path().to_path_buf(),
            ..Default::default()
        })
        .await
        .expect("wal open");
        (dir, Coordinator::new(Arc::new(RowEngine::new(wal, initial))))
    }

    fn attrs(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[tokio::test]
    async fn enable_backfills_existing_entities() {
        let (_dir, coord) = coordinator().await;
        coord
            .save_entity("partner", "BP1", attrs(&[("revenue", Value::Number(10.0))]), BTreeMap::new())
            .await
            .unwrap();

        coord
            .enable_columnar_storage(
                "partner",
                ColumnarConfig {
                    columns: BTreeSet::from(["revenue".to_string()]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let metrics = coord.get_columnar_metrics("partner").await;
        assert_eq!(metrics.get("revenue"), Some(&1));
    }

    #[tokio::test]
    async fn aggregate_query_hits_columnar_only() {
        let (_dir, coord) = coordinator().await;
        coord
            .enable_columnar_storage(
                "partner",
                ColumnarConfig {
                    columns: BTreeSet::from(["revenue".to_string(), "region".to_string()]),
                    indexes: BTreeSet::from(["region".to_string()]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        for (id, revenue, region) in [("BP1", 100.0, "West"), ("BP2", 50.0, "West")] {
            coord
                .save_entity(
                    "partner",
                    id,
                    attrs(&[("revenue", Value::Number(revenue)), ("region", Value::String(region.into()))]),
                    BTreeMap::new(),
                )
                .await
                .unwrap();
        }

        let spec = QuerySpec {
            primary: "partner".into(),
            aggregate: Some(BTreeMap::from([("revenue".to_string(), crate::query::spec::AggregateOp::Sum)])),
            group_by: Some(vec!["region".to_string()]),
            ..Default::default()
        };
        let outcome = coord.query(&spec).await.unwrap();
        assert_eq!(outcome.strategy, Strategy::ColumnarOnly);
        assert_eq!(outcome.rows[0]["group"], "West");
        assert_eq!(outcome.rows[0]["value"], 150.0);
    }

    #[tokio::test]
    async fn hybrid_query_returns_full_records() {
        let (_dir, coord) = coordinator().await;
        coord
            .enable_columnar_storage(
                "partner",
                ColumnarConfig {
                    columns: BTreeSet::from(["region".to_string(), "revenue".to_string()]),
                    indexes: BTreeSet::from(["region".to_string()]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        coord
            .save_entity(
                "partner",
                "BP1",
                attrs(&[
                    ("region", Value::String("West".into())),
                    ("revenue", Value::Number(500.0)),
                    ("name", Value::String("Acme".into())),
                ]),
                BTreeMap::new(),
            )
            .await
            .unwrap();

        let spec = QuerySpec {
            primary: "partner".into(),
            where_clause: Some(crate::query::spec::WhereClause {
                attributes: BTreeMap::from([
                    (
                        "region".to_string(),
                        crate::query::spec::AttributePredicate::eq(Value::String("West".into())),
                    ),
                    (
                        "revenue".to_string(),
                        crate::query::spec::AttributePredicate {
                            gt: Some(Value::Number(0.0)),
                            ..Default::default()
                        },
                    ),
                ]),
                ..Default::default()
            }),
            include: Some(vec!["*".to_string()]),
            ..Default::default()
        };
        let outcome = coord.query(&spec).await.unwrap();
        assert_eq!(outcome.strategy, Strategy::Hybrid);
        assert_eq!(outcome.rows[0]["attributes"]["name"], "Acme");
    }

    #[tokio::test]
    async fn disable_then_query_forces_entity_only() {
        let (_dir, coord) = coordinator().await;
        coord
            .enable_columnar_storage(
                "partner",
                ColumnarConfig {
                    columns: BTreeSet::from(["revenue".to_string()]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        coord.disable_columnar_storage("partner").await;

        let spec = QuerySpec {
            primary: "partner".into(),
            aggregate: Some(BTreeMap::from([("revenue".to_string(), crate::query::spec::AggregateOp::Sum)])),
            ..Default::default()
        };
        let outcome = coord.query(&spec).await.unwrap();
        assert_eq!(outcome.strategy, Strategy::EntityOnly);
    }
}
