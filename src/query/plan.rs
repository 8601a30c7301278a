//! Execution plan shape produced by the analyzer and consumed by the
//! coordinator's smart router (spec §4.6, §4.7).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Strategy {
    /// Serve entirely from the row engine's in-memory map.
    EntityOnly,
    /// Serve entirely from column store projections.
    ColumnarOnly,
    /// Use column store for filtering/aggregation, row engine for the
    /// full-record fields the caller asked to include.
    Hybrid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub strategy: Strategy,
    pub reason: String,
    pub estimated_time_ms: u64,
    pub estimated_memory_bytes: u64,
    pub estimated_io_ops: u64,
    pub storages_used: Vec<String>,
    pub steps: Vec<String>,
}

impl ExecutionPlan {
    #[must_use]
    pub fn entity_only(reason: impl Into<String>) -> Self {
        Self {
            strategy: Strategy::EntityOnly,
            reason: reason.into(),
            estimated_time_ms: 1,
            estimated_memory_bytes: 4096,
            estimated_io_ops: 1,
            storages_used: vec!["row_engine".to_string()],
            steps: vec!["scan or point-lookup the in-memory entity map".to_string()],
        }
    }

    #[must_use]
    pub fn columnar_only(reason: impl Into<String>, group_count: usize) -> Self {
        Self {
            strategy: Strategy::ColumnarOnly,
            reason: reason.into(),
            estimated_time_ms: 2,
            estimated_memory_bytes: 1024 * (group_count.max(1) as u64),
            estimated_io_ops: 0,
            storages_used: vec!["column_store".to_string()],
            steps: vec![
                "filter columns by predicate".to_string(),
                "aggregate/group matching entity_id positions".to_string(),
            ],
        }
    }

    #[must_use]
    pub fn hybrid(reason: impl Into<String>) -> Self {
        Self {
            strategy: Strategy::Hybrid,
            reason: reason.into(),
            estimated_time_ms: 3,
            estimated_memory_bytes: 8192,
            estimated_io_ops: 1,
            storages_used: vec!["column_store".to_string(), "row_engine".to_string()],
            steps: vec![
                "filter columns by predicate to an entity_id set".to_string(),
                "fetch full records for that id set from the row engine".to_string(),
            ],
        }
    }
}
