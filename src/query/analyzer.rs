//! Query classification (spec §4.6): decide which storage(s) should serve
//! a [`crate::query::QuerySpec`] before any data is touched.
//!
//! Grounded on the *pattern* of `neuroquantum-qsql::optimizer.rs` (classify
//! the incoming request, score it, hand the score to a plan builder) —
//! the classification rules themselves are this engine's own, since the
//! qsql optimizer classifies parsed SQL ASTs and this one classifies a
//! structured spec.

use serde::{Deserialize, Serialize};

use super::plan::Strategy;
use super::spec::{ForceStorage, QuerySpec};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    pub strategy: Strategy,
    pub complexity_score: u32,
    pub reason: String,
}

/// Classify a query against whether its primary entity type currently has
/// columnar projection configured (spec §4.6: routing never consults data
/// that isn't there — an unconfigured type always serves from the row
/// engine).
#[must_use]
pub fn classify(spec: &QuerySpec, columnar_configured: bool) -> Classification {
    let complexity_score = complexity(spec);

    if let Some(force) = spec.force_storage {
        let strategy = match force {
            ForceStorage::Entity => Strategy::EntityOnly,
            ForceStorage::Columnar => Strategy::ColumnarOnly,
        };
        return Classification {
            strategy,
            complexity_score,
            reason: "caller set force_storage".to_string(),
        };
    }

    let has_aggregate = spec.aggregate.is_some() || spec.group_by.is_some();

    // Rule 1: an aggregate/group_by query is ANALYTICAL regardless of
    // whether it also names an id — evaluated before the point-lookup rule.
    if has_aggregate {
        if !columnar_configured {
            return Classification {
                strategy: Strategy::EntityOnly,
                complexity_score,
                reason: format!("no columnar projection configured for '{}'", spec.primary),
            };
        }

        let wants_full = spec.wants_full_records();
        let (strategy, reason) = if wants_full {
            (
                Strategy::Hybrid,
                "aggregate query also requested full records".to_string(),
            )
        } else {
            (
                Strategy::ColumnarOnly,
                "aggregate/group_by query with no full-record projection".to_string(),
            )
        };
        return Classification {
            strategy,
            complexity_score,
            reason,
        };
    }

    // Rule 2: a single-id lookup with no aggregate is a transactional point
    // lookup.
    if spec.id.is_some() {
        return Classification {
            strategy: Strategy::EntityOnly,
            complexity_score,
            reason: "transactional point lookup by id".to_string(),
        };
    }

    if !columnar_configured {
        return Classification {
            strategy: Strategy::EntityOnly,
            complexity_score,
            reason: format!("no columnar projection configured for '{}'", spec.primary),
        };
    }

    let wants_full = spec.wants_full_records();
    let multi_predicate = spec.where_clause.as_ref().is_some_and(|w| w.predicate_unit_count() >= 2);
    let has_predicate = spec.where_clause.as_ref().is_some_and(|w| !w.is_empty());

    let (strategy, reason) = if multi_predicate && wants_full {
        (
            Strategy::Hybrid,
            "two-or-more where predicates requesting full records".to_string(),
        )
    } else if multi_predicate {
        (
            Strategy::ColumnarOnly,
            "two-or-more where predicates with a narrow field projection".to_string(),
        )
    } else if has_predicate {
        (
            Strategy::EntityOnly,
            "single where predicate requesting full records".to_string(),
        )
    } else {
        (Strategy::EntityOnly, "unfiltered scan".to_string())
    };

    Classification {
        strategy,
        complexity_score,
        reason,
    }
}

fn complexity(spec: &QuerySpec) -> u32 {
    let mut score = 0u32;
    if let Some(w) = &spec.where_clause {
        score += w.predicate_unit_count() as u32;
    }
    if let Some(agg) = &spec.aggregate {
        score += agg.len() as u32;
    }
    if let Some(group) = &spec.group_by {
        score += group.len() as u32 * 2;
    }
    if let Some(order) = &spec.order_by {
        score += order.len() as u32;
    }
    if let Some(traverse) = &spec.traverse {
        score += traverse.max_depth as u32 * 2;
    }
    score
}
