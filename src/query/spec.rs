//! Query specification types shared by the row engine's filter scan, the
//! query analyzer, and the smart router (spec §4.4, §4.6).
//!
//! This is a structured query object, not parsed SQL text — a SQL front
//! end is an explicit Non-goal (spec §1).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    pub direction: SortDirection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregateOp {
    Sum,
    Avg,
    Count,
    Min,
    Max,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TraverseDirection {
    Out,
    In,
    Both,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Traversal {
    pub direction: TraverseDirection,
    pub edge_types: Option<Vec<String>>,
    pub max_depth: usize,
}

/// One attribute predicate: either bare-value shorthand (equality) or an
/// explicit set of operators (spec §4.4 filter semantics). Multiple
/// operators on one predicate (e.g. `{gt: 100, lt: 200}`) all apply
/// (conjunction within the predicate).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttributePredicate {
    pub eq: Option<Value>,
    pub ne: Option<Value>,
    pub gt: Option<Value>,
    pub gte: Option<Value>,
    pub lt: Option<Value>,
    pub lte: Option<Value>,
    #[serde(rename = "in")]
    pub in_: Option<Vec<Value>>,
    pub nin: Option<Vec<Value>>,
    pub exists: Option<bool>,
}

impl AttributePredicate {
    #[must_use]
    pub fn eq(value: Value) -> Self {
        Self {
            eq: Some(value),
            ..Self::default()
        }
    }

    /// Number of operator keys this predicate carries (used by the
    /// complexity score, spec §4.6).
    #[must_use]
    pub fn operator_count(&self) -> usize {
        [
            self.eq.is_some(),
            self.ne.is_some(),
            self.gt.is_some(),
            self.gte.is_some(),
            self.lt.is_some(),
            self.lte.is_some(),
            self.in_.is_some(),
            self.nin.is_some(),
            self.exists.is_some(),
        ]
        .into_iter()
        .filter(|b| *b)
        .count()
    }

    #[must_use]
    pub fn matches(&self, actual: &Value) -> bool {
        if let Some(v) = &self.eq {
            if actual != v {
                return false;
            }
        }
        if let Some(v) = &self.ne {
            if actual == v {
                return false;
            }
        }
        if let Some(v) = &self.gt {
            if !(actual > v) {
                return false;
            }
        }
        if let Some(v) = &self.gte {
            if !(actual >= v) {
                return false;
            }
        }
        if let Some(v) = &self.lt {
            if !(actual < v) {
                return false;
            }
        }
        if let Some(v) = &self.lte {
            if !(actual <= v) {
                return false;
            }
        }
        if let Some(vs) = &self.in_ {
            if !vs.contains(actual) {
                return false;
            }
        }
        if let Some(vs) = &self.nin {
            if vs.contains(actual) {
                return false;
            }
        }
        if let Some(expected_exists) = self.exists {
            let exists = !actual.is_null();
            if exists != expected_exists {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentPredicate {
    pub exists: Option<bool>,
    pub min_len: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EdgePredicate {
    #[serde(rename = "type")]
    pub edge_type: Option<String>,
    pub target: Option<String>,
    pub properties: Option<BTreeMap<String, Value>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WhereClause {
    pub attributes: BTreeMap<String, AttributePredicate>,
    pub documents: BTreeMap<String, DocumentPredicate>,
    pub edges: Vec<EdgePredicate>,
}

impl WhereClause {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty() && self.documents.is_empty() && self.edges.is_empty()
    }

    /// Predicate count used by the complexity score and hybrid selectivity
    /// estimate (spec §4.6): one per attribute predicate, counting nested
    /// operator keys.
    #[must_use]
    pub fn predicate_unit_count(&self) -> usize {
        let attr_units: usize = self.attributes.values().map(AttributePredicate::operator_count).sum();
        attr_units + self.documents.len() + self.edges.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForceStorage {
    Entity,
    Columnar,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuerySpec {
    pub primary: String,
    pub id: Option<String>,
    pub where_clause: Option<WhereClause>,
    pub include: Option<Vec<String>>,
    pub exclude: Option<Vec<String>>,
    pub offset: Option<usize>,
    pub limit: Option<usize>,
    pub aggregate: Option<BTreeMap<String, AggregateOp>>,
    pub group_by: Option<Vec<String>>,
    pub order_by: Option<Vec<OrderBy>>,
    pub traverse: Option<Traversal>,
    pub force_storage: Option<ForceStorage>,
}

impl QuerySpec {
    #[must_use]
    pub fn wants_full_records(&self) -> bool {
        match &self.include {
            Some(fields) => fields.iter().any(|f| f == "*"),
            None => self.aggregate.is_none() && self.group_by.is_none(),
        }
    }

    /// Union of where-clause, aggregate, `group_by`, and `order_by` keys
    /// (spec §4.6 "Required columns").
    #[must_use]
    pub fn required_columns(&self) -> Vec<String> {
        let mut cols = std::collections::BTreeSet::new();
        if let Some(w) = &self.where_clause {
            cols.extend(w.attributes.keys().cloned());
        }
        if let Some(agg) = &self.aggregate {
            cols.extend(agg.keys().cloned());
        }
        if let Some(group) = &self.group_by {
            cols.extend(group.iter().cloned());
        }
        if let Some(order) = &self.order_by {
            cols.extend(order.iter().map(|o| o.field.clone()));
        }
        cols.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn bare_eq_shorthand_matches() {
        let p = AttributePredicate::eq(Value::String("open".into()));
        assert!(p.matches(&Value::String("open".into())));
        assert!(!p.matches(&Value::String("closed".into())));
    }

    #[test]
    fn combined_gt_lt_is_conjunctive() {
        let p = AttributePredicate {
            gt: Some(Value::Number(100.0)),
            lt: Some(Value::Number(200.0)),
            ..Default::default()
        };
        assert!(p.matches(&Value::Number(150.0)));
        assert!(!p.matches(&Value::Number(50.0)));
        assert!(!p.matches(&Value::Number(250.0)));
    }

    #[test]
    fn exists_checks_non_null() {
        let p = AttributePredicate {
            exists: Some(true),
            ..Default::default()
        };
        assert!(p.matches(&Value::String("x".into())));
        assert!(!p.matches(&Value::Null));
    }

    #[test]
    fn required_columns_union_all_clauses() {
        let mut spec = QuerySpec {
            primary: "t".into(),
            ..Default::default()
        };
        spec.where_clause = Some(WhereClause {
            attributes: BTreeMap::from([("a".to_string(), AttributePredicate::eq(Value::Null))]),
            ..Default::default()
        });
        spec.group_by = Some(vec!["b".to_string()]);
        assert_eq!(spec.required_columns(), vec!["a".to_string(), "b".to_string()]);
    }
}
