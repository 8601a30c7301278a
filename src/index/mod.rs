//! Secondary index manager over row-engine state (spec §4.3).
//!
//! Grounded on the teacher's `storage::btree` (ordered index over a
//! column's values) generalized from one on-disk B+Tree per table to one
//! in-memory ordered or hash index per indexed attribute — the row engine
//! is already an in-memory map (§4.4), so a paged B+Tree buys nothing here.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::entity::Entity;
use crate::error::{EngineError, EngineResult};
use crate::value::Value;

/// Attribute names auto-indexed on every entity type that uses them
/// (spec §4.3 "Auto-index").
pub const AUTO_INDEX_FIELDS: &[&str] = &["id", "type", "status", "category", "created", "updated"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    Hash,
    Ordered,
    InvertedWord,
}

/// Heuristic inference of index kind from a field name (spec §4.3:
/// "Index type is inferred from the field name (heuristic) unless
/// explicitly declared").
#[must_use]
pub fn infer_kind(field: &str) -> IndexKind {
    match field {
        "created" | "updated" => IndexKind::Ordered,
        f if f.ends_with("_at") || f.ends_with("_date") || f.contains("time") => IndexKind::Ordered,
        "id" | "type" | "status" | "category" => IndexKind::Hash,
        f if f.ends_with("_id") || f.ends_with("_type") => IndexKind::Hash,
        "description" | "text" | "body" | "content" | "name" => IndexKind::InvertedWord,
        _ => IndexKind::Hash,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOp {
    Eq,
    Gt,
    Gte,
    Lt,
    Lte,
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|s| !s.is_empty())
        .map(str::to_lowercase)
        .collect()
}

#[derive(Debug, Default)]
struct ValueIndex {
    by_value: BTreeMap<Value, BTreeSet<String>>,
}

impl ValueIndex {
    fn insert(&mut self, value: &Value, key: &str) {
        self.by_value
            .entry(value.clone())
            .or_default()
            .insert(key.to_string());
    }

    fn remove(&mut self, value: &Value, key: &str) {
        if let Some(set) = self.by_value.get_mut(value) {
            set.remove(key);
            if set.is_empty() {
                self.by_value.remove(value);
            }
        }
    }

    fn eq(&self, value: &Value) -> HashSet<String> {
        self.by_value
            .get(value)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn range(&self, op: ComparisonOp, value: &Value) -> HashSet<String> {
        let iter = self.by_value.iter();
        let matched: BTreeSet<String> = match op {
            ComparisonOp::Eq => return self.eq(value),
            ComparisonOp::Gt => iter.filter(|(v, _)| *v > value).flat_map(|(_, s)| s.clone()).collect(),
            ComparisonOp::Gte => iter.filter(|(v, _)| *v >= value).flat_map(|(_, s)| s.clone()).collect(),
            ComparisonOp::Lt => iter.filter(|(v, _)| *v < value).flat_map(|(_, s)| s.clone()).collect(),
            ComparisonOp::Lte => iter.filter(|(v, _)| *v <= value).flat_map(|(_, s)| s.clone()).collect(),
        };
        matched.into_iter().collect()
    }
}

#[derive(Debug, Default)]
struct WordIndex {
    by_token: BTreeMap<String, BTreeSet<String>>,
}

impl WordIndex {
    fn insert(&mut self, text: &str, key: &str) {
        for token in tokenize(text) {
            self.by_token.entry(token).or_default().insert(key.to_string());
        }
    }

    fn remove(&mut self, text: &str, key: &str) {
        for token in tokenize(text) {
            if let Some(set) = self.by_token.get_mut(&token) {
                set.remove(key);
                if set.is_empty() {
                    self.by_token.remove(&token);
                }
            }
        }
    }

    fn contains(&self, needle: &str) -> HashSet<String> {
        let needle = needle.to_lowercase();
        self.by_token
            .get(&needle)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[derive(Debug, Default)]
struct TypeIndexes {
    hash: BTreeMap<String, ValueIndex>,
    ordered: BTreeMap<String, ValueIndex>,
    words: BTreeMap<String, WordIndex>,
    edge_type_index: BTreeMap<String, BTreeSet<String>>,
    edge_target_index: BTreeMap<String, BTreeSet<String>>,
    declared: BTreeMap<String, IndexKind>,
}

impl TypeIndexes {
    fn kind_for(&self, field: &str) -> IndexKind {
        self.declared
            .get(field)
            .copied()
            .unwrap_or_else(|| infer_kind(field))
    }

    fn insert_field(&mut self, field: &str, value: &Value, key: &str) {
        match self.kind_for(field) {
            IndexKind::Hash => self.hash.entry(field.to_string()).or_default().insert(value, key),
            IndexKind::Ordered => self.ordered.entry(field.to_string()).or_default().insert(value, key),
            IndexKind::InvertedWord => {
                if let Some(text) = value.as_str() {
                    self.words.entry(field.to_string()).or_default().insert(text, key);
                }
            }
        }
    }

    fn remove_field(&mut self, field: &str, value: &Value, key: &str) {
        match self.kind_for(field) {
            IndexKind::Hash => {
                if let Some(idx) = self.hash.get_mut(field) {
                    idx.remove(value, key);
                }
            }
            IndexKind::Ordered => {
                if let Some(idx) = self.ordered.get_mut(field) {
                    idx.remove(value, key);
                }
            }
            IndexKind::InvertedWord => {
                if let (Some(idx), Some(text)) = (self.words.get_mut(field), value.as_str()) {
                    idx.remove(text, key);
                }
            }
        }
    }
}

/// Indexes secondary-access paths over the live entity map. Lifecycle per
/// spec §4.3: saves remove-then-reinsert, deletes only remove.
#[derive(Debug, Default)]
pub struct IndexManager {
    types: BTreeMap<String, TypeIndexes>,
}

impl IndexManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an explicit index kind for `(entity_type, field)`, overriding
    /// the name-based heuristic.
    pub fn declare(&mut self, entity_type: &str, field: &str, kind: IndexKind) {
        self.types
            .entry(entity_type.to_string())
            .or_default()
            .declared
            .insert(field.to_string(), kind);
    }

    /// Fields that get indexed for this entity: the fixed auto-index set
    /// (spec §4.3) plus any explicitly declared fields for the type.
    fn indexed_fields<'a>(entity: &'a Entity, type_idx: &TypeIndexes) -> impl Iterator<Item = (&'a str, &'a Value)> {
        let declared: BTreeSet<String> = type_idx.declared.keys().cloned().collect();
        entity
            .attributes
            .iter()
            .map(|(k, v)| (k.as_str(), v))
            .filter(move |(k, _)| AUTO_INDEX_FIELDS.contains(k) || declared.contains(*k))
    }

    pub fn index_entity(&mut self, entity: &Entity) {
        let key = entity.key();
        let type_idx = self.types.entry(entity.entity_type.clone()).or_default();
        let fields: Vec<(String, Value)> = Self::indexed_fields(entity, type_idx)
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        for (field, value) in &fields {
            type_idx.insert_field(field, value, &key);
        }
        for edge in &entity.edges {
            type_idx
                .edge_type_index
                .entry(edge.edge_type.clone())
                .or_default()
                .insert(key.clone());
            type_idx
                .edge_target_index
                .entry(edge.target.clone())
                .or_default()
                .insert(key.clone());
        }
    }

    pub fn remove_entity(&mut self, entity: &Entity) {
        let key = entity.key();
        let Some(type_idx) = self.types.get_mut(&entity.entity_type) else {
            return;
        };
        let fields: Vec<(String, Value)> = Self::indexed_fields(entity, type_idx)
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        for (field, value) in &fields {
            type_idx.remove_field(field, value, &key);
        }
        for edge in &entity.edges {
            if let Some(set) = type_idx.edge_type_index.get_mut(&edge.edge_type) {
                set.remove(&key);
            }
            if let Some(set) = type_idx.edge_target_index.get_mut(&edge.target) {
                set.remove(&key);
            }
        }
    }

    /// Remove then reinsert an entity's contributions (spec §4.3 save
    /// lifecycle).
    pub fn reindex(&mut self, old: Option<&Entity>, new: &Entity) {
        if let Some(old) = old {
            self.remove_entity(old);
        }
        self.index_entity(new);
    }

    pub fn eq(&self, entity_type: &str, field: &str, value: &Value) -> Option<HashSet<String>> {
        let type_idx = self.types.get(entity_type)?;
        match type_idx.kind_for(field) {
            IndexKind::Hash => type_idx.hash.get(field).map(|i| i.eq(value)),
            IndexKind::Ordered => type_idx.ordered.get(field).map(|i| i.eq(value)),
            IndexKind::InvertedWord => None,
        }
    }

    pub fn range(
        &self,
        entity_type: &str,
        field: &str,
        op: ComparisonOp,
        value: &Value,
    ) -> EngineResult<Option<HashSet<String>>> {
        let Some(type_idx) = self.types.get(entity_type) else {
            return Ok(None);
        };
        match type_idx.kind_for(field) {
            IndexKind::Ordered => Ok(type_idx.ordered.get(field).map(|i| i.range(op, value))),
            IndexKind::Hash if op == ComparisonOp::Eq => Ok(type_idx.hash.get(field).map(|i| i.eq(value))),
            IndexKind::Hash => Err(EngineError::UnsupportedOperation(format!(
                "range operator against hash-only index on {entity_type}.{field}"
            ))),
            IndexKind::InvertedWord => Ok(None),
        }
    }

    pub fn contains(&self, entity_type: &str, field: &str, needle: &str) -> Option<HashSet<String>> {
        self.types.get(entity_type)?.words.get(field).map(|i| i.contains(needle))
    }

    pub fn edge_type(&self, entity_type: &str, edge_type: &str) -> Option<HashSet<String>> {
        self.types
            .get(entity_type)?
            .edge_type_index
            .get(edge_type)
            .map(|s| s.iter().cloned().collect())
    }

    pub fn edge_target(&self, entity_type: &str, target: &str) -> Option<HashSet<String>> {
        self.types
            .get(entity_type)?
            .edge_target_index
            .get(target)
            .map(|s| s.iter().cloned().collect())
    }
}
