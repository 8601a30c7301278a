//! Entity, edge, and metadata types (spec §3).
//!
//! Grounded on the teacher's `storage::row::Row` (typed field map + created/
//! updated timestamps) and `storage::types::TableSchema`/
//! `ForeignKeyConstraint` (typed-reference-by-key precedent for edges).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::value::Value;

/// Build the universal composite-key reference `type:id`.
#[must_use]
pub fn composite_key(entity_type: &str, id: &str) -> String {
    format!("{entity_type}:{id}")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityMetadata {
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub version: u64,
    pub schema_version: u32,
    pub tags: Option<Vec<String>>,
}

impl EntityMetadata {
    fn new_at(now: DateTime<Utc>) -> Self {
        Self {
            created: now,
            updated: now,
            version: 1,
            schema_version: 1,
            tags: None,
        }
    }

    /// Bump `version` and `updated` for a mutating save; `created` is left
    /// untouched (invariant 3, spec §3).
    fn bump(&mut self, now: DateTime<Utc>) {
        self.updated = now;
        self.version += 1;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Temporal {
    pub valid_from: DateTime<Utc>,
    pub valid_to: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub id: String,
    #[serde(rename = "type")]
    pub edge_type: String,
    pub target: String,
    pub properties: Option<BTreeMap<String, Value>>,
    pub weight: Option<f64>,
    pub temporal: Option<Temporal>,
}

impl Edge {
    pub fn validate(&self) -> EngineResult<()> {
        if self.id.is_empty() {
            return Err(EngineError::validation("edge id must not be empty"));
        }
        if self.edge_type.is_empty() {
            return Err(EngineError::validation("edge type must not be empty"));
        }
        if self.target.is_empty() {
            return Err(EngineError::validation("edge target must not be empty"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    #[serde(rename = "type")]
    pub entity_type: String,
    pub id: String,
    pub attributes: BTreeMap<String, Value>,
    pub documents: BTreeMap<String, Vec<BTreeMap<String, Value>>>,
    pub edges: Vec<Edge>,
    pub metadata: EntityMetadata,
}

impl Entity {
    /// Construct a fresh entity (first save). Normalizes nil collections
    /// to empty ones and sets `created`/`updated`/`version` per spec §4.4.
    pub fn new(
        entity_type: impl Into<String>,
        id: impl Into<String>,
        attributes: BTreeMap<String, Value>,
        documents: BTreeMap<String, Vec<BTreeMap<String, Value>>>,
        edges: Vec<Edge>,
        now: DateTime<Utc>,
    ) -> EngineResult<Self> {
        let entity_type = entity_type.into();
        let id = id.into();
        if entity_type.is_empty() || id.is_empty() {
            return Err(EngineError::validation(
                "entity type and id must be non-empty",
            ));
        }
        Ok(Self {
            entity_type,
            id,
            attributes,
            documents,
            edges,
            metadata: EntityMetadata::new_at(now),
        })
    }

    #[must_use]
    pub fn key(&self) -> String {
        composite_key(&self.entity_type, &self.id)
    }

    /// Apply an update save on top of an existing entity: replace
    /// attributes/documents/edges (edges are managed separately via
    /// `add_edge`/`remove_edge`, so a plain `save_entity` that supplies no
    /// edges preserves the prior edge list) and bump metadata.
    pub fn apply_update(
        &mut self,
        attributes: BTreeMap<String, Value>,
        documents: BTreeMap<String, Vec<BTreeMap<String, Value>>>,
        edges: Option<Vec<Edge>>,
        now: DateTime<Utc>,
    ) {
        self.attributes = attributes;
        self.documents = documents;
        if let Some(edges) = edges {
            self.edges = edges;
        }
        self.metadata.bump(now);
    }

    /// Replace semantics: an edge with the same id is removed first
    /// (invariant 4, spec §3).
    pub fn add_edge(&mut self, edge: Edge, now: DateTime<Utc>) -> EngineResult<()> {
        edge.validate()?;
        self.edges.retain(|e| e.id != edge.id);
        self.edges.push(edge);
        self.metadata.bump(now);
        Ok(())
    }

    /// Returns `true` if an edge was removed.
    pub fn remove_edge(&mut self, edge_id: &str, now: DateTime<Utc>) -> Option<Edge> {
        let pos = self.edges.iter().position(|e| e.id == edge_id)?;
        let removed = self.edges.remove(pos);
        self.metadata.bump(now);
        Some(removed)
    }

    /// Attribute lookup used by the index manager and filter engine;
    /// missing attributes project as `Value::Null`.
    #[must_use]
    pub fn attribute(&self, name: &str) -> Value {
        self.attributes.get(name).cloned().unwrap_or(Value::Null)
    }
}
