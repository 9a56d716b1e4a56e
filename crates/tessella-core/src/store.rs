//! Abstract graph storage.
//!
//! The gateway is written against this seam; any store that supports
//! parameterized pattern queries with batched id filters can back it. Rows
//! carry their property maps as raw JSON text so the gateway can attribute a
//! parse failure to the offending entity.

use std::any::Any;
use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::error::StoreError;

/// Traversal direction over a typed relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Direction {
    Forward,
    Inverse,
}

/// Which edges a traversal query follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeSelector {
    /// Typed relation edges
    Relation(Uuid),
    /// Provenance edges
    Source,
}

/// One entity row; `properties` is a JSON object keyed by storage key.
#[derive(Debug, Clone)]
pub struct EntityRow {
    pub id: i64,
    pub properties: String,
}

/// One traversed edge together with its destination entity.
#[derive(Debug, Clone)]
pub struct RelationRow {
    /// Root entity the traversal started from
    pub root_id: i64,
    /// Relation id
    pub id: i64,
    /// Relation properties, JSON object keyed by storage key
    pub properties: String,
    pub entity_id: i64,
    pub entity_type_id: Uuid,
    pub entity_properties: String,
}

/// One provenance edge of a relation.
#[derive(Debug, Clone)]
pub struct SourceRow {
    /// Relation the provenance belongs to
    pub relation_id: i64,
    /// Source edge id
    pub id: i64,
    /// Source edge properties (`properties`, `source_props`)
    pub properties: String,
    pub entity_id: i64,
    pub entity_type_id: Uuid,
    pub entity_properties: String,
}

/// Read seam over the property graph. Entity and relation ids are unique
/// within their `(project, type)`.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Fetches a batch of entities by id. Missing ids are absent from the
    /// result, not an error.
    async fn entities(
        &self,
        project_id: Uuid,
        entity_type_id: Uuid,
        ids: &[i64],
    ) -> Result<Vec<EntityRow>, StoreError>;

    /// All entity ids of one type; drives reindexing.
    async fn entity_ids(
        &self,
        project_id: Uuid,
        entity_type_id: Uuid,
    ) -> Result<Vec<i64>, StoreError>;

    /// Traverses one edge kind for a batch of roots in a single query.
    async fn traverse(
        &self,
        project_id: Uuid,
        root_entity_type_id: Uuid,
        selector: EdgeSelector,
        direction: Direction,
        root_ids: &[i64],
    ) -> Result<Vec<RelationRow>, StoreError>;

    /// Provenance edges for a batch of relations of one type.
    async fn relation_sources(
        &self,
        project_id: Uuid,
        relation_type_id: Uuid,
        direction: Direction,
        relation_ids: &[i64],
    ) -> Result<Vec<SourceRow>, StoreError>;

    /// Opens a write transaction. All writes of one request share one
    /// transaction and roll back together.
    async fn begin(&self, project_id: Uuid) -> Result<Box<dyn GraphTransaction>, StoreError>;
}

/// Write seam; property maps are keyed by storage key.
#[async_trait]
pub trait GraphTransaction: Send {
    /// Current property map of an entity, or `None` if it does not exist.
    async fn entity_properties(
        &mut self,
        entity_type_id: Uuid,
        id: i64,
    ) -> Result<Option<BTreeMap<String, Value>>, StoreError>;

    /// Creates an entity and returns its new id.
    async fn create_entity(
        &mut self,
        entity_type_id: Uuid,
        properties: &BTreeMap<String, Value>,
    ) -> Result<i64, StoreError>;

    async fn update_entity(
        &mut self,
        entity_type_id: Uuid,
        id: i64,
        properties: &BTreeMap<String, Value>,
    ) -> Result<(), StoreError>;

    async fn delete_entity(&mut self, entity_type_id: Uuid, id: i64) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;

    /// Downcast hook so revision loggers can reach their concrete
    /// transaction type.
    fn as_any(&mut self) -> &mut dyn Any;
}
