//! Storage trait for project configuration.
//!
//! The resolver is agnostic about where configuration lives; deployments back
//! this trait with a relational database, the tests back it with an in-memory
//! map.

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::error::Result;

/// Raw project row.
#[derive(Debug, Clone)]
pub struct ProjectRecord {
    pub id: Uuid,
    pub system_name: String,
    pub display_name: String,
}

/// Raw entity type row; `config` is the JSON blob that deserializes into
/// [`EntityTypeConfig`](crate::model::EntityTypeConfig).
#[derive(Debug, Clone)]
pub struct EntityTypeRecord {
    pub id: Uuid,
    pub system_name: String,
    pub display_name: String,
    pub config: Value,
}

/// Raw relation type row with its domain and range entity type names.
#[derive(Debug, Clone)]
pub struct RelationTypeRecord {
    pub id: Uuid,
    pub system_name: String,
    pub display_name: String,
    pub config: Value,
    pub domain_names: Vec<String>,
    pub range_names: Vec<String>,
}

/// Backing store for per-project configuration.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn get_project(&self, system_name: &str) -> Result<Option<ProjectRecord>>;

    async fn list_entity_types(&self, project_id: Uuid) -> Result<Vec<EntityTypeRecord>>;

    async fn list_relation_types(&self, project_id: Uuid) -> Result<Vec<RelationTypeRecord>>;

    /// Inserts a new entity type row. The resolver performs name checks
    /// before calling this.
    async fn create_entity_type(
        &self,
        project_id: Uuid,
        record: EntityTypeRecord,
    ) -> Result<()>;

    /// Inserts a new relation type row.
    async fn create_relation_type(
        &self,
        project_id: Uuid,
        record: RelationTypeRecord,
    ) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn _assert_object_safe(_: &dyn ConfigStore) {}
}
