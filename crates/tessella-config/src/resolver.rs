//! Memoized configuration resolver.
//!
//! All name and id lookups the rest of the system performs go through this
//! resolver. Each project's configuration is loaded once, normalized into a
//! snapshot and cached until [`ConfigResolver::invalidate`] is called; lookups
//! after that point see the stored configuration again.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::json;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::error::{ConfigError, Result};
use crate::keys::{self, ALL_TYPES, RELATION_MARKER, RELATION_MARKER_KEY, SOURCE_RELATION};
use crate::model::{EntityTypeConfig, FieldKind, RelationTypeConfig, SearchFieldConfig, SearchFieldPart};
use crate::store::{ConfigStore, EntityTypeRecord, RelationTypeRecord};

/// Synthetic search field injected into every entity type so relation edit
/// forms can autocomplete on entity titles.
pub const EDIT_RELATION_TITLE: &str = "edit_relation_title";

/// Normalized, immutable view of one project's configuration.
#[derive(Debug)]
struct ProjectSnapshot {
    project_id: Uuid,
    entity_types: BTreeMap<String, Arc<EntityTypeConfig>>,
    entity_type_names: HashMap<Uuid, String>,
    relation_types: BTreeMap<String, Arc<RelationTypeConfig>>,
    relation_type_names: HashMap<Uuid, String>,
}

/// Caching front-end over a [`ConfigStore`].
pub struct ConfigResolver {
    store: Arc<dyn ConfigStore>,
    cache: RwLock<HashMap<String, Arc<ProjectSnapshot>>>,
}

impl ConfigResolver {
    pub fn new(store: Arc<dyn ConfigStore>) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Drops the cached snapshot for a project. The next lookup reloads from
    /// the store.
    pub async fn invalidate(&self, project_name: &str) {
        let removed = self.cache.write().await.remove(project_name).is_some();
        debug!(project = project_name, removed, "invalidated project snapshot");
    }

    pub async fn project_id_by_name(&self, project_name: &str) -> Result<Uuid> {
        Ok(self.snapshot(project_name).await?.project_id)
    }

    pub async fn entity_type_id_by_name(
        &self,
        project_name: &str,
        type_name: &str,
    ) -> Result<Uuid> {
        let snapshot = self.snapshot(project_name).await?;
        snapshot
            .entity_types
            .get(type_name)
            .map(|config| config.id)
            .ok_or_else(|| ConfigError::EntityTypeNotFound {
                project: project_name.to_string(),
                name: type_name.to_string(),
            })
    }

    pub async fn entity_type_name_by_id(
        &self,
        project_name: &str,
        type_id: Uuid,
    ) -> Result<String> {
        let snapshot = self.snapshot(project_name).await?;
        snapshot
            .entity_type_names
            .get(&type_id)
            .cloned()
            .ok_or(ConfigError::EntityTypeIdNotFound {
                project: project_name.to_string(),
                id: type_id,
            })
    }

    pub async fn relation_type_id_by_name(
        &self,
        project_name: &str,
        type_name: &str,
    ) -> Result<Uuid> {
        let snapshot = self.snapshot(project_name).await?;
        snapshot
            .relation_types
            .get(type_name)
            .map(|config| config.id)
            .ok_or_else(|| ConfigError::RelationTypeNotFound {
                project: project_name.to_string(),
                name: type_name.to_string(),
            })
    }

    pub async fn relation_type_name_by_id(
        &self,
        project_name: &str,
        type_id: Uuid,
    ) -> Result<String> {
        let snapshot = self.snapshot(project_name).await?;
        snapshot
            .relation_type_names
            .get(&type_id)
            .cloned()
            .ok_or_else(|| ConfigError::RelationTypeNotFound {
                project: project_name.to_string(),
                name: type_id.to_string(),
            })
    }

    /// All entity type configurations of a project, keyed by system name.
    pub async fn entity_types_config(
        &self,
        project_name: &str,
    ) -> Result<BTreeMap<String, Arc<EntityTypeConfig>>> {
        Ok(self.snapshot(project_name).await?.entity_types.clone())
    }

    /// All relation type configurations of a project, keyed by system name.
    pub async fn relation_types_config(
        &self,
        project_name: &str,
    ) -> Result<BTreeMap<String, Arc<RelationTypeConfig>>> {
        Ok(self.snapshot(project_name).await?.relation_types.clone())
    }

    pub async fn entity_type_config(
        &self,
        project_name: &str,
        type_name: &str,
    ) -> Result<Arc<EntityTypeConfig>> {
        let snapshot = self.snapshot(project_name).await?;
        snapshot
            .entity_types
            .get(type_name)
            .cloned()
            .ok_or_else(|| ConfigError::EntityTypeNotFound {
                project: project_name.to_string(),
                name: type_name.to_string(),
            })
    }

    pub async fn relation_type_config(
        &self,
        project_name: &str,
        type_name: &str,
    ) -> Result<Arc<RelationTypeConfig>> {
        let snapshot = self.snapshot(project_name).await?;
        snapshot
            .relation_types
            .get(type_name)
            .cloned()
            .ok_or_else(|| ConfigError::RelationTypeNotFound {
                project: project_name.to_string(),
                name: type_name.to_string(),
            })
    }

    /// Storage-key to system-name mapping for an entity type's properties.
    ///
    /// Always contains `id`. The pseudo-type [`ALL_TYPES`] yields the union
    /// over every entity type of the project, which lets callers decode
    /// properties of entities whose type is only known at runtime.
    pub async fn entity_property_mapping(
        &self,
        project_name: &str,
        type_name: &str,
    ) -> Result<BTreeMap<String, String>> {
        let snapshot = self.snapshot(project_name).await?;
        let mut mapping = BTreeMap::new();
        mapping.insert("id".to_string(), "id".to_string());
        if type_name == ALL_TYPES {
            for config in snapshot.entity_types.values() {
                for (field_id, field) in &config.data {
                    mapping.insert(keys::prop_key(field_id), field.system_name.clone());
                }
            }
        } else {
            let config = snapshot.entity_types.get(type_name).ok_or_else(|| {
                ConfigError::EntityTypeNotFound {
                    project: project_name.to_string(),
                    name: type_name.to_string(),
                }
            })?;
            for (field_id, field) in &config.data {
                mapping.insert(keys::prop_key(field_id), field.system_name.clone());
            }
        }
        Ok(mapping)
    }

    /// System-name to storage-key mapping for an entity type's properties.
    pub async fn entity_property_mapping_inverse(
        &self,
        project_name: &str,
        type_name: &str,
    ) -> Result<BTreeMap<String, String>> {
        let mapping = self.entity_property_mapping(project_name, type_name).await?;
        Ok(mapping.into_iter().map(|(key, name)| (name, key)).collect())
    }

    /// Storage-key to system-name mapping for a relation type's properties.
    ///
    /// The pseudo-relation [`SOURCE_RELATION`] has a fixed shape and the
    /// pseudo-type [`ALL_TYPES`] yields the union with the relation marker
    /// key included, mirroring how traversal rows are stored.
    pub async fn relation_property_mapping(
        &self,
        project_name: &str,
        type_name: &str,
    ) -> Result<BTreeMap<String, String>> {
        if type_name == SOURCE_RELATION {
            return Ok(source_property_mapping());
        }
        let snapshot = self.snapshot(project_name).await?;
        let mut mapping = BTreeMap::new();
        mapping.insert("id".to_string(), "id".to_string());
        if type_name == ALL_TYPES {
            mapping.insert(RELATION_MARKER_KEY.to_string(), RELATION_MARKER.to_string());
            for config in snapshot.relation_types.values() {
                for (field_id, field) in &config.data {
                    mapping.insert(keys::prop_key(field_id), field.system_name.clone());
                }
            }
        } else {
            let config = snapshot.relation_types.get(type_name).ok_or_else(|| {
                ConfigError::RelationTypeNotFound {
                    project: project_name.to_string(),
                    name: type_name.to_string(),
                }
            })?;
            for (field_id, field) in &config.data {
                mapping.insert(keys::prop_key(field_id), field.system_name.clone());
            }
        }
        Ok(mapping)
    }

    /// System-name to storage-key mapping for a relation type's properties.
    pub async fn relation_property_mapping_inverse(
        &self,
        project_name: &str,
        type_name: &str,
    ) -> Result<BTreeMap<String, String>> {
        let mapping = self
            .relation_property_mapping(project_name, type_name)
            .await?;
        Ok(mapping.into_iter().map(|(key, name)| (name, key)).collect())
    }

    /// Registers a new entity type. System names are checked against reserved
    /// names and existing types before the store is touched.
    pub async fn create_entity_type(
        &self,
        project_name: &str,
        record: EntityTypeRecord,
    ) -> Result<()> {
        if keys::is_reserved(&record.system_name) {
            return Err(ConfigError::ReservedName {
                name: record.system_name,
            });
        }
        let snapshot = self.snapshot(project_name).await?;
        if snapshot.entity_types.contains_key(&record.system_name) {
            return Err(ConfigError::Conflict {
                project: project_name.to_string(),
                name: record.system_name,
            });
        }
        debug!(
            project = project_name,
            entity_type = %record.system_name,
            "creating entity type"
        );
        self.store
            .create_entity_type(snapshot.project_id, record)
            .await?;
        self.invalidate(project_name).await;
        Ok(())
    }

    /// Registers a new relation type.
    pub async fn create_relation_type(
        &self,
        project_name: &str,
        record: RelationTypeRecord,
    ) -> Result<()> {
        if keys::is_reserved(&record.system_name) {
            return Err(ConfigError::ReservedName {
                name: record.system_name,
            });
        }
        let snapshot = self.snapshot(project_name).await?;
        if snapshot.relation_types.contains_key(&record.system_name) {
            return Err(ConfigError::Conflict {
                project: project_name.to_string(),
                name: record.system_name,
            });
        }
        debug!(
            project = project_name,
            relation_type = %record.system_name,
            "creating relation type"
        );
        self.store
            .create_relation_type(snapshot.project_id, record)
            .await?;
        self.invalidate(project_name).await;
        Ok(())
    }

    async fn snapshot(&self, project_name: &str) -> Result<Arc<ProjectSnapshot>> {
        if let Some(snapshot) = self.cache.read().await.get(project_name) {
            return Ok(Arc::clone(snapshot));
        }
        let snapshot = Arc::new(self.load(project_name).await?);
        self.cache
            .write()
            .await
            .insert(project_name.to_string(), Arc::clone(&snapshot));
        Ok(snapshot)
    }

    async fn load(&self, project_name: &str) -> Result<ProjectSnapshot> {
        let project = self
            .store
            .get_project(project_name)
            .await?
            .ok_or_else(|| ConfigError::ProjectNotFound {
                name: project_name.to_string(),
            })?;

        let mut entity_types = BTreeMap::new();
        let mut entity_type_names = HashMap::new();
        for record in self.store.list_entity_types(project.id).await? {
            let mut config = normalize_entity_type(&record)?;
            inject_edit_relation_title(&mut config);
            entity_type_names.insert(record.id, record.system_name.clone());
            entity_types.insert(record.system_name, Arc::new(config));
        }

        let mut relation_types = BTreeMap::new();
        let mut relation_type_names = HashMap::new();
        for record in self.store.list_relation_types(project.id).await? {
            let config = normalize_relation_type(&record)?;
            relation_type_names.insert(record.id, record.system_name.clone());
            relation_types.insert(record.system_name, Arc::new(config));
        }

        debug!(
            project = project_name,
            entity_types = entity_types.len(),
            relation_types = relation_types.len(),
            "loaded project snapshot"
        );

        Ok(ProjectSnapshot {
            project_id: project.id,
            entity_types,
            entity_type_names,
            relation_types,
            relation_type_names,
        })
    }
}

fn normalize_entity_type(record: &EntityTypeRecord) -> Result<EntityTypeConfig> {
    let mut value = record.config.clone();
    if let Some(object) = value.as_object_mut() {
        object.insert("id".to_string(), json!(record.id));
        object.insert("system_name".to_string(), json!(record.system_name));
        object.insert("display_name".to_string(), json!(record.display_name));
    }
    serde_json::from_value(value).map_err(|source| ConfigError::Invalid {
        name: record.system_name.clone(),
        source,
    })
}

fn normalize_relation_type(record: &RelationTypeRecord) -> Result<RelationTypeConfig> {
    let mut value = record.config.clone();
    if let Some(object) = value.as_object_mut() {
        object.insert("id".to_string(), json!(record.id));
        object.insert("system_name".to_string(), json!(record.system_name));
        object.insert("display_name".to_string(), json!(record.display_name));
        object.insert("domain_names".to_string(), json!(record.domain_names));
        object.insert("range_names".to_string(), json!(record.range_names));
    }
    serde_json::from_value(value).map_err(|source| ConfigError::Invalid {
        name: record.system_name.clone(),
        source,
    })
}

/// Adds the synthetic title autocomplete field unless the configuration
/// already defines one.
fn inject_edit_relation_title(config: &mut EntityTypeConfig) {
    if config.search_field(EDIT_RELATION_TITLE).is_some() {
        return;
    }
    let mut parts = BTreeMap::new();
    parts.insert(
        "id".to_string(),
        SearchFieldPart {
            kind: FieldKind::Integer,
            selector_value: "$id".to_string(),
        },
    );
    parts.insert(
        "value".to_string(),
        SearchFieldPart {
            kind: FieldKind::Text,
            selector_value: config.title_selector(),
        },
    );
    config.es_data.push(SearchFieldConfig {
        system_name: EDIT_RELATION_TITLE.to_string(),
        display_name: None,
        kind: FieldKind::NestedFlatten,
        selector_value: None,
        base: None,
        parts,
        filter: None,
        start: None,
        end: None,
        subtype: None,
    });
}

fn source_property_mapping() -> BTreeMap<String, String> {
    let mut mapping = BTreeMap::new();
    mapping.insert("id".to_string(), "id".to_string());
    mapping.insert("properties".to_string(), "properties".to_string());
    mapping.insert("source_props".to_string(), "source_props".to_string());
    mapping
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ConfigStore, ProjectRecord};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubStore {
        project: ProjectRecord,
        entity_types: std::sync::Mutex<Vec<EntityTypeRecord>>,
        relation_types: std::sync::Mutex<Vec<RelationTypeRecord>>,
        loads: AtomicUsize,
    }

    impl StubStore {
        fn new() -> Self {
            Self {
                project: ProjectRecord {
                    id: Uuid::new_v4(),
                    system_name: "cinecos".to_string(),
                    display_name: "Cinecos".to_string(),
                },
                entity_types: std::sync::Mutex::new(Vec::new()),
                relation_types: std::sync::Mutex::new(Vec::new()),
                loads: AtomicUsize::new(0),
            }
        }

        fn with_entity_type(self, record: EntityTypeRecord) -> Self {
            self.entity_types.lock().unwrap().push(record);
            self
        }

        fn with_relation_type(self, record: RelationTypeRecord) -> Self {
            self.relation_types.lock().unwrap().push(record);
            self
        }
    }

    #[async_trait]
    impl ConfigStore for StubStore {
        async fn get_project(&self, system_name: &str) -> Result<Option<ProjectRecord>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok((system_name == self.project.system_name).then(|| self.project.clone()))
        }

        async fn list_entity_types(&self, _project_id: Uuid) -> Result<Vec<EntityTypeRecord>> {
            Ok(self.entity_types.lock().unwrap().clone())
        }

        async fn list_relation_types(
            &self,
            _project_id: Uuid,
        ) -> Result<Vec<RelationTypeRecord>> {
            Ok(self.relation_types.lock().unwrap().clone())
        }

        async fn create_entity_type(
            &self,
            _project_id: Uuid,
            record: EntityTypeRecord,
        ) -> Result<()> {
            self.entity_types.lock().unwrap().push(record);
            Ok(())
        }

        async fn create_relation_type(
            &self,
            _project_id: Uuid,
            record: RelationTypeRecord,
        ) -> Result<()> {
            self.relation_types.lock().unwrap().push(record);
            Ok(())
        }
    }

    fn film_record(field_id: Uuid) -> EntityTypeRecord {
        EntityTypeRecord {
            id: Uuid::new_v4(),
            system_name: "film".to_string(),
            display_name: "Film".to_string(),
            config: json!({
                "data": { field_id.to_string(): { "system_name": "title", "type": "String" } },
                "display": { "title": "$title" },
            }),
        }
    }

    #[tokio::test]
    async fn snapshot_is_loaded_once_until_invalidated() {
        let field_id = Uuid::new_v4();
        let store = Arc::new(StubStore::new().with_entity_type(film_record(field_id)));
        let resolver = ConfigResolver::new(store.clone());

        resolver.entity_type_id_by_name("cinecos", "film").await.unwrap();
        resolver.entity_types_config("cinecos").await.unwrap();
        assert_eq!(store.loads.load(Ordering::SeqCst), 1);

        resolver.invalidate("cinecos").await;
        resolver.entity_types_config("cinecos").await.unwrap();
        assert_eq!(store.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn entity_property_mapping_always_contains_id() {
        let field_id = Uuid::new_v4();
        let store = Arc::new(StubStore::new().with_entity_type(film_record(field_id)));
        let resolver = ConfigResolver::new(store);

        let mapping = resolver
            .entity_property_mapping("cinecos", "film")
            .await
            .unwrap();
        assert_eq!(mapping.get("id").map(String::as_str), Some("id"));
        assert_eq!(
            mapping.get(&keys::prop_key(&field_id)).map(String::as_str),
            Some("title")
        );
    }

    #[tokio::test]
    async fn all_types_union_covers_every_entity_type() {
        let title_id = Uuid::new_v4();
        let name_id = Uuid::new_v4();
        let person = EntityTypeRecord {
            id: Uuid::new_v4(),
            system_name: "person".to_string(),
            display_name: "Person".to_string(),
            config: json!({
                "data": { name_id.to_string(): { "system_name": "name", "type": "String" } },
            }),
        };
        let store = Arc::new(
            StubStore::new()
                .with_entity_type(film_record(title_id))
                .with_entity_type(person),
        );
        let resolver = ConfigResolver::new(store);

        let mapping = resolver
            .entity_property_mapping("cinecos", ALL_TYPES)
            .await
            .unwrap();
        assert!(mapping.contains_key(&keys::prop_key(&title_id)));
        assert!(mapping.contains_key(&keys::prop_key(&name_id)));
    }

    #[tokio::test]
    async fn relation_all_types_mapping_includes_marker() {
        let director_id = Uuid::new_v4();
        let store = Arc::new(StubStore::new().with_relation_type(RelationTypeRecord {
            id: director_id,
            system_name: "director".to_string(),
            display_name: "Director".to_string(),
            config: json!({}),
            domain_names: vec!["film".to_string()],
            range_names: vec!["person".to_string()],
        }));
        let resolver = ConfigResolver::new(store);

        let mapping = resolver
            .relation_property_mapping("cinecos", ALL_TYPES)
            .await
            .unwrap();
        assert_eq!(
            mapping.get(RELATION_MARKER_KEY).map(String::as_str),
            Some(RELATION_MARKER)
        );
    }

    #[tokio::test]
    async fn source_relation_mapping_is_fixed() {
        let store = Arc::new(StubStore::new());
        let resolver = ConfigResolver::new(store);

        let mapping = resolver
            .relation_property_mapping("cinecos", SOURCE_RELATION)
            .await
            .unwrap();
        assert_eq!(
            mapping.keys().cloned().collect::<Vec<_>>(),
            vec!["id", "properties", "source_props"]
        );
    }

    #[tokio::test]
    async fn edit_relation_title_is_injected() {
        let field_id = Uuid::new_v4();
        let store = Arc::new(StubStore::new().with_entity_type(film_record(field_id)));
        let resolver = ConfigResolver::new(store);

        let config = resolver
            .entity_type_config("cinecos", "film")
            .await
            .unwrap();
        let injected = config.search_field(EDIT_RELATION_TITLE).unwrap();
        assert_eq!(injected.kind, FieldKind::NestedFlatten);
        assert_eq!(injected.parts["value"].selector_value, "$title");
    }

    #[tokio::test]
    async fn reserved_and_duplicate_names_are_rejected() {
        let field_id = Uuid::new_v4();
        let store = Arc::new(StubStore::new().with_entity_type(film_record(field_id)));
        let resolver = ConfigResolver::new(store);

        let reserved = EntityTypeRecord {
            id: Uuid::new_v4(),
            system_name: ALL_TYPES.to_string(),
            display_name: "All".to_string(),
            config: json!({}),
        };
        assert!(matches!(
            resolver.create_entity_type("cinecos", reserved).await,
            Err(ConfigError::ReservedName { .. })
        ));

        let duplicate = EntityTypeRecord {
            id: Uuid::new_v4(),
            system_name: "film".to_string(),
            display_name: "Film".to_string(),
            config: json!({}),
        };
        assert!(matches!(
            resolver.create_entity_type("cinecos", duplicate).await,
            Err(ConfigError::Conflict { .. })
        ));
    }

    #[tokio::test]
    async fn unknown_project_is_reported() {
        let resolver = ConfigResolver::new(Arc::new(StubStore::new()));
        assert!(matches!(
            resolver.project_id_by_name("nope").await,
            Err(ConfigError::ProjectNotFound { .. })
        ));
    }
}
