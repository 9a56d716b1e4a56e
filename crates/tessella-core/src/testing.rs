//! In-memory stubs for tests.
//!
//! `StubGraphStore` records how many queries each operation received so tests
//! can assert the batching contract, and `films_project` wires a small film
//! catalogue configuration through a real [`ConfigResolver`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use tessella_config::{
    keys, ConfigResolver, ConfigStore, EntityTypeRecord, ProjectRecord, RelationTypeRecord,
};

use crate::error::StoreError;
use crate::store::{
    Direction, EdgeSelector, EntityRow, GraphStore, GraphTransaction, RelationRow, SourceRow,
};

/// Fixed configuration store serving one project.
pub struct StaticConfigStore {
    pub project: ProjectRecord,
    pub entity_types: Vec<EntityTypeRecord>,
    pub relation_types: Vec<RelationTypeRecord>,
}

#[async_trait]
impl ConfigStore for StaticConfigStore {
    async fn get_project(
        &self,
        system_name: &str,
    ) -> tessella_config::Result<Option<ProjectRecord>> {
        Ok((system_name == self.project.system_name).then(|| self.project.clone()))
    }

    async fn list_entity_types(
        &self,
        _project_id: Uuid,
    ) -> tessella_config::Result<Vec<EntityTypeRecord>> {
        Ok(self.entity_types.clone())
    }

    async fn list_relation_types(
        &self,
        _project_id: Uuid,
    ) -> tessella_config::Result<Vec<RelationTypeRecord>> {
        Ok(self.relation_types.clone())
    }

    async fn create_entity_type(
        &self,
        _project_id: Uuid,
        _record: EntityTypeRecord,
    ) -> tessella_config::Result<()> {
        Err(tessella_config::ConfigError::Store(
            "static store is read-only".to_string(),
        ))
    }

    async fn create_relation_type(
        &self,
        _project_id: Uuid,
        _record: RelationTypeRecord,
    ) -> tessella_config::Result<()> {
        Err(tessella_config::ConfigError::Store(
            "static store is read-only".to_string(),
        ))
    }
}

/// Film catalogue fixture: films with cast and director relations, persons,
/// and books acting as provenance sources.
pub struct Fixture {
    pub resolver: Arc<ConfigResolver>,
    pub project_id: Uuid,
    pub film_type_id: Uuid,
    pub person_type_id: Uuid,
    pub book_type_id: Uuid,
    pub cast_type_id: Uuid,
    pub director_type_id: Uuid,
    /// system name → storage key, per entity/relation type system name
    prop_keys: HashMap<&'static str, HashMap<&'static str, String>>,
}

impl Fixture {
    /// JSON property object keyed by storage key, as the graph store returns
    /// it.
    pub fn props(&self, type_name: &str, id: i64, values: &[(&str, Value)]) -> Value {
        let mut object = Map::new();
        object.insert("id".to_string(), json!(id));
        if let Some(mapping) = self.prop_keys.get(type_name) {
            for (name, value) in values {
                if let Some(key) = mapping.get(name) {
                    object.insert(key.clone(), value.clone());
                }
            }
        }
        Value::Object(object)
    }

    pub fn storage_key(&self, type_name: &str, field_name: &str) -> String {
        self.prop_keys
            .get(type_name)
            .and_then(|mapping| mapping.get(field_name))
            .cloned()
            .unwrap_or_else(|| field_name.to_string())
    }
}

/// Builds the film catalogue project with a live resolver.
pub fn films_project() -> Fixture {
    let project_id = Uuid::new_v4();
    let film_type_id = Uuid::new_v4();
    let person_type_id = Uuid::new_v4();
    let book_type_id = Uuid::new_v4();
    let cast_type_id = Uuid::new_v4();
    let director_type_id = Uuid::new_v4();

    let title_id = Uuid::new_v4();
    let year_id = Uuid::new_v4();
    let genre_id = Uuid::new_v4();
    let name_id = Uuid::new_v4();
    let birth_id = Uuid::new_v4();
    let death_id = Uuid::new_v4();
    let century_id = Uuid::new_v4();
    let book_title_id = Uuid::new_v4();
    let order_id = Uuid::new_v4();

    let mut prop_keys: HashMap<&'static str, HashMap<&'static str, String>> = HashMap::new();
    prop_keys.insert(
        "film",
        HashMap::from([
            ("title", keys::prop_key(&title_id)),
            ("year", keys::prop_key(&year_id)),
            ("genre", keys::prop_key(&genre_id)),
        ]),
    );
    prop_keys.insert(
        "person",
        HashMap::from([
            ("name", keys::prop_key(&name_id)),
            ("date_of_birth", keys::prop_key(&birth_id)),
            ("date_of_death", keys::prop_key(&death_id)),
            ("century", keys::prop_key(&century_id)),
        ]),
    );
    prop_keys.insert(
        "book",
        HashMap::from([("title", keys::prop_key(&book_title_id))]),
    );
    prop_keys.insert("cast", HashMap::from([("order", keys::prop_key(&order_id))]));

    let store = StaticConfigStore {
        project: ProjectRecord {
            id: project_id,
            system_name: "cinecos".to_string(),
            display_name: "Cinecos".to_string(),
        },
        entity_types: vec![
            EntityTypeRecord {
                id: film_type_id,
                system_name: "film".to_string(),
                display_name: "Film".to_string(),
                config: json!({
                    "data": {
                        title_id.to_string(): {
                            "system_name": "title",
                            "type": "String",
                            "validators": [{ "type": "required" }],
                        },
                        year_id.to_string(): {
                            "system_name": "year",
                            "type": "String",
                            "validators": [{ "type": "regex", "regex": "^[0-9]{4}$" }],
                        },
                        genre_id.to_string(): { "system_name": "genre", "type": "[String]" },
                    },
                    "display": { "title": "$title" },
                }),
            },
            EntityTypeRecord {
                id: person_type_id,
                system_name: "person".to_string(),
                display_name: "Person".to_string(),
                config: json!({
                    "data": {
                        name_id.to_string(): { "system_name": "name", "type": "String" },
                        birth_id.to_string(): {
                            "system_name": "date_of_birth",
                            "type": "String",
                            "validators": [{ "type": "edtf_year" }],
                        },
                        death_id.to_string(): { "system_name": "date_of_death", "type": "String" },
                        century_id.to_string(): { "system_name": "century", "type": "[String]" },
                    },
                    "display": { "title": "$name" },
                }),
            },
            EntityTypeRecord {
                id: book_type_id,
                system_name: "book".to_string(),
                display_name: "Book".to_string(),
                config: json!({
                    "data": {
                        book_title_id.to_string(): { "system_name": "title", "type": "String" },
                    },
                    "display": { "title": "$title" },
                    "source": true,
                }),
            },
        ],
        relation_types: vec![
            RelationTypeRecord {
                id: cast_type_id,
                system_name: "cast".to_string(),
                display_name: "Cast".to_string(),
                config: json!({
                    "data": {
                        order_id.to_string(): { "system_name": "order", "type": "String" },
                    },
                }),
                domain_names: vec!["film".to_string()],
                range_names: vec!["person".to_string()],
            },
            RelationTypeRecord {
                id: director_type_id,
                system_name: "director".to_string(),
                display_name: "Director".to_string(),
                config: json!({}),
                domain_names: vec!["film".to_string()],
                range_names: vec!["person".to_string()],
            },
        ],
    };

    Fixture {
        resolver: Arc::new(ConfigResolver::new(Arc::new(store))),
        project_id,
        film_type_id,
        person_type_id,
        book_type_id,
        cast_type_id,
        director_type_id,
        prop_keys,
    }
}

struct StoredRelation {
    relation_type_id: Uuid,
    id: i64,
    start_id: i64,
    start_type_id: Uuid,
    end_id: i64,
    end_type_id: Uuid,
    properties: String,
}

struct StoredSource {
    relation_type_id: Uuid,
    relation_id: i64,
    id: i64,
    entity_id: i64,
    entity_type_id: Uuid,
    properties: String,
}

#[derive(Default)]
struct Inner {
    entities: Mutex<HashMap<(Uuid, i64), String>>,
    relations: Mutex<Vec<StoredRelation>>,
    relation_sources: Mutex<Vec<StoredSource>>,
    entity_sources: Mutex<Vec<StoredRelation>>,
    next_id: AtomicI64,
    entity_calls: AtomicUsize,
    traverse_calls: AtomicUsize,
    source_calls: AtomicUsize,
}

/// Recording in-memory graph store.
#[derive(Default, Clone)]
pub struct StubGraphStore {
    inner: Arc<Inner>,
}

fn locked<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl StubGraphStore {
    pub fn insert_entity(&self, entity_type_id: Uuid, id: i64, properties: Value) {
        self.insert_entity_raw(entity_type_id, id, properties.to_string());
        self.inner.next_id.fetch_max(id + 1, Ordering::SeqCst);
    }

    pub fn insert_entity_raw(&self, entity_type_id: Uuid, id: i64, properties: String) {
        locked(&self.inner.entities).insert((entity_type_id, id), properties);
    }

    #[allow(clippy::too_many_arguments)]
    pub fn insert_relation_raw(
        &self,
        relation_type_id: Uuid,
        id: i64,
        start_id: i64,
        start_type_id: Uuid,
        end_id: i64,
        end_type_id: Uuid,
        properties: String,
    ) {
        locked(&self.inner.relations).push(StoredRelation {
            relation_type_id,
            id,
            start_id,
            start_type_id,
            end_id,
            end_type_id,
            properties,
        });
    }

    #[allow(clippy::too_many_arguments)]
    pub fn insert_relation(
        &self,
        relation_type_id: Uuid,
        id: i64,
        start_id: i64,
        start_type_id: Uuid,
        end_id: i64,
        end_type_id: Uuid,
        properties: Value,
    ) {
        self.insert_relation_raw(
            relation_type_id,
            id,
            start_id,
            start_type_id,
            end_id,
            end_type_id,
            properties.to_string(),
        );
    }

    pub fn insert_relation_source(
        &self,
        relation_type_id: Uuid,
        relation_id: i64,
        id: i64,
        entity_id: i64,
        entity_type_id: Uuid,
        properties: Value,
    ) {
        locked(&self.inner.relation_sources).push(StoredSource {
            relation_type_id,
            relation_id,
            id,
            entity_id,
            entity_type_id,
            properties: properties.to_string(),
        });
    }

    pub fn insert_entity_source(
        &self,
        start_id: i64,
        start_type_id: Uuid,
        id: i64,
        end_id: i64,
        end_type_id: Uuid,
        properties: Value,
    ) {
        locked(&self.inner.entity_sources).push(StoredRelation {
            relation_type_id: Uuid::nil(),
            id,
            start_id,
            start_type_id,
            end_id,
            end_type_id,
            properties: properties.to_string(),
        });
    }

    pub fn entity_calls(&self) -> usize {
        self.inner.entity_calls.load(Ordering::SeqCst)
    }

    pub fn traverse_calls(&self) -> usize {
        self.inner.traverse_calls.load(Ordering::SeqCst)
    }

    pub fn source_calls(&self) -> usize {
        self.inner.source_calls.load(Ordering::SeqCst)
    }

    pub fn entity_exists(&self, entity_type_id: Uuid, id: i64) -> bool {
        locked(&self.inner.entities).contains_key(&(entity_type_id, id))
    }

    pub fn entity_properties(&self, entity_type_id: Uuid, id: i64) -> Option<Value> {
        locked(&self.inner.entities)
            .get(&(entity_type_id, id))
            .and_then(|raw| serde_json::from_str(raw).ok())
    }
}

#[async_trait]
impl GraphStore for StubGraphStore {
    async fn entities(
        &self,
        _project_id: Uuid,
        entity_type_id: Uuid,
        ids: &[i64],
    ) -> Result<Vec<EntityRow>, StoreError> {
        self.inner.entity_calls.fetch_add(1, Ordering::SeqCst);
        let entities = locked(&self.inner.entities);
        Ok(ids
            .iter()
            .filter_map(|id| {
                entities.get(&(entity_type_id, *id)).map(|properties| EntityRow {
                    id: *id,
                    properties: properties.clone(),
                })
            })
            .collect())
    }

    async fn entity_ids(
        &self,
        _project_id: Uuid,
        entity_type_id: Uuid,
    ) -> Result<Vec<i64>, StoreError> {
        let mut ids: Vec<i64> = locked(&self.inner.entities)
            .keys()
            .filter(|(type_id, _)| *type_id == entity_type_id)
            .map(|(_, id)| *id)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn traverse(
        &self,
        _project_id: Uuid,
        root_entity_type_id: Uuid,
        selector: EdgeSelector,
        direction: Direction,
        root_ids: &[i64],
    ) -> Result<Vec<RelationRow>, StoreError> {
        self.inner.traverse_calls.fetch_add(1, Ordering::SeqCst);
        let entities = locked(&self.inner.entities);
        let entity_props = |type_id: Uuid, id: i64| {
            entities
                .get(&(type_id, id))
                .cloned()
                .unwrap_or_else(|| "{}".to_string())
        };
        let rows = match selector {
            EdgeSelector::Relation(relation_type_id) => locked(&self.inner.relations)
                .iter()
                .filter(|relation| relation.relation_type_id == relation_type_id)
                .filter_map(|relation| match direction {
                    Direction::Forward
                        if relation.start_type_id == root_entity_type_id
                            && root_ids.contains(&relation.start_id) =>
                    {
                        Some(RelationRow {
                            root_id: relation.start_id,
                            id: relation.id,
                            properties: relation.properties.clone(),
                            entity_id: relation.end_id,
                            entity_type_id: relation.end_type_id,
                            entity_properties: entity_props(relation.end_type_id, relation.end_id),
                        })
                    }
                    Direction::Inverse
                        if relation.end_type_id == root_entity_type_id
                            && root_ids.contains(&relation.end_id) =>
                    {
                        Some(RelationRow {
                            root_id: relation.end_id,
                            id: relation.id,
                            properties: relation.properties.clone(),
                            entity_id: relation.start_id,
                            entity_type_id: relation.start_type_id,
                            entity_properties: entity_props(
                                relation.start_type_id,
                                relation.start_id,
                            ),
                        })
                    }
                    _ => None,
                })
                .collect(),
            EdgeSelector::Source => locked(&self.inner.entity_sources)
                .iter()
                .filter(|edge| {
                    edge.start_type_id == root_entity_type_id
                        && root_ids.contains(&edge.start_id)
                })
                .map(|edge| RelationRow {
                    root_id: edge.start_id,
                    id: edge.id,
                    properties: edge.properties.clone(),
                    entity_id: edge.end_id,
                    entity_type_id: edge.end_type_id,
                    entity_properties: entity_props(edge.end_type_id, edge.end_id),
                })
                .collect(),
        };
        Ok(rows)
    }

    async fn relation_sources(
        &self,
        _project_id: Uuid,
        relation_type_id: Uuid,
        _direction: Direction,
        relation_ids: &[i64],
    ) -> Result<Vec<SourceRow>, StoreError> {
        self.inner.source_calls.fetch_add(1, Ordering::SeqCst);
        let entities = locked(&self.inner.entities);
        Ok(locked(&self.inner.relation_sources)
            .iter()
            .filter(|source| {
                source.relation_type_id == relation_type_id
                    && relation_ids.contains(&source.relation_id)
            })
            .map(|source| SourceRow {
                relation_id: source.relation_id,
                id: source.id,
                properties: source.properties.clone(),
                entity_id: source.entity_id,
                entity_type_id: source.entity_type_id,
                entity_properties: entities
                    .get(&(source.entity_type_id, source.entity_id))
                    .cloned()
                    .unwrap_or_else(|| "{}".to_string()),
            })
            .collect())
    }

    async fn begin(&self, _project_id: Uuid) -> Result<Box<dyn GraphTransaction>, StoreError> {
        Ok(Box::new(StubTransaction {
            inner: Arc::clone(&self.inner),
            staged: Vec::new(),
        }))
    }
}

enum StagedWrite {
    Create {
        entity_type_id: Uuid,
        id: i64,
        properties: String,
    },
    Update {
        entity_type_id: Uuid,
        id: i64,
        properties: String,
    },
    Delete {
        entity_type_id: Uuid,
        id: i64,
    },
}

/// Transaction that stages writes and applies them on commit only.
pub struct StubTransaction {
    inner: Arc<Inner>,
    staged: Vec<StagedWrite>,
}

#[async_trait]
impl GraphTransaction for StubTransaction {
    async fn entity_properties(
        &mut self,
        entity_type_id: Uuid,
        id: i64,
    ) -> Result<Option<std::collections::BTreeMap<String, Value>>, StoreError> {
        let raw = match locked(&self.inner.entities).get(&(entity_type_id, id)) {
            Some(raw) => raw.clone(),
            None => return Ok(None),
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|error| StoreError::Backend(error.to_string()))
    }

    async fn create_entity(
        &mut self,
        entity_type_id: Uuid,
        properties: &std::collections::BTreeMap<String, Value>,
    ) -> Result<i64, StoreError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let mut with_id = properties.clone();
        with_id.insert("id".to_string(), json!(id));
        self.staged.push(StagedWrite::Create {
            entity_type_id,
            id,
            properties: serde_json::to_string(&with_id)
                .map_err(|error| StoreError::Backend(error.to_string()))?,
        });
        Ok(id)
    }

    async fn update_entity(
        &mut self,
        entity_type_id: Uuid,
        id: i64,
        properties: &std::collections::BTreeMap<String, Value>,
    ) -> Result<(), StoreError> {
        self.staged.push(StagedWrite::Update {
            entity_type_id,
            id,
            properties: serde_json::to_string(properties)
                .map_err(|error| StoreError::Backend(error.to_string()))?,
        });
        Ok(())
    }

    async fn delete_entity(&mut self, entity_type_id: Uuid, id: i64) -> Result<(), StoreError> {
        self.staged.push(StagedWrite::Delete { entity_type_id, id });
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let mut entities = locked(&self.inner.entities);
        for write in self.staged {
            match write {
                StagedWrite::Create {
                    entity_type_id,
                    id,
                    properties,
                }
                | StagedWrite::Update {
                    entity_type_id,
                    id,
                    properties,
                } => {
                    entities.insert((entity_type_id, id), properties);
                }
                StagedWrite::Delete { entity_type_id, id } => {
                    entities.remove(&(entity_type_id, id));
                }
            }
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }

    fn as_any(&mut self) -> &mut dyn std::any::Any {
        self
    }
}
