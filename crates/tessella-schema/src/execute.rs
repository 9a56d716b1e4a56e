//! Client query execution.
//!
//! A client query is a tree: one entity type, a batch of ids, selected data
//! fields and nested traversal selections. Execution validates the tree
//! against the caller's schema, compiles it into fetch plans and resolves it
//! through the request context's loaders, so one request issues one graph
//! query per batch level and relation key no matter how many entities are in
//! flight. Execution never writes, which keeps transient-failure retries
//! safe.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use tessella_config::SOURCE_RELATION;
use tessella_core::{FetchPlan, GraphGateway, RelationEntry, RelationKey, RequestContext};

use crate::error::{Result, SchemaError};
use crate::schema::{EntityQueryType, ProjectSchema, TraversalField};

/// Fixed relation fields of a provenance edge.
const SOURCE_FIELDS: [&str; 3] = ["id", "properties", "source_props"];

/// Selection over the `_source_` provenance edges of an entity or relation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SourceSelection {
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default)]
    pub relation_fields: Vec<String>,
}

/// Selection over one traversal field.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TraversalSelection {
    /// Relation property names
    #[serde(default)]
    pub relation_fields: Vec<String>,
    /// Destination entity property names
    #[serde(default)]
    pub fields: Vec<String>,
    /// Nested traversals off the destination entities
    #[serde(default)]
    pub traversals: BTreeMap<String, TraversalSelection>,
    #[serde(default)]
    pub sources: Option<SourceSelection>,
}

/// One query against a project schema.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientQuery {
    pub entity_type: String,
    pub ids: Vec<i64>,
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default)]
    pub traversals: BTreeMap<String, TraversalSelection>,
    #[serde(default)]
    pub sources: Option<SourceSelection>,
}

/// Executes validated client queries against the graph.
pub struct QueryExecutor {
    gateway: Arc<GraphGateway>,
}

impl QueryExecutor {
    pub fn new(gateway: Arc<GraphGateway>) -> Self {
        Self { gateway }
    }

    /// Resolves the query and returns one JSON object per input id, in input
    /// order. Ids the store does not know are omitted.
    pub async fn execute(
        &self,
        schema: &ProjectSchema,
        context: &RequestContext,
        query: &ClientQuery,
    ) -> Result<Value> {
        let entity = schema
            .entity(&query.entity_type)
            .ok_or_else(|| SchemaError::not_found("entity type", &query.entity_type))?;
        for field in &query.fields {
            if !entity.fields.contains(field) {
                return Err(SchemaError::not_found("field", field));
            }
        }

        let mut root_plan = FetchPlan::new();
        root_plan.e_props.extend(query.fields.iter().cloned());
        if let Some(sources) = &query.sources {
            let plan = self.source_plan(schema, entity, sources)?;
            root_plan.relations.insert(RelationKey::Source, plan);
        }

        let trees = self
            .gateway
            .fetch(&schema.project, &query.entity_type, &query.ids, &root_plan)
            .await?;
        let parent_ids: Vec<i64> = trees.keys().copied().collect();

        // One loader flush per traversal field; nested selections resolve
        // inside the same flush through the plan tree.
        let mut loaded = BTreeMap::new();
        for (name, selection) in &query.traversals {
            let traversal = entity
                .traversals
                .get(name)
                .ok_or_else(|| SchemaError::not_found("traversal field", name))?;
            let child_plan = self.traversal_plan(schema, traversal, selection)?;
            let key = relation_key(traversal);
            let loader = context.relation_loader(&query.entity_type, key, &child_plan);
            let entries = loader
                .load(&self.gateway, &schema.project, &query.entity_type, &parent_ids)
                .await?;
            loaded.insert(name.clone(), entries);
        }

        let type_names = type_names(schema);
        let mut results = Vec::new();
        for id in &query.ids {
            let Some(tree) = trees.get(id) else {
                continue;
            };
            let mut object = render_props(&tree.e_props, &query.fields);
            for (name, selection) in &query.traversals {
                let entries = loaded
                    .get(name)
                    .and_then(|by_parent| by_parent.get(id))
                    .cloned()
                    .unwrap_or_default();
                object.insert(
                    name.clone(),
                    self.render_entries(schema, &type_names, &entries, selection),
                );
            }
            if let Some(sources) = &query.sources {
                let entries = tree
                    .relations
                    .get(&RelationKey::Source)
                    .cloned()
                    .unwrap_or_default();
                object.insert(
                    SOURCE_RELATION.to_string(),
                    render_sources(schema, &type_names, &entries, sources),
                );
            }
            results.push(Value::Object(object));
        }
        Ok(Value::Array(results))
    }

    /// Fetch plan for one traversal selection, recursing into nested
    /// traversals off the destination types.
    fn traversal_plan(
        &self,
        schema: &ProjectSchema,
        traversal: &TraversalField,
        selection: &TraversalSelection,
    ) -> Result<FetchPlan> {
        for field in &selection.relation_fields {
            if !traversal.relation_fields.contains(field) {
                return Err(SchemaError::not_found("relation field", field));
            }
        }
        for field in &selection.fields {
            if !target_has_field(schema, &traversal.targets, field) {
                return Err(SchemaError::not_found("field", field));
            }
        }

        let mut plan = FetchPlan::new();
        plan.e_props.extend(selection.fields.iter().cloned());
        plan.r_props.insert("id".to_string());
        plan.r_props.extend(selection.relation_fields.iter().cloned());

        for (name, nested) in &selection.traversals {
            let inner = traversal
                .targets
                .iter()
                .find_map(|target| schema.entity(target).and_then(|e| e.traversals.get(name)))
                .ok_or_else(|| SchemaError::not_found("traversal field", name))?;
            plan.relations
                .insert(relation_key(inner), self.traversal_plan(schema, inner, nested)?);
        }
        if let Some(sources) = &selection.sources {
            let target = traversal
                .targets
                .iter()
                .find_map(|name| schema.entity(name))
                .ok_or_else(|| SchemaError::not_found("traversal field", SOURCE_RELATION))?;
            plan.relations
                .insert(RelationKey::Source, self.source_plan(schema, target, sources)?);
        }
        Ok(plan)
    }

    fn source_plan(
        &self,
        schema: &ProjectSchema,
        parent: &EntityQueryType,
        selection: &SourceSelection,
    ) -> Result<FetchPlan> {
        if !parent.source {
            return Err(SchemaError::not_found("field", SOURCE_RELATION));
        }
        for field in &selection.relation_fields {
            if !SOURCE_FIELDS.contains(&field.as_str()) {
                return Err(SchemaError::not_found("relation field", field));
            }
        }
        let source_targets: BTreeSet<String> = schema.entities.keys().cloned().collect();
        for field in &selection.fields {
            if !target_has_field(schema, &source_targets, field) {
                return Err(SchemaError::not_found("field", field));
            }
        }
        let mut plan = FetchPlan::new();
        plan.e_props.extend(selection.fields.iter().cloned());
        plan.r_props.insert("id".to_string());
        plan.r_props.extend(selection.relation_fields.iter().cloned());
        Ok(plan)
    }

    fn render_entries(
        &self,
        schema: &ProjectSchema,
        type_names: &HashMap<Uuid, String>,
        entries: &BTreeMap<i64, RelationEntry>,
        selection: &TraversalSelection,
    ) -> Value {
        let mut rendered = Vec::new();
        for entry in entries.values() {
            // Entries whose destination type the caller may not read are
            // dropped, not errors.
            let Some(target) = type_names.get(&entry.entity_type_id) else {
                continue;
            };
            let Some(target_type) = schema.entity(target) else {
                continue;
            };
            let mut object = render_props(&entry.r_props, &selection.relation_fields);

            let permitted: Vec<String> = selection
                .fields
                .iter()
                .filter(|field| target_type.fields.contains(*field))
                .cloned()
                .collect();
            let mut entity = render_props(&entry.e_props, &permitted);
            entity.insert("__type".to_string(), json!(target));

            for (name, nested) in &selection.traversals {
                let Some(inner) = target_type.traversals.get(name) else {
                    continue;
                };
                let inner_entries = entry
                    .relations
                    .get(&relation_key(inner))
                    .cloned()
                    .unwrap_or_default();
                entity.insert(
                    name.clone(),
                    self.render_entries(schema, type_names, &inner_entries, nested),
                );
            }
            object.insert("entity".to_string(), Value::Object(entity));

            if let Some(sources) = &selection.sources {
                object.insert(
                    SOURCE_RELATION.to_string(),
                    render_sources(schema, type_names, &entry.sources, sources),
                );
            }
            rendered.push(Value::Object(object));
        }
        Value::Array(rendered)
    }
}

fn render_sources(
    schema: &ProjectSchema,
    type_names: &HashMap<Uuid, String>,
    entries: &BTreeMap<i64, RelationEntry>,
    selection: &SourceSelection,
) -> Value {
    let mut rendered = Vec::new();
    for entry in entries.values() {
        let Some(target) = type_names.get(&entry.entity_type_id) else {
            continue;
        };
        let Some(target_type) = schema.entity(target) else {
            continue;
        };
        let mut object = render_props(&entry.r_props, &selection.relation_fields);
        let permitted: Vec<String> = selection
            .fields
            .iter()
            .filter(|field| target_type.fields.contains(*field))
            .cloned()
            .collect();
        let mut entity = render_props(&entry.e_props, &permitted);
        entity.insert("__type".to_string(), json!(target));
        object.insert("entity".to_string(), Value::Object(entity));
        rendered.push(Value::Object(object));
    }
    Value::Array(rendered)
}

/// Object with `id` plus the selected properties; missing values render as
/// `null` so the response shape is stable across rows.
fn render_props(props: &BTreeMap<String, Value>, selected: &[String]) -> Map<String, Value> {
    let mut object = Map::new();
    object.insert(
        "id".to_string(),
        props.get("id").cloned().unwrap_or(Value::Null),
    );
    for name in selected {
        if name == "id" {
            continue;
        }
        object.insert(
            name.clone(),
            props.get(name).cloned().unwrap_or(Value::Null),
        );
    }
    object
}

/// Whether any readable destination type carries the field.
fn target_has_field(schema: &ProjectSchema, targets: &BTreeSet<String>, field: &str) -> bool {
    targets.iter().any(|target| {
        schema
            .entity(target)
            .map(|entity| entity.fields.contains(field))
            .unwrap_or(false)
    })
}

fn relation_key(traversal: &TraversalField) -> RelationKey {
    match traversal.direction {
        tessella_core::Direction::Forward => {
            RelationKey::Forward(traversal.relation_name.clone())
        }
        tessella_core::Direction::Inverse => {
            RelationKey::Inverse(traversal.relation_name.clone())
        }
    }
}

fn type_names(schema: &ProjectSchema) -> HashMap<Uuid, String> {
    schema
        .entities
        .iter()
        .map(|(name, entity)| (entity.entity_type_id, name.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    use tessella_core::testing::{films_project, Fixture, StubGraphStore};

    use crate::permissions::Permissions;
    use crate::schema::SchemaBuilder;
    use crate::testing::{catalogue_permissions, film_reader_permissions};

    struct World {
        fixture: Fixture,
        store: StubGraphStore,
        schema: Arc<ProjectSchema>,
        context: RequestContext,
        executor: QueryExecutor,
    }

    async fn world(permissions: &Permissions) -> World {
        let fixture = films_project();
        let store = StubGraphStore::default();
        let gateway = Arc::new(GraphGateway::new(
            Arc::new(store.clone()),
            Arc::clone(&fixture.resolver),
        ));
        let builder = SchemaBuilder::new(Arc::clone(&fixture.resolver));
        let schema = builder.schema("cinecos", permissions).await.unwrap();
        World {
            fixture,
            store,
            schema,
            context: RequestContext::new("cinecos", None),
            executor: QueryExecutor::new(gateway),
        }
    }

    fn query(raw: serde_json::Value) -> ClientQuery {
        serde_json::from_value(raw).unwrap()
    }

    #[tokio::test]
    async fn one_store_query_per_batch_level() {
        let w = world(&catalogue_permissions()).await;
        for id in 1..=50 {
            let props = if id == 2 {
                w.fixture.props("film", id, &[])
            } else {
                w.fixture
                    .props("film", id, &[("title", json!(format!("Film {id}")))])
            };
            w.store.insert_entity(w.fixture.film_type_id, id, props);
        }
        w.store.insert_entity(
            w.fixture.person_type_id,
            11,
            w.fixture.props("person", 11, &[("name", json!("Greta"))]),
        );
        w.store.insert_relation(
            w.fixture.cast_type_id,
            701,
            1,
            w.fixture.film_type_id,
            11,
            w.fixture.person_type_id,
            w.fixture.props("cast", 701, &[("order", json!("1"))]),
        );

        let mut ids: Vec<i64> = (1..=50).collect();
        ids.push(999);
        let result = w
            .executor
            .execute(
                &w.schema,
                &w.context,
                &query(json!({
                    "entity_type": "film",
                    "ids": ids,
                    "fields": ["title"],
                    "traversals": {
                        "r_cast_s": { "relation_fields": ["order"], "fields": ["name"] },
                    },
                })),
            )
            .await
            .unwrap();

        let rows = result.as_array().unwrap();
        assert_eq!(rows.len(), 50);
        assert_eq!(
            rows[0],
            json!({
                "id": 1,
                "title": "Film 1",
                "r_cast_s": [{
                    "id": 701,
                    "order": "1",
                    "entity": { "__type": "person", "id": 11, "name": "Greta" },
                }],
            })
        );
        // Requested but unset properties render as null, not absent.
        assert_eq!(rows[1]["title"], Value::Null);
        assert_eq!(rows[2]["r_cast_s"], json!([]));

        // One entity batch plus one traversal, however many roots.
        assert_eq!(w.store.entity_calls(), 1);
        assert_eq!(w.store.traverse_calls(), 1);
    }

    #[tokio::test]
    async fn nested_traversals_resolve_inside_the_parent_flush() {
        let w = world(&catalogue_permissions()).await;
        for (id, title) in [(1, "M"), (2, "Metropolis")] {
            w.store.insert_entity(
                w.fixture.film_type_id,
                id,
                w.fixture.props("film", id, &[("title", json!(title))]),
            );
        }
        w.store.insert_entity(
            w.fixture.person_type_id,
            11,
            w.fixture.props("person", 11, &[("name", json!("Fritz"))]),
        );
        w.store.insert_relation(
            w.fixture.cast_type_id,
            701,
            1,
            w.fixture.film_type_id,
            11,
            w.fixture.person_type_id,
            w.fixture.props("cast", 701, &[]),
        );
        w.store.insert_relation(
            w.fixture.director_type_id,
            702,
            2,
            w.fixture.film_type_id,
            11,
            w.fixture.person_type_id,
            w.fixture.props("director", 702, &[]),
        );

        let result = w
            .executor
            .execute(
                &w.schema,
                &w.context,
                &query(json!({
                    "entity_type": "film",
                    "ids": [1],
                    "traversals": {
                        "r_cast_s": {
                            "fields": ["name"],
                            "traversals": {
                                "ri_director_s": { "fields": ["title"] },
                            },
                        },
                    },
                })),
            )
            .await
            .unwrap();

        assert_eq!(
            result,
            json!([{
                "id": 1,
                "r_cast_s": [{
                    "id": 701,
                    "entity": {
                        "__type": "person",
                        "id": 11,
                        "name": "Fritz",
                        "ri_director_s": [{
                            "id": 702,
                            "entity": { "__type": "film", "id": 2, "title": "Metropolis" },
                        }],
                    },
                }],
            }])
        );
        assert_eq!(w.store.entity_calls(), 1);
        // One traversal query per level, the nested one batched over every
        // destination person.
        assert_eq!(w.store.traverse_calls(), 2);
    }

    #[tokio::test]
    async fn provenance_edges_render_for_roots_and_entries() {
        let w = world(&catalogue_permissions()).await;
        w.store.insert_entity(
            w.fixture.film_type_id,
            1,
            w.fixture.props("film", 1, &[("title", json!("M"))]),
        );
        w.store.insert_entity(
            w.fixture.person_type_id,
            11,
            w.fixture.props("person", 11, &[("name", json!("Fritz"))]),
        );
        w.store.insert_entity(
            w.fixture.book_type_id,
            21,
            w.fixture.props("book", 21, &[("title", json!("Cinema Yearbook"))]),
        );
        w.store.insert_relation(
            w.fixture.cast_type_id,
            701,
            1,
            w.fixture.film_type_id,
            11,
            w.fixture.person_type_id,
            w.fixture.props("cast", 701, &[]),
        );
        w.store.insert_entity_source(
            1,
            w.fixture.film_type_id,
            31,
            21,
            w.fixture.book_type_id,
            json!({ "properties": "p_1", "source_props": "title" }),
        );
        w.store.insert_relation_source(
            w.fixture.cast_type_id,
            701,
            41,
            21,
            w.fixture.book_type_id,
            json!({ "properties": "p_2" }),
        );

        let result = w
            .executor
            .execute(
                &w.schema,
                &w.context,
                &query(json!({
                    "entity_type": "film",
                    "ids": [1],
                    "fields": ["title"],
                    "sources": {
                        "fields": ["title"],
                        "relation_fields": ["properties", "source_props"],
                    },
                    "traversals": {
                        "r_cast_s": {
                            "fields": ["name"],
                            "sources": { "relation_fields": ["properties"] },
                        },
                    },
                })),
            )
            .await
            .unwrap();

        assert_eq!(
            result[0]["_source_"],
            json!([{
                "id": 31,
                "properties": "p_1",
                "source_props": "title",
                "entity": { "__type": "book", "id": 21, "title": "Cinema Yearbook" },
            }])
        );
        assert_eq!(
            result[0]["r_cast_s"][0]["_source_"],
            json!([{
                "id": 41,
                "properties": "p_2",
                "entity": { "__type": "book", "id": 21 },
            }])
        );
    }

    #[tokio::test]
    async fn selections_outside_the_schema_are_not_found() {
        let w = world(&catalogue_permissions()).await;

        let unknown_type = w
            .executor
            .execute(
                &w.schema,
                &w.context,
                &query(json!({ "entity_type": "studio", "ids": [1] })),
            )
            .await;
        assert!(matches!(
            unknown_type,
            Err(SchemaError::NotFound { kind: "entity type", .. })
        ));

        // `century` is configured but not granted; to this caller it does
        // not exist.
        let ungranted_field = w
            .executor
            .execute(
                &w.schema,
                &w.context,
                &query(json!({
                    "entity_type": "person",
                    "ids": [11],
                    "fields": ["century"],
                })),
            )
            .await;
        assert!(matches!(
            ungranted_field,
            Err(SchemaError::NotFound { kind: "field", .. })
        ));

        let unknown_traversal = w
            .executor
            .execute(
                &w.schema,
                &w.context,
                &query(json!({
                    "entity_type": "film",
                    "ids": [1],
                    "traversals": { "r_likes_s": {} },
                })),
            )
            .await;
        assert!(matches!(
            unknown_traversal,
            Err(SchemaError::NotFound { kind: "traversal field", .. })
        ));
    }

    #[tokio::test]
    async fn sources_require_a_readable_source_type() {
        let w = world(&film_reader_permissions()).await;
        let result = w
            .executor
            .execute(
                &w.schema,
                &w.context,
                &query(json!({
                    "entity_type": "film",
                    "ids": [1],
                    "sources": {},
                })),
            )
            .await;
        assert!(matches!(
            result,
            Err(SchemaError::NotFound { kind: "field", .. })
        ));
    }
}
