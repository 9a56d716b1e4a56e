//! Plan execution against the graph store.
//!
//! The gateway owns the batching contract: one store query per plan level for
//! the entity batch, one per relation key for traversals, never one per
//! parent. Property maps come back keyed by storage key and leave here keyed
//! by system name, filtered down to what the plan asked for.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::debug;
use uuid::Uuid;

use tessella_config::{ConfigResolver, SOURCE_RELATION};

use crate::error::{CoreError, Result};
use crate::expr::RelationKey;
use crate::plan::FetchPlan;
use crate::retry::with_retries;
use crate::store::{Direction, EdgeSelector, GraphStore, RelationRow};
use crate::tree::{FetchedTree, RelationEntry};

type RelationsByRoot = HashMap<i64, BTreeMap<i64, RelationEntry>>;

/// Executes fetch plans with batched store queries.
pub struct GraphGateway {
    store: Arc<dyn GraphStore>,
    resolver: Arc<ConfigResolver>,
}

impl GraphGateway {
    pub fn new(store: Arc<dyn GraphStore>, resolver: Arc<ConfigResolver>) -> Self {
        Self { store, resolver }
    }

    /// Fetches a batch of entities and every traversal the plan names.
    /// Entities the store does not return are omitted from the result.
    pub async fn fetch(
        &self,
        project: &str,
        entity_type_name: &str,
        ids: &[i64],
        plan: &FetchPlan,
    ) -> Result<BTreeMap<i64, FetchedTree>> {
        let project_id = self.resolver.project_id_by_name(project).await?;
        let entity_type_id = self
            .resolver
            .entity_type_id_by_name(project, entity_type_name)
            .await?;
        let mapping = self
            .resolver
            .entity_property_mapping(project, entity_type_name)
            .await?;

        let rows = with_retries("entities", || {
            self.store.entities(project_id, entity_type_id, ids)
        })
        .await?;
        debug!(
            project,
            entity_type = entity_type_name,
            requested = ids.len(),
            found = rows.len(),
            "fetched entity batch"
        );

        let mut trees = BTreeMap::new();
        for row in &rows {
            let decoded = decode_props(&row.properties, row.id)?;
            let mut e_props = filter_props(decoded, &mapping, &plan.e_props);
            e_props.insert("id".to_string(), json!(row.id));
            trees.insert(
                row.id,
                FetchedTree {
                    entity_type_id,
                    e_props,
                    relations: BTreeMap::new(),
                },
            );
        }

        let present: Vec<i64> = trees.keys().copied().collect();
        let mut relations = self
            .fetch_relations(project, project_id, entity_type_id, &present, plan)
            .await?;
        for (id, tree) in &mut trees {
            for (key, by_root) in &mut relations {
                if let Some(entries) = by_root.remove(id) {
                    tree.relations.insert(key.clone(), entries);
                }
            }
        }
        Ok(trees)
    }

    /// Resolves the plan's relation branches for roots that are already
    /// known to exist, skipping the root entity batch. Root property sets
    /// carry only `id`.
    pub async fn fetch_traversals(
        &self,
        project: &str,
        entity_type_name: &str,
        ids: &[i64],
        plan: &FetchPlan,
    ) -> Result<BTreeMap<i64, FetchedTree>> {
        let project_id = self.resolver.project_id_by_name(project).await?;
        let entity_type_id = self
            .resolver
            .entity_type_id_by_name(project, entity_type_name)
            .await?;

        let mut trees = BTreeMap::new();
        for id in ids {
            trees.insert(
                *id,
                FetchedTree {
                    entity_type_id,
                    e_props: BTreeMap::from([("id".to_string(), json!(*id))]),
                    relations: BTreeMap::new(),
                },
            );
        }
        let roots: Vec<i64> = trees.keys().copied().collect();
        let mut relations = self
            .fetch_relations(project, project_id, entity_type_id, &roots, plan)
            .await?;
        for (id, tree) in &mut trees {
            for (key, by_root) in &mut relations {
                if let Some(entries) = by_root.remove(id) {
                    tree.relations.insert(key.clone(), entries);
                }
            }
        }
        Ok(trees)
    }

    /// One traversal query per relation key of the plan, grouped by root id,
    /// recursing into deeper levels per distinct destination entity type.
    fn fetch_relations<'a>(
        &'a self,
        project: &'a str,
        project_id: Uuid,
        root_type_id: Uuid,
        root_ids: &'a [i64],
        plan: &'a FetchPlan,
    ) -> Pin<Box<dyn Future<Output = Result<BTreeMap<RelationKey, RelationsByRoot>>> + Send + 'a>>
    {
        Box::pin(async move {
            let mut result = BTreeMap::new();
            if root_ids.is_empty() {
                return Ok(result);
            }
            for (key, child_plan) in &plan.relations {
                let (selector, direction, relation_name) = match key {
                    RelationKey::Forward(name) => {
                        let id = self.resolver.relation_type_id_by_name(project, name).await?;
                        (EdgeSelector::Relation(id), Direction::Forward, name.as_str())
                    }
                    RelationKey::Inverse(name) => {
                        let id = self.resolver.relation_type_id_by_name(project, name).await?;
                        (EdgeSelector::Relation(id), Direction::Inverse, name.as_str())
                    }
                    RelationKey::Source => {
                        (EdgeSelector::Source, Direction::Forward, SOURCE_RELATION)
                    }
                };
                let r_mapping = self
                    .resolver
                    .relation_property_mapping(project, relation_name)
                    .await?;

                let rows = with_retries("traverse", || {
                    self.store
                        .traverse(project_id, root_type_id, selector, direction, root_ids)
                })
                .await?;
                debug!(
                    project,
                    relation = %key,
                    roots = root_ids.len(),
                    edges = rows.len(),
                    "traversed relation batch"
                );

                let mut by_root: RelationsByRoot = HashMap::new();
                for row in &rows {
                    let entry = self
                        .build_entry(project, row, &r_mapping, child_plan)
                        .await?;
                    by_root.entry(row.root_id).or_default().insert(row.id, entry);
                }

                self.attach_sources(
                    project, project_id, selector, direction, child_plan, &mut by_root,
                )
                .await?;
                self.attach_sub_relations(project, project_id, child_plan, &mut by_root)
                    .await?;

                result.insert(key.clone(), by_root);
            }
            Ok(result)
        })
    }

    async fn build_entry(
        &self,
        project: &str,
        row: &RelationRow,
        r_mapping: &BTreeMap<String, String>,
        child_plan: &FetchPlan,
    ) -> Result<RelationEntry> {
        // Relation properties sit on the edge row, so corruption there is
        // reported against the relation id, not the related entity.
        let decoded_r = decode_props(&row.properties, row.id)?;
        let mut r_props = filter_props(decoded_r, r_mapping, &child_plan.r_props);
        r_props.insert("id".to_string(), json!(row.id));

        let entity_type_name = self
            .resolver
            .entity_type_name_by_id(project, row.entity_type_id)
            .await?;
        let e_mapping = self
            .resolver
            .entity_property_mapping(project, &entity_type_name)
            .await?;
        let decoded_e = decode_props(&row.entity_properties, row.entity_id)?;
        let mut e_props = filter_props(decoded_e, &e_mapping, &child_plan.e_props);
        e_props.insert("id".to_string(), json!(row.entity_id));

        Ok(RelationEntry {
            r_props,
            entity_id: row.entity_id,
            entity_type_id: row.entity_type_id,
            e_props,
            relations: BTreeMap::new(),
            sources: BTreeMap::new(),
        })
    }

    /// Provenance edges of the relations at this level populate the entries'
    /// `sources`, not a sibling branch.
    async fn attach_sources(
        &self,
        project: &str,
        project_id: Uuid,
        selector: EdgeSelector,
        direction: Direction,
        child_plan: &FetchPlan,
        by_root: &mut RelationsByRoot,
    ) -> Result<()> {
        let Some(source_plan) = child_plan.relations.get(&RelationKey::Source) else {
            return Ok(());
        };
        let EdgeSelector::Relation(relation_type_id) = selector else {
            return Ok(());
        };
        let relation_ids: Vec<i64> = by_root
            .values()
            .flat_map(|entries| entries.keys().copied())
            .collect();
        if relation_ids.is_empty() {
            return Ok(());
        }

        let s_mapping = self
            .resolver
            .relation_property_mapping(project, SOURCE_RELATION)
            .await?;
        let rows = with_retries("relation_sources", || {
            self.store
                .relation_sources(project_id, relation_type_id, direction, &relation_ids)
        })
        .await?;

        let mut by_relation: HashMap<i64, BTreeMap<i64, RelationEntry>> = HashMap::new();
        for row in &rows {
            let decoded_r = decode_props(&row.properties, row.id)?;
            let mut r_props = filter_props(decoded_r, &s_mapping, &source_plan.r_props);
            r_props.insert("id".to_string(), json!(row.id));

            let entity_type_name = self
                .resolver
                .entity_type_name_by_id(project, row.entity_type_id)
                .await?;
            let e_mapping = self
                .resolver
                .entity_property_mapping(project, &entity_type_name)
                .await?;
            let decoded_e = decode_props(&row.entity_properties, row.entity_id)?;
            let mut e_props = filter_props(decoded_e, &e_mapping, &source_plan.e_props);
            e_props.insert("id".to_string(), json!(row.entity_id));

            by_relation.entry(row.relation_id).or_default().insert(
                row.id,
                RelationEntry {
                    r_props,
                    entity_id: row.entity_id,
                    entity_type_id: row.entity_type_id,
                    e_props,
                    relations: BTreeMap::new(),
                    sources: BTreeMap::new(),
                },
            );
        }
        for entries in by_root.values_mut() {
            for (relation_id, entry) in entries.iter_mut() {
                if let Some(sources) = by_relation.remove(relation_id) {
                    entry.sources = sources;
                }
            }
        }
        Ok(())
    }

    /// Deeper typed traversals recurse once per distinct destination entity
    /// type, over the deduplicated destination ids of that type.
    async fn attach_sub_relations(
        &self,
        project: &str,
        project_id: Uuid,
        child_plan: &FetchPlan,
        by_root: &mut RelationsByRoot,
    ) -> Result<()> {
        let has_typed_children = child_plan
            .relations
            .keys()
            .any(|key| *key != RelationKey::Source);
        if !has_typed_children {
            return Ok(());
        }

        let mut ids_by_type: BTreeMap<Uuid, BTreeSet<i64>> = BTreeMap::new();
        for entries in by_root.values() {
            for entry in entries.values() {
                ids_by_type
                    .entry(entry.entity_type_id)
                    .or_default()
                    .insert(entry.entity_id);
            }
        }

        for (type_id, ids) in ids_by_type {
            let ids: Vec<i64> = ids.into_iter().collect();
            let mut sub = self
                .fetch_relations(project, project_id, type_id, &ids, child_plan)
                .await?;
            sub.remove(&RelationKey::Source);
            for entries in by_root.values_mut() {
                for entry in entries.values_mut() {
                    if entry.entity_type_id != type_id {
                        continue;
                    }
                    for (key, by_sub_root) in &sub {
                        if let Some(sub_entries) = by_sub_root.get(&entry.entity_id) {
                            entry.relations.insert(key.clone(), sub_entries.clone());
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

fn decode_props(raw: &str, row_id: i64) -> Result<BTreeMap<String, Value>> {
    serde_json::from_str(raw).map_err(|source| CoreError::CorruptGraph { row_id, source })
}

/// Translates storage keys to system names, keeping only planned properties.
fn filter_props(
    decoded: BTreeMap<String, Value>,
    mapping: &BTreeMap<String, String>,
    wanted: &BTreeSet<String>,
) -> BTreeMap<String, Value> {
    decoded
        .into_iter()
        .filter_map(|(key, value)| {
            let name = mapping.get(&key)?;
            wanted.contains(name).then(|| (name.clone(), value))
        })
        .collect()
}
