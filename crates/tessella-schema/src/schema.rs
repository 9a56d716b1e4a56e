//! Permission-filtered query schema.
//!
//! A schema is derived at request time from one project's configuration and
//! one caller's permissions: one query type per readable entity type, one
//! traversal field per relation the type participates in, and mutation
//! fields mirroring the write grants. Building walks the whole configuration,
//! so schemas are cached per `(project, permissions fingerprint)` and purged
//! together with the configuration snapshot.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use tessella_config::{ConfigResolver, EntityTypeConfig, RelationTypeConfig};
use tessella_core::Direction;

use crate::error::Result;
use crate::permissions::{Permission, Permissions};

/// One traversal field of an entity query type.
#[derive(Debug, Clone)]
pub struct TraversalField {
    pub relation_type_id: Uuid,
    pub relation_name: String,
    pub direction: Direction,
    /// Readable relation data fields, always including `id`
    pub relation_fields: BTreeSet<String>,
    /// Destination entity types the caller may read
    pub targets: BTreeSet<String>,
}

/// Query and mutation surface of one entity type, for one caller.
#[derive(Debug, Clone)]
pub struct EntityQueryType {
    pub entity_type_id: Uuid,
    /// Readable data fields, always including `id`
    pub fields: BTreeSet<String>,
    /// Traversal fields keyed by their schema name (`r_<rtn>_s`, `ri_<rtn>_s`)
    pub traversals: BTreeMap<String, TraversalField>,
    /// Whether the `_source_` provenance edge is exposed
    pub source: bool,
    /// Fields writable through `post<ETN>`, when granted
    pub post: Option<BTreeSet<String>>,
    /// Fields writable through `put<ETN>`, when granted
    pub put: Option<BTreeSet<String>>,
    /// Whether `delete<ETN>` is granted
    pub delete: bool,
}

/// Typed schema of one project for one permission shape.
#[derive(Debug)]
pub struct ProjectSchema {
    pub project: String,
    pub fingerprint: u64,
    /// Entity query types keyed by entity type system name
    pub entities: BTreeMap<String, EntityQueryType>,
}

impl ProjectSchema {
    pub fn entity(&self, type_name: &str) -> Option<&EntityQueryType> {
        self.entities.get(type_name)
    }

    /// Names of all mutation fields the schema exposes.
    pub fn mutation_names(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        for (type_name, entity) in &self.entities {
            let suffix = pascal(type_name);
            if entity.post.is_some() {
                names.insert(format!("post{suffix}"));
            }
            if entity.put.is_some() {
                names.insert(format!("put{suffix}"));
            }
            if entity.delete {
                names.insert(format!("delete{suffix}"));
            }
        }
        names
    }
}

/// `film_reel` becomes `FilmReel`.
fn pascal(name: &str) -> String {
    name.split('_')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect()
}

type CacheKey = (String, u64);

/// Builds and caches permission-filtered schemas.
pub struct SchemaBuilder {
    resolver: Arc<ConfigResolver>,
    cache: RwLock<HashMap<CacheKey, Arc<ProjectSchema>>>,
}

impl SchemaBuilder {
    pub fn new(resolver: Arc<ConfigResolver>) -> Self {
        Self {
            resolver,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Schema for one project and one caller. Callers with the same
    /// permission fingerprint share the cached instance.
    pub async fn schema(
        &self,
        project: &str,
        permissions: &Permissions,
    ) -> Result<Arc<ProjectSchema>> {
        let fingerprint = permissions.fingerprint();
        let key = (project.to_string(), fingerprint);
        if let Some(schema) = self.cache.read().await.get(&key) {
            return Ok(Arc::clone(schema));
        }

        let schema = Arc::new(self.build(project, permissions, fingerprint).await?);
        debug!(
            project,
            fingerprint,
            entity_types = schema.entities.len(),
            "built schema"
        );
        self.cache
            .write()
            .await
            .insert(key, Arc::clone(&schema));
        Ok(schema)
    }

    /// Drops every cached schema of one project, across all permission
    /// shapes. Call together with [`ConfigResolver::invalidate`].
    pub async fn invalidate(&self, project: &str) {
        self.cache
            .write()
            .await
            .retain(|(cached, _), _| cached != project);
    }

    async fn build(
        &self,
        project: &str,
        permissions: &Permissions,
        fingerprint: u64,
    ) -> Result<ProjectSchema> {
        let entity_types = self.resolver.entity_types_config(project).await?;
        let relation_types = self.resolver.relation_types_config(project).await?;

        let readable: BTreeSet<&str> = entity_types
            .keys()
            .filter(|name| {
                permissions
                    .entity(project, name)
                    .map(|p| p.allows(Permission::Get))
                    .unwrap_or(false)
            })
            .map(String::as_str)
            .collect();
        let has_source_types = entity_types
            .iter()
            .any(|(name, config)| config.source && readable.contains(name.as_str()));

        let mut entities = BTreeMap::new();
        for (type_name, config) in &entity_types {
            if !readable.contains(type_name.as_str()) {
                continue;
            }
            let grants = match permissions.entity(project, type_name) {
                Some(grants) => grants,
                None => continue,
            };
            let traversals =
                traversal_fields(project, type_name, &relation_types, &readable, permissions);
            entities.insert(
                type_name.clone(),
                EntityQueryType {
                    entity_type_id: config.id,
                    fields: granted_fields(config, grants.fields(Permission::Get)),
                    traversals,
                    source: has_source_types,
                    post: grants
                        .fields(Permission::Post)
                        .map(|allowed| granted_fields(config, Some(allowed))),
                    put: grants
                        .fields(Permission::Put)
                        .map(|allowed| granted_fields(config, Some(allowed))),
                    delete: grants.allows(Permission::Delete),
                },
            );
        }

        Ok(ProjectSchema {
            project: project.to_string(),
            fingerprint,
            entities,
        })
    }
}

/// Intersection of the grant with the configured data fields, plus `id`.
fn granted_fields(config: &EntityTypeConfig, allowed: Option<&BTreeSet<String>>) -> BTreeSet<String> {
    let mut fields = BTreeSet::new();
    fields.insert("id".to_string());
    if let Some(allowed) = allowed {
        for field in config.data.values() {
            if allowed.contains(&field.system_name) {
                fields.insert(field.system_name.clone());
            }
        }
    }
    fields
}

fn traversal_fields(
    project: &str,
    type_name: &str,
    relation_types: &BTreeMap<String, Arc<RelationTypeConfig>>,
    readable: &BTreeSet<&str>,
    permissions: &Permissions,
) -> BTreeMap<String, TraversalField> {
    let mut traversals = BTreeMap::new();
    for (relation_name, relation) in relation_types {
        let grants = match permissions.relation(project, relation_name) {
            Some(grants) if grants.allows(Permission::Get) => grants,
            _ => continue,
        };
        let mut relation_fields = BTreeSet::new();
        relation_fields.insert("id".to_string());
        if let Some(allowed) = grants.fields(Permission::Get) {
            for field in relation.data.values() {
                if allowed.contains(&field.system_name) {
                    relation_fields.insert(field.system_name.clone());
                }
            }
        }

        if relation.domain_names.contains(type_name) {
            let targets: BTreeSet<String> = relation
                .range_names
                .iter()
                .filter(|name| readable.contains(name.as_str()))
                .cloned()
                .collect();
            if !targets.is_empty() {
                traversals.insert(
                    format!("r_{relation_name}_s"),
                    TraversalField {
                        relation_type_id: relation.id,
                        relation_name: relation_name.clone(),
                        direction: Direction::Forward,
                        relation_fields: relation_fields.clone(),
                        targets,
                    },
                );
            }
        }
        if relation.range_names.contains(type_name) {
            let targets: BTreeSet<String> = relation
                .domain_names
                .iter()
                .filter(|name| readable.contains(name.as_str()))
                .cloned()
                .collect();
            if !targets.is_empty() {
                traversals.insert(
                    format!("ri_{relation_name}_s"),
                    TraversalField {
                        relation_type_id: relation.id,
                        relation_name: relation_name.clone(),
                        direction: Direction::Inverse,
                        relation_fields,
                        targets,
                    },
                );
            }
        }
    }
    traversals
}
