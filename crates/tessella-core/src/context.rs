//! Request-scoped state.
//!
//! Traversal resolution during schema execution goes through per-request
//! loaders so one request tick issues one graph query per relation key,
//! regardless of how many parent entities are in flight.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use uuid::Uuid;

use crate::error::Result;
use crate::expr::RelationKey;
use crate::gateway::GraphGateway;
use crate::plan::FetchPlan;
use crate::tree::RelationEntry;

type LoaderKey = (String, RelationKey, String);
type Entries = Arc<BTreeMap<i64, RelationEntry>>;

/// Ambient state of one request.
pub struct RequestContext {
    pub project_name: String,
    pub user_id: Option<Uuid>,
    loaders: Mutex<HashMap<LoaderKey, Arc<RelationLoader>>>,
}

impl RequestContext {
    pub fn new(project_name: impl Into<String>, user_id: Option<Uuid>) -> Self {
        Self {
            project_name: project_name.into(),
            user_id,
            loaders: Mutex::new(HashMap::new()),
        }
    }

    /// Loader for one traversal off one parent entity type. The same
    /// `(parent type, relation key, props signature)` always yields the same
    /// loader within a request.
    pub fn relation_loader(
        &self,
        parent_type: &str,
        key: RelationKey,
        child_plan: &FetchPlan,
    ) -> Arc<RelationLoader> {
        let signature = props_signature(child_plan);
        let mut loaders = self
            .loaders
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        loaders
            .entry((parent_type.to_string(), key.clone(), signature))
            .or_insert_with(|| Arc::new(RelationLoader::new(key, child_plan.clone())))
            .clone()
    }
}

/// Batching cache for one traversal. Parent ids already loaded are answered
/// from memory; the rest go to the gateway in a single fetch.
pub struct RelationLoader {
    relation_key: RelationKey,
    plan: FetchPlan,
    cache: tokio::sync::Mutex<HashMap<i64, Entries>>,
}

impl RelationLoader {
    fn new(relation_key: RelationKey, child_plan: FetchPlan) -> Self {
        let mut plan = FetchPlan::new();
        plan.relations.insert(relation_key.clone(), child_plan);
        Self {
            relation_key,
            plan,
            cache: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Loads the traversal entries for a batch of parent ids. Parents without
    /// entries map to an empty set.
    pub async fn load(
        &self,
        gateway: &GraphGateway,
        project: &str,
        parent_type: &str,
        parent_ids: &[i64],
    ) -> Result<HashMap<i64, Entries>> {
        let mut cache = self.cache.lock().await;
        let missing: Vec<i64> = {
            let mut seen = std::collections::BTreeSet::new();
            parent_ids
                .iter()
                .copied()
                .filter(|id| !cache.contains_key(id) && seen.insert(*id))
                .collect()
        };
        if !missing.is_empty() {
            let mut trees = gateway
                .fetch_traversals(project, parent_type, &missing, &self.plan)
                .await?;
            for id in &missing {
                let entries = trees
                    .remove(id)
                    .and_then(|mut tree| tree.relations.remove(&self.relation_key))
                    .unwrap_or_default();
                cache.insert(*id, Arc::new(entries));
            }
        }
        Ok(parent_ids
            .iter()
            .filter_map(|id| cache.get(id).map(|entries| (*id, Arc::clone(entries))))
            .collect())
    }
}

/// Stable fingerprint of the property set a plan fetches, used to share
/// loaders between resolvers asking for the same data.
pub fn props_signature(plan: &FetchPlan) -> String {
    let mut parts: Vec<String> = Vec::new();
    parts.extend(plan.e_props.iter().map(|name| format!("e:{name}")));
    parts.extend(plan.r_props.iter().map(|name| format!("r:{name}")));
    for (key, child) in &plan.relations {
        parts.push(format!("{key}({})", props_signature(child)));
    }
    parts.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{films_project, StubGraphStore};
    use serde_json::json;

    fn child_plan() -> FetchPlan {
        let mut plan = FetchPlan::new();
        plan.e_props.insert("name".to_string());
        plan.r_props.insert("id".to_string());
        plan
    }

    #[tokio::test]
    async fn one_flush_is_one_traversal_query() {
        let fixture = films_project();
        let store = Arc::new(StubGraphStore::default());
        for film in 1..=50 {
            store.insert_entity(fixture.film_type_id, film, fixture.props("film", film, &[]));
            store.insert_entity(
                fixture.person_type_id,
                1000 + film,
                fixture.props("person", 1000 + film, &[("name", json!("p"))]),
            );
            store.insert_relation(
                fixture.cast_type_id,
                film,
                film,
                fixture.film_type_id,
                1000 + film,
                fixture.person_type_id,
                json!({}),
            );
        }
        let gateway = GraphGateway::new(store.clone(), fixture.resolver.clone());
        let context = RequestContext::new("cinecos", None);
        let key = RelationKey::Forward("cast".to_string());
        let loader = context.relation_loader("film", key, &child_plan());

        let parent_ids: Vec<i64> = (1..=50).collect();
        let loaded = loader
            .load(&gateway, "cinecos", "film", &parent_ids)
            .await
            .unwrap();
        assert_eq!(loaded.len(), 50);
        assert_eq!(store.entity_calls(), 0);
        assert_eq!(store.traverse_calls(), 1);
    }

    #[tokio::test]
    async fn repeated_loads_hit_the_cache() {
        let fixture = films_project();
        let store = Arc::new(StubGraphStore::default());
        store.insert_entity(fixture.film_type_id, 1, fixture.props("film", 1, &[]));
        let gateway = GraphGateway::new(store.clone(), fixture.resolver.clone());
        let context = RequestContext::new("cinecos", None);
        let key = RelationKey::Forward("cast".to_string());
        let loader = context.relation_loader("film", key, &child_plan());

        loader.load(&gateway, "cinecos", "film", &[1]).await.unwrap();
        let second = loader.load(&gateway, "cinecos", "film", &[1]).await.unwrap();
        assert!(second[&1].is_empty());
        assert_eq!(store.traverse_calls(), 1);
    }

    #[test]
    fn loaders_are_shared_per_key_and_signature() {
        let context = RequestContext::new("cinecos", None);
        let key = RelationKey::Forward("cast".to_string());
        let a = context.relation_loader("film", key.clone(), &child_plan());
        let b = context.relation_loader("film", key.clone(), &child_plan());
        assert!(Arc::ptr_eq(&a, &b));

        let mut other = child_plan();
        other.e_props.insert("date_of_birth".to_string());
        let c = context.relation_loader("film", key, &other);
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
