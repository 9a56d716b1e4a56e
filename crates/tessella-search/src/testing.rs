//! In-memory stubs and a search-configured project fixture for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use tessella_config::{
    keys, ConfigResolver, EntityTypeRecord, ProjectRecord, RelationTypeRecord,
};
use tessella_core::testing::{StaticConfigStore, StubGraphStore};
use tessella_core::GraphGateway;

use crate::docstore::{AliasAction, BulkDoc, DocStore, DocStoreError};
use crate::jobs::{JobStore, JobStoreError};

fn locked<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Film catalogue with a configured search surface: films carry scalar,
/// list, integer and nested fields, persons carry EDTF intervals and
/// uncertain centuries.
pub struct SearchFixture {
    pub resolver: Arc<ConfigResolver>,
    pub graph: StubGraphStore,
    pub gateway: Arc<GraphGateway>,
    pub project_id: Uuid,
    pub film_type_id: Uuid,
    pub person_type_id: Uuid,
    pub cast_type_id: Uuid,
    prop_keys: HashMap<&'static str, HashMap<&'static str, String>>,
}

impl SearchFixture {
    /// JSON property object keyed by storage key.
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
}

pub fn catalog_project() -> SearchFixture {
    let project_id = Uuid::new_v4();
    let film_type_id = Uuid::new_v4();
    let person_type_id = Uuid::new_v4();
    let cast_type_id = Uuid::new_v4();

    let title_id = Uuid::new_v4();
    let year_id = Uuid::new_v4();
    let genre_id = Uuid::new_v4();
    let name_id = Uuid::new_v4();
    let birth_id = Uuid::new_v4();
    let death_id = Uuid::new_v4();
    let century_id = Uuid::new_v4();

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
                        title_id.to_string(): { "system_name": "title", "type": "String" },
                        year_id.to_string(): { "system_name": "year", "type": "String" },
                        genre_id.to_string(): { "system_name": "genre", "type": "[String]" },
                    },
                    "display": { "title": "$title" },
                    "es_data": [
                        { "system_name": "title", "type": "text", "selector_value": "$title" },
                        { "system_name": "year", "type": "integer", "selector_value": "$year" },
                        { "system_name": "genre", "type": "[text]", "selector_value": "$genre" },
                        {
                            "system_name": "mentions",
                            "type": "[text]",
                            "selector_value": "$r_cast->$name $||$ [$r_cast->$id] $r_cast->$name",
                        },
                        {
                            "system_name": "actors",
                            "type": "nested",
                            "base": "$r_cast",
                            "parts": {
                                "id": { "type": "integer", "selector_value": "$id" },
                                "value": { "type": "text", "selector_value": "$name" },
                            },
                        },
                    ],
                    "es_display": {
                        "columns": [
                            { "column": "$title", "sortable": true, "main_link": true },
                            { "column": "$year", "sortable": true },
                            { "column": "$actors", "sortable": true },
                        ],
                        "filters": [
                            {
                                "filters": [
                                    { "filter": "$title", "type": "autocomplete" },
                                    { "filter": "$genre", "type": "dropdown" },
                                    { "filter": "$actors", "type": "dropdown" },
                                ],
                            },
                        ],
                    },
                }),
            },
            EntityTypeRecord {
                id: person_type_id,
                system_name: "person".to_string(),
                display_name: "Person".to_string(),
                config: json!({
                    "data": {
                        name_id.to_string(): { "system_name": "name", "type": "String" },
                        birth_id.to_string(): { "system_name": "date_of_birth", "type": "String" },
                        death_id.to_string(): { "system_name": "date_of_death", "type": "String" },
                        century_id.to_string(): { "system_name": "century", "type": "[String]" },
                    },
                    "display": { "title": "$name" },
                    "es_data": [
                        { "system_name": "name", "type": "text", "selector_value": "$name" },
                        {
                            "system_name": "life",
                            "type": "edtf_interval",
                            "start": "$date_of_birth",
                            "end": "$date_of_death",
                        },
                        {
                            "system_name": "century",
                            "type": "uncertain_centuries",
                            "selector_value": "$century",
                        },
                    ],
                    "es_display": {
                        "columns": [
                            { "column": "$name", "sortable": true, "main_link": true },
                        ],
                        "filters": [
                            {
                                "filters": [
                                    { "filter": "$life", "type": "histogram_slider", "interval": 10 },
                                    { "filter": "$century", "type": "dropdown", "sort": "chronologically" },
                                ],
                            },
                        ],
                    },
                }),
            },
        ],
        relation_types: vec![RelationTypeRecord {
            id: cast_type_id,
            system_name: "cast".to_string(),
            display_name: "Cast".to_string(),
            config: json!({}),
            domain_names: vec!["film".to_string()],
            range_names: vec!["person".to_string()],
        }],
    };

    let resolver = Arc::new(ConfigResolver::new(Arc::new(store)));
    let graph = StubGraphStore::default();
    let gateway = Arc::new(GraphGateway::new(
        Arc::new(graph.clone()),
        Arc::clone(&resolver),
    ));

    SearchFixture {
        resolver,
        graph,
        gateway,
        project_id,
        film_type_id,
        person_type_id,
        cast_type_id,
        prop_keys,
    }
}

struct DocInner {
    indices: Mutex<HashMap<String, Value>>,
    aliases: Mutex<HashMap<String, Vec<String>>>,
    bulks: Mutex<Vec<(String, Vec<BulkDoc>)>>,
    search_requests: Mutex<Vec<(String, Value)>>,
    search_responses: Mutex<VecDeque<Value>>,
    fail_bulk_after: AtomicUsize,
    fail_transiently: AtomicUsize,
}

impl Default for DocInner {
    fn default() -> Self {
        Self {
            indices: Mutex::default(),
            aliases: Mutex::default(),
            bulks: Mutex::default(),
            search_requests: Mutex::default(),
            search_responses: Mutex::default(),
            fail_bulk_after: AtomicUsize::new(usize::MAX),
            fail_transiently: AtomicUsize::new(0),
        }
    }
}

/// Recording in-memory document store with canned search responses.
#[derive(Default, Clone)]
pub struct StubDocStore {
    inner: Arc<DocInner>,
}

impl StubDocStore {
    pub fn push_search_response(&self, response: Value) {
        locked(&self.inner.search_responses).push_back(response);
    }

    /// Fails every `bulk_index` call from the nth onward (0-based).
    pub fn fail_bulk_after(&self, calls: usize) {
        self.inner.fail_bulk_after.store(calls, Ordering::SeqCst);
    }

    /// Fails the next `calls` store operations with a transient error.
    pub fn fail_transiently(&self, calls: usize) {
        self.inner.fail_transiently.store(calls, Ordering::SeqCst);
    }

    fn take_transient_failure(&self) -> Result<(), DocStoreError> {
        let outcome = self.inner.fail_transiently.fetch_update(
            Ordering::SeqCst,
            Ordering::SeqCst,
            |left| left.checked_sub(1),
        );
        match outcome {
            Ok(_) => Err(DocStoreError::Transient("request timed out".to_string())),
            Err(_) => Ok(()),
        }
    }

    pub fn created_indices(&self) -> Vec<String> {
        let mut names: Vec<String> = locked(&self.inner.indices).keys().cloned().collect();
        names.sort();
        names
    }

    pub fn index_body(&self, name: &str) -> Option<Value> {
        locked(&self.inner.indices).get(name).cloned()
    }

    pub fn members(&self, alias: &str) -> Vec<String> {
        locked(&self.inner.aliases)
            .get(alias)
            .cloned()
            .unwrap_or_default()
    }

    pub fn bulk_batches(&self) -> Vec<(String, Vec<BulkDoc>)> {
        locked(&self.inner.bulks).clone()
    }

    pub fn search_requests(&self) -> Vec<(String, Value)> {
        locked(&self.inner.search_requests).clone()
    }
}

#[async_trait]
impl DocStore for StubDocStore {
    async fn create_index(&self, name: &str, body: Value) -> Result<(), DocStoreError> {
        self.take_transient_failure()?;
        let mut indices = locked(&self.inner.indices);
        if indices.contains_key(name) {
            return Err(DocStoreError::Backend(format!("index `{name}` exists")));
        }
        indices.insert(name.to_string(), body);
        Ok(())
    }

    async fn alias_members(&self, alias: &str) -> Result<Vec<String>, DocStoreError> {
        self.take_transient_failure()?;
        Ok(self.members(alias))
    }

    async fn update_aliases(&self, actions: &[AliasAction]) -> Result<(), DocStoreError> {
        self.take_transient_failure()?;
        let mut indices = locked(&self.inner.indices);
        let mut aliases = locked(&self.inner.aliases);
        for action in actions {
            match action {
                AliasAction::Add { index, alias } => {
                    if !indices.contains_key(index) {
                        return Err(DocStoreError::Backend(format!(
                            "unknown index `{index}`"
                        )));
                    }
                    let members = aliases.entry(alias.clone()).or_default();
                    if !members.contains(index) {
                        members.push(index.clone());
                    }
                }
                AliasAction::RemoveIndex { index } => {
                    indices.remove(index);
                    for members in aliases.values_mut() {
                        members.retain(|member| member != index);
                    }
                }
            }
        }
        Ok(())
    }

    async fn bulk_index(&self, index: &str, docs: &[BulkDoc]) -> Result<(), DocStoreError> {
        self.take_transient_failure()?;
        let mut bulks = locked(&self.inner.bulks);
        if bulks.len() >= self.inner.fail_bulk_after.load(Ordering::SeqCst) {
            return Err(DocStoreError::Backend("bulk rejected".to_string()));
        }
        bulks.push((index.to_string(), docs.to_vec()));
        Ok(())
    }

    async fn search(&self, index: &str, body: Value) -> Result<Value, DocStoreError> {
        self.take_transient_failure()?;
        locked(&self.inner.search_requests).push((index.to_string(), body));
        Ok(locked(&self.inner.search_responses)
            .pop_front()
            .unwrap_or_else(|| json!({ "hits": { "hits": [], "total": { "value": 0 } } })))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    Created,
    Started { total: u64 },
    Counter(u64),
    Success,
    Error(String),
}

/// Records every job state transition.
#[derive(Clone)]
pub struct StubJobStore {
    job_id: Uuid,
    events: Arc<Mutex<Vec<JobEvent>>>,
}

impl Default for StubJobStore {
    fn default() -> Self {
        Self {
            job_id: Uuid::new_v4(),
            events: Arc::default(),
        }
    }
}

impl StubJobStore {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn events(&self) -> Vec<JobEvent> {
        locked(&self.events).clone()
    }
}

#[async_trait]
impl JobStore for StubJobStore {
    async fn create(
        &self,
        _project_id: Uuid,
        _entity_type_id: Uuid,
    ) -> Result<Uuid, JobStoreError> {
        locked(&self.events).push(JobEvent::Created);
        Ok(self.job_id)
    }

    async fn start(&self, _job_id: Uuid, total: u64) -> Result<(), JobStoreError> {
        locked(&self.events).push(JobEvent::Started { total });
        Ok(())
    }

    async fn update_counter(&self, _job_id: Uuid, counter: u64) -> Result<(), JobStoreError> {
        locked(&self.events).push(JobEvent::Counter(counter));
        Ok(())
    }

    async fn end_with_success(&self, _job_id: Uuid) -> Result<(), JobStoreError> {
        locked(&self.events).push(JobEvent::Success);
        Ok(())
    }

    async fn end_with_error(&self, _job_id: Uuid, message: &str) -> Result<(), JobStoreError> {
        locked(&self.events).push(JobEvent::Error(message.to_string()));
        Ok(())
    }
}
