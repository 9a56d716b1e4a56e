//! Index lifecycle management.
//!
//! Every reindex writes into a fresh index named after a random uuid and
//! flips a per-entity-type alias to it afterwards, so readers never observe
//! a half-built index. Mappings are strict; every configured search field
//! maps to an explicit property.

use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::info;
use uuid::Uuid;

use tessella_config::{keys, FieldKind, SearchFieldConfig};

use crate::docstore::{AliasAction, DocStore};
use crate::error::Result;
use crate::retry::with_retries;

/// Manages physical indices and their entity-type aliases.
pub struct IndexManager {
    store: Arc<dyn DocStore>,
    prefix: String,
}

impl IndexManager {
    pub fn new(store: Arc<dyn DocStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    /// Stable alias an entity type is queried through.
    pub fn alias_name(&self, entity_type_id: Uuid) -> String {
        format!("{}_{}", self.prefix, keys::dtu(&entity_type_id.to_string()))
    }

    /// Creates a fresh index for the given field configuration and returns
    /// its name. No alias points at it yet.
    pub async fn create(&self, fields: &[SearchFieldConfig]) -> Result<String> {
        let name = format!("{}_{}", self.prefix, keys::dtu(&Uuid::new_v4().to_string()));
        let body = json!({
            "settings": settings(),
            "mappings": {
                "dynamic": "strict",
                "properties": properties(fields),
            },
        });
        with_retries("create_index", || self.store.create_index(&name, body.clone())).await?;
        info!(index = %name, "created index");
        Ok(name)
    }

    /// Points the entity type's alias at `new_index` and drops every other
    /// member, in one atomic alias update.
    pub async fn switch(&self, new_index: &str, entity_type_id: Uuid) -> Result<()> {
        let alias = self.alias_name(entity_type_id);
        let members = with_retries("alias_members", || self.store.alias_members(&alias)).await?;
        let mut actions = vec![AliasAction::Add {
            index: new_index.to_string(),
            alias: alias.clone(),
        }];
        for member in members {
            if member != new_index {
                actions.push(AliasAction::RemoveIndex { index: member });
            }
        }
        with_retries("update_aliases", || self.store.update_aliases(&actions)).await?;
        info!(index = new_index, alias = %alias, "switched alias");
        Ok(())
    }
}

fn settings() -> Value {
    json!({
        "analysis": {
            "char_filter": {
                "remove_special": {
                    "type": "pattern_replace",
                    "pattern": "[\\p{Punct}]",
                    "replacement": "",
                },
                "numbers_last": {
                    "type": "pattern_replace",
                    "pattern": "([0-9])",
                    "replacement": "zzz$1",
                },
            },
            "normalizer": {
                "icu_normalizer": {
                    "type": "custom",
                    "char_filter": ["remove_special", "numbers_last"],
                    "filter": ["icu_folding", "lowercase"],
                },
            },
            "analyzer": {
                "icu_analyzer": {
                    "type": "custom",
                    "tokenizer": "standard",
                    "filter": ["icu_folding", "lowercase"],
                },
            },
        },
    })
}

fn properties(fields: &[SearchFieldConfig]) -> Value {
    let mut properties = Map::new();
    for field in fields {
        properties.insert(field.system_name.clone(), field_mapping(field));
    }
    Value::Object(properties)
}

fn field_mapping(field: &SearchFieldConfig) -> Value {
    match field.kind {
        FieldKind::Text | FieldKind::TextList | FieldKind::TextFlatten => text_mapping(),
        FieldKind::Integer => json!({ "type": "integer" }),
        FieldKind::Edtf => json!({ "properties": edtf_properties() }),
        FieldKind::EdtfInterval => {
            let mut inner = edtf_properties();
            inner.insert("start".to_string(), json!({ "properties": edtf_properties() }));
            inner.insert("end".to_string(), json!({ "properties": edtf_properties() }));
            json!({ "properties": inner })
        }
        FieldKind::UncertainCenturies => json!({
            "type": "nested",
            "properties": {
                "display": { "type": "keyword" },
                "withoutUncertain": {
                    "type": "keyword",
                    "fields": {
                        "normalized_keyword": {
                            "type": "keyword",
                            "normalizer": "icu_normalizer",
                        },
                    },
                },
                "numeric": { "type": "integer" },
            },
        }),
        FieldKind::Nested | FieldKind::NestedMultiType | FieldKind::NestedFlatten => {
            nested_mapping(field)
        }
    }
}

fn nested_mapping(field: &SearchFieldConfig) -> Value {
    let mut properties = Map::new();
    properties.insert("entity_type_name".to_string(), json!({ "type": "keyword" }));
    properties.insert("id_value".to_string(), json!({ "type": "keyword" }));
    if field.kind == FieldKind::NestedMultiType {
        properties.insert("type_id".to_string(), json!({ "type": "keyword" }));
        properties.insert("type_id_value".to_string(), json!({ "type": "keyword" }));
    }
    for (key, part) in &field.parts {
        let mapping = match part.kind {
            FieldKind::Integer => json!({ "type": "integer" }),
            _ => text_mapping(),
        };
        properties.insert(key.clone(), mapping);
    }
    json!({ "type": "nested", "properties": properties })
}

/// Keyword, normalized and completion views of one text value. The
/// `numbers_last` char filter makes numeric strings sort behind letters.
fn text_mapping() -> Value {
    json!({
        "type": "text",
        "fields": {
            "keyword": { "type": "keyword" },
            "normalized_keyword": {
                "type": "keyword",
                "normalizer": "icu_normalizer",
            },
            "normalized_text": {
                "type": "text",
                "analyzer": "icu_analyzer",
            },
            "completion": { "type": "completion" },
        },
    })
}

fn edtf_properties() -> Map<String, Value> {
    let mut properties = Map::new();
    properties.insert("text".to_string(), json!({ "type": "keyword" }));
    properties.insert("lower".to_string(), json!({ "type": "date" }));
    properties.insert("upper".to_string(), json!({ "type": "date" }));
    properties.insert("year_range".to_string(), json!({ "type": "integer_range" }));
    properties
}
