//! Entity mutations.
//!
//! Writes validate every value against the configured data field type and
//! validators, then run inside one graph transaction per request together
//! with a revision append carrying the old and new property maps. A failed
//! write rolls the whole transaction back, so no revision row ever exists
//! without its data change.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use tessella_config::{keys, ConfigResolver, DataFieldConfig, EntityTypeConfig, Validator};
use tessella_core::{CoreError, GraphStore, GraphTransaction};

use crate::error::{Result, SchemaError};
use crate::permissions::{Permission, Permissions};

/// Bare EDTF year: an optional sign and up to four digits, `X` as an
/// unspecified digit.
static EDTF_YEAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^-?[0-9X]{1,4}$").expect("hard-coded regex compiles"));

/// One recorded change, property maps keyed by system name.
#[derive(Debug, Clone)]
pub struct RevisionEntry {
    pub project_id: Uuid,
    pub user_id: Option<Uuid>,
    pub entity_type_id: Uuid,
    pub entity_id: i64,
    pub old: Option<BTreeMap<String, Value>>,
    pub new: Option<BTreeMap<String, Value>>,
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct RevisionError(pub String);

impl From<RevisionError> for SchemaError {
    fn from(error: RevisionError) -> Self {
        Self::Revision(error.0)
    }
}

/// Appends revision rows inside the caller's transaction. Implementations
/// downcast the transaction through [`GraphTransaction::as_any`] to reach
/// their concrete connection.
#[async_trait]
pub trait RevisionLog: Send + Sync {
    async fn append(
        &self,
        txn: &mut dyn GraphTransaction,
        entry: &RevisionEntry,
    ) -> std::result::Result<(), RevisionError>;
}

/// Validated, permission-checked entity writes.
pub struct EntityMutator {
    store: Arc<dyn GraphStore>,
    resolver: Arc<ConfigResolver>,
    revisions: Arc<dyn RevisionLog>,
}

impl EntityMutator {
    pub fn new(
        store: Arc<dyn GraphStore>,
        resolver: Arc<ConfigResolver>,
        revisions: Arc<dyn RevisionLog>,
    ) -> Self {
        Self {
            store,
            resolver,
            revisions,
        }
    }

    /// Creates an entity and returns it with its new id.
    pub async fn create(
        &self,
        permissions: &Permissions,
        user_id: Option<Uuid>,
        project: &str,
        entity_type: &str,
        values: BTreeMap<String, Value>,
    ) -> Result<Value> {
        let config = self.resolver.entity_type_config(project, entity_type).await?;
        let allowed = self.writable_fields(permissions, project, entity_type, Permission::Post)?;
        check_values(&config, &allowed, &values, true)?;

        let project_id = self.resolver.project_id_by_name(project).await?;
        let storage = self.storage_props(project, entity_type, &values).await?;

        let mut txn = self
            .store
            .begin(project_id)
            .await
            .map_err(CoreError::from)?;
        let outcome = async {
            let id = txn
                .create_entity(config.id, &storage)
                .await
                .map_err(CoreError::from)?;
            let mut new = values.clone();
            new.insert("id".to_string(), json!(id));
            self.revisions
                .append(
                    txn.as_mut(),
                    &RevisionEntry {
                        project_id,
                        user_id,
                        entity_type_id: config.id,
                        entity_id: id,
                        old: None,
                        new: Some(new.clone()),
                    },
                )
                .await?;
            Ok::<_, SchemaError>(new)
        }
        .await;

        match outcome {
            Ok(new) => {
                txn.commit().await.map_err(CoreError::from)?;
                info!(project, entity_type, id = new["id"].as_i64(), "created entity");
                Ok(Value::Object(new.into_iter().collect()))
            }
            Err(error) => {
                txn.rollback().await.map_err(CoreError::from)?;
                Err(error)
            }
        }
    }

    /// Updates an entity and returns its new state. When every submitted
    /// value equals the current one the write and the revision are skipped.
    pub async fn update(
        &self,
        permissions: &Permissions,
        user_id: Option<Uuid>,
        project: &str,
        entity_type: &str,
        id: i64,
        values: BTreeMap<String, Value>,
    ) -> Result<Value> {
        let config = self.resolver.entity_type_config(project, entity_type).await?;
        let allowed = self.writable_fields(permissions, project, entity_type, Permission::Put)?;
        check_values(&config, &allowed, &values, false)?;

        let project_id = self.resolver.project_id_by_name(project).await?;
        let mapping = self
            .resolver
            .entity_property_mapping(project, entity_type)
            .await?;
        let inverse = self
            .resolver
            .entity_property_mapping_inverse(project, entity_type)
            .await?;

        let mut txn = self
            .store
            .begin(project_id)
            .await
            .map_err(CoreError::from)?;
        let outcome = async {
            let stored = txn
                .entity_properties(config.id, id)
                .await
                .map_err(CoreError::from)?
                .ok_or_else(|| SchemaError::not_found("entity", format!("{entity_type}/{id}")))?;
            let old = system_named(&stored, &mapping);

            let unchanged = values
                .iter()
                .all(|(name, value)| old.get(name) == Some(value));
            if unchanged {
                return Ok::<_, SchemaError>((old, None));
            }

            let mut merged = stored.clone();
            for (name, value) in &values {
                if let Some(key) = inverse.get(name) {
                    merged.insert(key.clone(), value.clone());
                }
            }
            txn.update_entity(config.id, id, &merged)
                .await
                .map_err(CoreError::from)?;

            let new = system_named(&merged, &mapping);
            self.revisions
                .append(
                    txn.as_mut(),
                    &RevisionEntry {
                        project_id,
                        user_id,
                        entity_type_id: config.id,
                        entity_id: id,
                        old: Some(old),
                        new: Some(new.clone()),
                    },
                )
                .await?;
            Ok((new, Some(())))
        }
        .await;

        match outcome {
            Ok((state, written)) => {
                if written.is_some() {
                    txn.commit().await.map_err(CoreError::from)?;
                    info!(project, entity_type, id, "updated entity");
                } else {
                    txn.rollback().await.map_err(CoreError::from)?;
                }
                Ok(Value::Object(state.into_iter().collect()))
            }
            Err(error) => {
                txn.rollback().await.map_err(CoreError::from)?;
                Err(error)
            }
        }
    }

    pub async fn delete(
        &self,
        permissions: &Permissions,
        user_id: Option<Uuid>,
        project: &str,
        entity_type: &str,
        id: i64,
    ) -> Result<()> {
        let config = self.resolver.entity_type_config(project, entity_type).await?;
        let grants = permissions
            .entity(project, entity_type)
            .ok_or_else(|| unauthorized(entity_type, Permission::Delete))?;
        if !grants.allows(Permission::Delete) {
            return Err(unauthorized(entity_type, Permission::Delete));
        }

        let project_id = self.resolver.project_id_by_name(project).await?;
        let mapping = self
            .resolver
            .entity_property_mapping(project, entity_type)
            .await?;

        let mut txn = self
            .store
            .begin(project_id)
            .await
            .map_err(CoreError::from)?;
        let outcome = async {
            let stored = txn
                .entity_properties(config.id, id)
                .await
                .map_err(CoreError::from)?
                .ok_or_else(|| SchemaError::not_found("entity", format!("{entity_type}/{id}")))?;
            txn.delete_entity(config.id, id)
                .await
                .map_err(CoreError::from)?;
            self.revisions
                .append(
                    txn.as_mut(),
                    &RevisionEntry {
                        project_id,
                        user_id,
                        entity_type_id: config.id,
                        entity_id: id,
                        old: Some(system_named(&stored, &mapping)),
                        new: None,
                    },
                )
                .await?;
            Ok::<_, SchemaError>(())
        }
        .await;

        match outcome {
            Ok(()) => {
                txn.commit().await.map_err(CoreError::from)?;
                info!(project, entity_type, id, "deleted entity");
                Ok(())
            }
            Err(error) => {
                txn.rollback().await.map_err(CoreError::from)?;
                Err(error)
            }
        }
    }

    fn writable_fields(
        &self,
        permissions: &Permissions,
        project: &str,
        entity_type: &str,
        permission: Permission,
    ) -> Result<std::collections::BTreeSet<String>> {
        permissions
            .entity(project, entity_type)
            .and_then(|grants| grants.fields(permission))
            .cloned()
            .ok_or_else(|| unauthorized(entity_type, permission))
    }

    /// Submitted values keyed by storage key.
    async fn storage_props(
        &self,
        project: &str,
        entity_type: &str,
        values: &BTreeMap<String, Value>,
    ) -> Result<BTreeMap<String, Value>> {
        let inverse = self
            .resolver
            .entity_property_mapping_inverse(project, entity_type)
            .await?;
        let mut storage = BTreeMap::new();
        for (name, value) in values {
            let key = inverse
                .get(name)
                .ok_or_else(|| SchemaError::not_found("field", name))?;
            storage.insert(key.clone(), value.clone());
        }
        Ok(storage)
    }
}

fn unauthorized(entity_type: &str, permission: Permission) -> SchemaError {
    SchemaError::Unauthorized(format!("{permission:?} on `{entity_type}` denied").to_lowercase())
}

/// Stored property map translated back to system names.
fn system_named(
    stored: &BTreeMap<String, Value>,
    mapping: &BTreeMap<String, String>,
) -> BTreeMap<String, Value> {
    stored
        .iter()
        .filter_map(|(key, value)| {
            mapping
                .get(key)
                .map(|name| (name.clone(), value.clone()))
        })
        .collect()
}

/// Validates submitted values against permissions, configured types and
/// validators. On create, `required` fields must be present.
fn check_values(
    config: &EntityTypeConfig,
    allowed: &std::collections::BTreeSet<String>,
    values: &BTreeMap<String, Value>,
    creating: bool,
) -> Result<()> {
    for name in values.keys() {
        if keys::is_reserved(name) {
            return Err(SchemaError::Invalid(format!(
                "`{name}` is a reserved system name"
            )));
        }
    }

    let by_name: BTreeMap<&str, &DataFieldConfig> = config
        .data
        .values()
        .map(|field| (field.system_name.as_str(), field))
        .collect();

    for (name, value) in values {
        let field = by_name
            .get(name.as_str())
            .ok_or_else(|| SchemaError::not_found("field", name))?;
        if !allowed.contains(name) {
            return Err(SchemaError::Unauthorized(format!(
                "field `{name}` is not writable"
            )));
        }
        check_value(field, value)?;
    }

    if creating {
        for field in config.data.values() {
            let required = field
                .validators
                .iter()
                .any(|validator| matches!(validator, Validator::Required { .. }));
            if required && !values.contains_key(&field.system_name) {
                return Err(invalid(field, None, "is required"));
            }
        }
    }
    Ok(())
}

fn check_value(field: &DataFieldConfig, value: &Value) -> Result<()> {
    let texts: Vec<&str> = match field.field_type.as_str() {
        "String" => match value.as_str() {
            Some(text) => vec![text],
            None => return Err(invalid(field, None, "must be a string")),
        },
        "[String]" => match value.as_array() {
            Some(items) => {
                let mut texts = Vec::with_capacity(items.len());
                for item in items {
                    match item.as_str() {
                        Some(text) => texts.push(text),
                        None => return Err(invalid(field, None, "must be a list of strings")),
                    }
                }
                texts
            }
            None => return Err(invalid(field, None, "must be a list of strings")),
        },
        other => {
            return Err(SchemaError::Invalid(format!(
                "field `{}` has unsupported type `{other}`",
                field.system_name
            )))
        }
    };

    for validator in &field.validators {
        match validator {
            Validator::Required { error_message } => {
                if texts.iter().all(|text| text.is_empty()) {
                    return Err(invalid(field, error_message.as_deref(), "is required"));
                }
            }
            Validator::Regex {
                regex,
                error_message,
            } => {
                let compiled = Regex::new(regex).map_err(|error| {
                    SchemaError::Invalid(format!(
                        "field `{}` has an invalid validator pattern: {error}",
                        field.system_name
                    ))
                })?;
                if texts.iter().any(|text| !compiled.is_match(text)) {
                    return Err(invalid(
                        field,
                        error_message.as_deref(),
                        "does not match the required pattern",
                    ));
                }
            }
            Validator::EdtfYear { error_message } => {
                if texts.iter().any(|text| !EDTF_YEAR.is_match(text)) {
                    return Err(invalid(
                        field,
                        error_message.as_deref(),
                        "must be an EDTF year",
                    ));
                }
            }
        }
    }
    Ok(())
}

fn invalid(field: &DataFieldConfig, message: Option<&str>, fallback: &str) -> SchemaError {
    match message {
        Some(message) => SchemaError::Invalid(message.to_string()),
        None => SchemaError::Invalid(format!("field `{}` {fallback}", field.system_name)),
    }
}
