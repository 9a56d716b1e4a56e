//! Search document construction.
//!
//! Combines the fetch planner, the graph gateway and the field renderer to
//! turn a batch of entity ids into denormalised documents ready for bulk
//! indexing. A document always carries exactly the configured field keys;
//! fields without data are `null`, never absent.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use serde_json::{json, Map, Value};
use tracing::debug;
use uuid::Uuid;

use tessella_config::{ConfigResolver, EdtfPosition, EntityTypeConfig, FieldKind, SearchFieldConfig};
use tessella_core::{
    parse_filter_clause, FetchPlanner, FieldExpression, FieldRenderer, GraphGateway,
    MissingPolicy, RelationEntry, RelationKey,
};

use crate::century;
use crate::edtf;
use crate::error::{Result, SearchError};

type Configs = BTreeMap<String, Arc<EntityTypeConfig>>;

/// Builds search documents for one project's entities.
pub struct DocBuilder {
    gateway: Arc<GraphGateway>,
    resolver: Arc<ConfigResolver>,
    today: NaiveDate,
}

impl DocBuilder {
    pub fn new(gateway: Arc<GraphGateway>, resolver: Arc<ConfigResolver>) -> Self {
        Self {
            gateway,
            resolver,
            today: Utc::now().date_naive(),
        }
    }

    /// Pins "today" for open-ended intervals.
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = today;
        self
    }

    /// Converts a batch of entities into documents keyed by entity id.
    /// Entities missing from the graph are omitted.
    pub async fn build(
        &self,
        project: &str,
        entity_type_name: &str,
        ids: &[i64],
    ) -> Result<BTreeMap<i64, Value>> {
        let config = self
            .resolver
            .entity_type_config(project, entity_type_name)
            .await?;
        let configs = self.resolver.entity_types_config(project).await?;
        let prepared: Vec<(SearchFieldConfig, Prepared)> = config
            .es_data
            .iter()
            .map(|field| Ok((field.clone(), Prepared::new(field)?)))
            .collect::<Result<_>>()?;

        let plan = FetchPlanner::plan_search_fields(&config.es_data)?;
        let trees = self.gateway.fetch(project, entity_type_name, ids, &plan).await?;
        debug!(
            project,
            entity_type = entity_type_name,
            requested = ids.len(),
            built = trees.len(),
            "building search documents"
        );

        let mut documents = BTreeMap::new();
        for (id, tree) in &trees {
            let mut doc = Map::new();
            for (field, prepared) in &prepared {
                let root = RenderRoot::Tree(tree);
                let value = self.convert(field, prepared, root, &configs)?;
                doc.insert(field.system_name.clone(), value);
            }
            documents.insert(*id, Value::Object(doc));
        }
        Ok(documents)
    }

    fn convert(
        &self,
        field: &SearchFieldConfig,
        prepared: &Prepared,
        root: RenderRoot<'_>,
        configs: &Configs,
    ) -> Result<Value> {
        match prepared {
            Prepared::Scalar(expression) => {
                let values = root.render(expression, configs);
                match field.kind {
                    FieldKind::Text => single_value(field, values).map_or(Ok(Value::Null), |v| {
                        v.map(Value::String)
                    }),
                    FieldKind::TextList => {
                        let flattened = flatten_values(values);
                        if flattened.is_empty() {
                            Ok(Value::Null)
                        } else {
                            Ok(json!(flattened))
                        }
                    }
                    FieldKind::TextFlatten => {
                        let flattened = flatten_values(values);
                        if flattened.is_empty() {
                            Ok(Value::Null)
                        } else {
                            Ok(json!(flattened.join(", ")))
                        }
                    }
                    FieldKind::Integer => match single_value(field, values) {
                        None => Ok(Value::Null),
                        Some(value) => {
                            let value = value?;
                            let number: i64 = value.parse().map_err(|_| {
                                SearchError::conversion(
                                    &field.system_name,
                                    format!("`{value}` is not an integer"),
                                )
                            })?;
                            Ok(json!(number))
                        }
                    },
                    FieldKind::UncertainCenturies => {
                        let tokens = flatten_values(values);
                        if tokens.is_empty() {
                            return Ok(Value::Null);
                        }
                        let centuries = tokens
                            .iter()
                            .map(|token| {
                                century::parse(token)
                                    .map(|century| century.to_json())
                                    .map_err(|message| {
                                        SearchError::conversion(&field.system_name, message)
                                    })
                            })
                            .collect::<Result<Vec<_>>>()?;
                        Ok(Value::Array(centuries))
                    }
                    _ => Err(SearchError::Unimplemented {
                        field: field.system_name.clone(),
                        kind: field.kind.as_str().to_string(),
                    }),
                }
            }
            Prepared::Edtf { expression, position } => {
                match single_value(field, root.render(expression, configs)) {
                    None => Ok(Value::Null),
                    Some(value) => {
                        let parsed = edtf::parse(&value?, *position).map_err(|message| {
                            SearchError::conversion(&field.system_name, message)
                        })?;
                        Ok(parsed.to_json())
                    }
                }
            }
            Prepared::Interval { start, end } => {
                let start = self.bound(field, start.as_ref(), EdtfPosition::Start, root, configs)?;
                let end = self.bound(field, end.as_ref(), EdtfPosition::End, root, configs)?;
                Ok(edtf::interval(start.as_ref(), end.as_ref(), self.today)
                    .unwrap_or(Value::Null))
            }
            Prepared::Nested { base, parts, filter } => {
                self.convert_nested(field, base, parts, filter.as_ref(), root, configs)
            }
        }
    }

    fn bound(
        &self,
        field: &SearchFieldConfig,
        expression: Option<&FieldExpression>,
        position: EdtfPosition,
        root: RenderRoot<'_>,
        configs: &Configs,
    ) -> Result<Option<edtf::EdtfValue>> {
        let Some(expression) = expression else {
            return Ok(None);
        };
        match single_value(field, root.render(expression, configs)) {
            None => Ok(None),
            Some(value) => edtf::parse(&value?, position)
                .map(Some)
                .map_err(|message| SearchError::conversion(&field.system_name, message)),
        }
    }

    fn convert_nested(
        &self,
        field: &SearchFieldConfig,
        base: &[RelationKey],
        parts: &[(String, FieldKind, FieldExpression)],
        filter: Option<&(FieldExpression, String)>,
        root: RenderRoot<'_>,
        configs: &Configs,
    ) -> Result<Value> {
        let rows: Vec<RenderRoot<'_>> = if base.is_empty() {
            vec![root]
        } else {
            match root {
                RenderRoot::Tree(tree) => tree
                    .entries_at(base)
                    .into_iter()
                    .map(RenderRoot::Entry)
                    .collect(),
                RenderRoot::Entry(_) => Vec::new(),
            }
        };

        let mut objects = Vec::new();
        for row in rows {
            if let Some((selector, literal)) = filter {
                if !row.render(selector, configs).contains(literal) {
                    continue;
                }
            }
            let mut object = Map::new();
            if let Some(config) = config_by_id(configs, row.entity_type_id()) {
                object.insert(
                    "entity_type_name".to_string(),
                    json!(config.system_name),
                );
            }
            for (key, kind, expression) in parts {
                let values = row.render(expression, configs);
                let value = match kind {
                    FieldKind::Integer => match values.first() {
                        None => Value::Null,
                        Some(value) => {
                            let number: i64 = value.parse().map_err(|_| {
                                SearchError::conversion(
                                    &field.system_name,
                                    format!("`{value}` is not an integer"),
                                )
                            })?;
                            json!(number)
                        }
                    },
                    FieldKind::Text => {
                        let flattened = flatten_values(values);
                        if flattened.is_empty() {
                            Value::Null
                        } else if field.kind == FieldKind::NestedFlatten {
                            json!(flattened.join(", "))
                        } else {
                            json!(flattened[0])
                        }
                    }
                    FieldKind::TextList => {
                        let flattened = flatten_values(values);
                        if flattened.is_empty() {
                            Value::Null
                        } else {
                            json!(flattened)
                        }
                    }
                    other => {
                        return Err(SearchError::Unimplemented {
                            field: field.system_name.clone(),
                            kind: other.as_str().to_string(),
                        })
                    }
                };
                object.insert(key.clone(), value);
            }

            // Composite keyword keys let facet buckets carry the display
            // value alongside the id.
            let id = object.get("id").cloned().unwrap_or(Value::Null);
            let value = object.get("value").cloned().unwrap_or(Value::Null);
            if let (Some(id), Value::String(value)) = (id.as_i64(), &value) {
                object.insert("id_value".to_string(), json!(format!("{id}|{value}")));
                if field.kind == FieldKind::NestedMultiType {
                    let type_id = row.entity_type_id();
                    object.insert("type_id".to_string(), json!(type_id.to_string()));
                    object.insert(
                        "type_id_value".to_string(),
                        json!(format!("{type_id}|{id}|{value}")),
                    );
                }
            }
            objects.push(Value::Object(object));
        }

        if objects.is_empty() {
            Ok(Value::Null)
        } else {
            Ok(Value::Array(objects))
        }
    }
}

/// Rendering origin: either a root entity tree or one relation entry.
#[derive(Clone, Copy)]
enum RenderRoot<'t> {
    Tree(&'t tessella_core::FetchedTree),
    Entry(&'t RelationEntry),
}

impl<'t> RenderRoot<'t> {
    fn render(&self, expression: &FieldExpression, configs: &Configs) -> Vec<String> {
        match self {
            RenderRoot::Tree(tree) => {
                FieldRenderer::render(expression, tree, configs, MissingPolicy::Omit)
            }
            RenderRoot::Entry(entry) => {
                FieldRenderer::render_entry(expression, entry, configs, MissingPolicy::Omit)
            }
        }
    }

    fn entity_type_id(&self) -> Uuid {
        match self {
            RenderRoot::Tree(tree) => tree.entity_type_id,
            RenderRoot::Entry(entry) => entry.entity_type_id,
        }
    }
}

/// Pre-parsed selectors of one search field.
enum Prepared {
    Scalar(FieldExpression),
    Edtf {
        expression: FieldExpression,
        position: EdtfPosition,
    },
    Interval {
        start: Option<FieldExpression>,
        end: Option<FieldExpression>,
    },
    Nested {
        base: Vec<RelationKey>,
        parts: Vec<(String, FieldKind, FieldExpression)>,
        filter: Option<(FieldExpression, String)>,
    },
}

impl Prepared {
    fn new(field: &SearchFieldConfig) -> Result<Self> {
        let selector = |raw: &Option<String>| -> Result<FieldExpression> {
            let raw = raw.as_deref().ok_or_else(|| {
                SearchError::conversion(&field.system_name, "missing selector")
            })?;
            Ok(FieldExpression::parse(raw)?)
        };
        Ok(match field.kind {
            FieldKind::Text
            | FieldKind::TextList
            | FieldKind::TextFlatten
            | FieldKind::Integer
            | FieldKind::UncertainCenturies => Self::Scalar(selector(&field.selector_value)?),
            FieldKind::Edtf => Self::Edtf {
                expression: selector(&field.selector_value)?,
                position: field.subtype.unwrap_or(EdtfPosition::Start),
            },
            FieldKind::EdtfInterval => Self::Interval {
                start: field
                    .start
                    .as_deref()
                    .map(FieldExpression::parse)
                    .transpose()?,
                end: field
                    .end
                    .as_deref()
                    .map(FieldExpression::parse)
                    .transpose()?,
            },
            FieldKind::Nested | FieldKind::NestedMultiType | FieldKind::NestedFlatten => {
                Self::Nested {
                    base: match field.base.as_deref() {
                        Some(raw) => tessella_core::expr::parse_base(raw)?,
                        None => Vec::new(),
                    },
                    parts: field
                        .parts
                        .iter()
                        .map(|(key, part)| {
                            Ok((
                                key.clone(),
                                part.kind,
                                FieldExpression::parse(&part.selector_value)?,
                            ))
                        })
                        .collect::<Result<_>>()?,
                    filter: field
                        .filter
                        .as_deref()
                        .map(parse_filter_clause)
                        .transpose()?,
                }
            }
        })
    }
}

/// A rendering that is itself a JSON list contributes its elements; plain
/// renderings contribute themselves. Duplicates are dropped, order kept.
fn flatten_values(values: Vec<String>) -> Vec<String> {
    let mut flattened: Vec<String> = Vec::new();
    for value in values {
        let mut push = |item: String| {
            if !flattened.contains(&item) {
                flattened.push(item);
            }
        };
        let trimmed = value.trim();
        if trimmed.starts_with('[') {
            if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(trimmed) {
                for item in items {
                    match item {
                        Value::String(text) => push(text),
                        other => push(other.to_string()),
                    }
                }
                continue;
            }
        }
        push(value);
    }
    flattened
}

/// `None` for no renderings, `Some(Err)` for more than one.
fn single_value(
    field: &SearchFieldConfig,
    values: Vec<String>,
) -> Option<Result<String>> {
    match values.len() {
        0 => None,
        1 => values.into_iter().next().map(Ok),
        n => Some(Err(SearchError::conversion(
            &field.system_name,
            format!("expected a single value, got {n}"),
        ))),
    }
}

fn config_by_id(configs: &Configs, entity_type_id: Uuid) -> Option<&Arc<EntityTypeConfig>> {
    configs.values().find(|config| config.id == entity_type_id)
}
