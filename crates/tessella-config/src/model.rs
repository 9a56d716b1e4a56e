//! Configuration model.
//!
//! Per-project type configuration is authored as JSON and deserialized into
//! these shapes. The search-facing parts (`es_data`, `es_display`) drive the
//! fetch planner, the document builder and the search compiler, so a single
//! mistake here corrupts every downstream layer; the model is strict about
//! field names and rejects unknown search field types at parse time.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Per-project root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub id: Uuid,
    pub system_name: String,
    pub display_name: String,
}

/// Validator attached to a data field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Validator {
    /// Value must be present and non-empty
    Required { error_message: Option<String> },
    /// Value must match the given regular expression
    Regex {
        regex: String,
        error_message: Option<String>,
    },
    /// Value must be a bare EDTF year (no month/day precision)
    EdtfYear { error_message: Option<String> },
}

impl Validator {
    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Required { error_message }
            | Self::Regex { error_message, .. }
            | Self::EdtfYear { error_message } => error_message.as_deref(),
        }
    }
}

/// Data field of an entity or relation type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataFieldConfig {
    pub system_name: String,
    /// Value type: `String` or `[String]`
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validators: Vec<Validator>,
}

/// Search document field type.
///
/// The serialized names match the configuration format, including the
/// bracketed `[text]` list variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldKind {
    #[serde(rename = "text")]
    Text,
    #[serde(rename = "[text]")]
    TextList,
    #[serde(rename = "text_flatten")]
    TextFlatten,
    #[serde(rename = "integer")]
    Integer,
    #[serde(rename = "edtf")]
    Edtf,
    #[serde(rename = "edtf_interval")]
    EdtfInterval,
    #[serde(rename = "uncertain_centuries")]
    UncertainCenturies,
    #[serde(rename = "nested")]
    Nested,
    #[serde(rename = "nested_multi_type")]
    NestedMultiType,
    #[serde(rename = "nested_flatten")]
    NestedFlatten,
}

impl FieldKind {
    /// Nested document variants share mapping, filter and sort behaviour.
    pub fn is_nested(self) -> bool {
        matches!(self, Self::Nested | Self::NestedMultiType | Self::NestedFlatten)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::TextList => "[text]",
            Self::TextFlatten => "text_flatten",
            Self::Integer => "integer",
            Self::Edtf => "edtf",
            Self::EdtfInterval => "edtf_interval",
            Self::UncertainCenturies => "uncertain_centuries",
            Self::Nested => "nested",
            Self::NestedMultiType => "nested_multi_type",
            Self::NestedFlatten => "nested_flatten",
        }
    }
}

/// Position of a single EDTF value inside an interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdtfPosition {
    Start,
    End,
}

/// Part of a nested search field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchFieldPart {
    #[serde(rename = "type")]
    pub kind: FieldKind,
    pub selector_value: String,
}

/// One field of an entity type's `es_data` configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchFieldConfig {
    pub system_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(rename = "type")]
    pub kind: FieldKind,
    /// Projection selector for scalar fields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector_value: Option<String>,
    /// Common base traversal for nested fields; absent means the root entity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<String>,
    /// Sub-fields of a nested field, keyed by document key
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parts: BTreeMap<String, SearchFieldPart>,
    /// Optional `<selector> == <literal>` guard on nested base rows
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    /// Start selector of an `edtf_interval` field
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    /// End selector of an `edtf_interval` field
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
    /// Interval position of a single `edtf` field
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<EdtfPosition>,
}

/// Faceted-search UI widget bound to a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterKind {
    Dropdown,
    Autocomplete,
    HistogramSlider,
    NestedPresent,
}

/// One filter of the `es_display` configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    /// `$`-prefixed search field system name
    pub filter: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<FilterKind>,
    /// Histogram bucket width in years
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<u32>,
    /// Bucket sort: `alphabetically`, `chronologically` or `id`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<String>,
}

impl FilterConfig {
    /// Filter key with the `$` sigil stripped.
    pub fn system_name(&self) -> &str {
        self.filter.trim_start_matches('$')
    }
}

/// Filter section grouping in the search UI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub filters: Vec<FilterConfig>,
}

/// One result column of the `es_display` configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnConfig {
    /// `$`-prefixed search field system name
    pub column: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub sortable: bool,
    #[serde(default)]
    pub main_link: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_field_type: Option<FieldKind>,
}

impl ColumnConfig {
    /// Column key with the `$` sigil stripped; sub-fields are addressed as
    /// `<field>.<sub_field>`.
    pub fn key(&self) -> String {
        let base = self.column.trim_start_matches('$');
        match &self.sub_field {
            Some(sub) => format!("{base}.{sub}"),
            None => base.to_string(),
        }
    }
}

/// Search surface configuration of an entity type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EsDisplayConfig {
    pub columns: Vec<ColumnConfig>,
    pub filters: Vec<FilterSection>,
}

/// Display configuration: the title expression is reused for reference
/// previews across entity types.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DisplayConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout: Option<serde_json::Value>,
}

/// Fully normalized entity type configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityTypeConfig {
    pub id: Uuid,
    pub system_name: String,
    pub display_name: String,
    /// Data fields keyed by field id
    #[serde(default)]
    pub data: BTreeMap<Uuid, DataFieldConfig>,
    #[serde(default)]
    pub display: DisplayConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edit: Option<serde_json::Value>,
    /// Search document fields
    #[serde(default)]
    pub es_data: Vec<SearchFieldConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub es_display: Option<EsDisplayConfig>,
    /// Whether entities of this type may act as source provenance
    #[serde(default)]
    pub source: bool,
}

impl EntityTypeConfig {
    /// Selector used for cross-type reference previews: the configured
    /// display title, falling back to the entity id.
    pub fn title_selector(&self) -> String {
        self.display
            .title
            .clone()
            .unwrap_or_else(|| "$id".to_string())
    }

    pub fn search_field(&self, system_name: &str) -> Option<&SearchFieldConfig> {
        self.es_data.iter().find(|f| f.system_name == system_name)
    }
}

/// Fully normalized relation type configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationTypeConfig {
    pub id: Uuid,
    pub system_name: String,
    pub display_name: String,
    #[serde(default)]
    pub data: BTreeMap<Uuid, DataFieldConfig>,
    #[serde(default)]
    pub display: DisplayConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edit: Option<serde_json::Value>,
    /// Entity system names allowed as relation start
    #[serde(default)]
    pub domain_names: BTreeSet<String>,
    /// Entity system names allowed as relation end
    #[serde(default)]
    pub range_names: BTreeSet<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_kind_serialized_names_match_config_format() {
        assert_eq!(
            serde_json::to_string(&FieldKind::TextList).unwrap(),
            "\"[text]\""
        );
        let kind: FieldKind = serde_json::from_str("\"uncertain_centuries\"").unwrap();
        assert_eq!(kind, FieldKind::UncertainCenturies);
    }

    #[test]
    fn column_key_includes_sub_field() {
        let column: ColumnConfig = serde_json::from_value(serde_json::json!({
            "column": "$life",
            "sub_field": "lower",
            "sub_field_type": "edtf",
            "sortable": true,
        }))
        .unwrap();
        assert_eq!(column.key(), "life.lower");
    }

    #[test]
    fn unknown_search_field_type_is_rejected() {
        let result: std::result::Result<SearchFieldConfig, _> =
            serde_json::from_value(serde_json::json!({
                "system_name": "title",
                "type": "geo_point",
                "selector_value": "$title",
            }));
        assert!(result.is_err());
    }

    #[test]
    fn title_selector_falls_back_to_id() {
        let config: EntityTypeConfig = serde_json::from_value(serde_json::json!({
            "id": Uuid::new_v4(),
            "system_name": "film",
            "display_name": "Film",
        }))
        .unwrap();
        assert_eq!(config.title_selector(), "$id");
    }
}
