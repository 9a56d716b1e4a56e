//! Search request compilation and response extraction.
//!
//! A [`SearchCompiler`] translates a faceted-search request against one
//! entity type's configuration into at most two document-store requests:
//! an optional full-range probe that fixes histogram bounds, and the data
//! request itself. Facet aggregations ride along with the data request
//! inside a `global` aggregation, each wrapped in a filter that applies
//! every active filter except its own, so facet counts reflect the partial
//! selection state without a third round trip.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::debug;

use tessella_config::{
    ColumnConfig, EntityTypeConfig, FieldKind, FilterConfig, FilterKind, EDIT_RELATION_TITLE,
};

use crate::century;
use crate::docstore::DocStore;
use crate::error::{Result, SearchError, MAX_RESULT_WINDOW};
use crate::index::IndexManager;
use crate::retry::with_retries;

pub const DEFAULT_SIZE: u64 = 25;
/// Terms aggregations fetch every bucket; truncation happens client side so
/// selected buckets survive even when they fall outside the display limit.
const AGG_TERMS_SIZE: u64 = 10_000;
/// Facet buckets kept per filter after truncation.
const AGG_DISPLAY_LIMIT: usize = 100;

/// Search request body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRequest {
    /// Filter values keyed by search field system name; `null` entries are
    /// treated as absent.
    #[serde(default)]
    pub filters: BTreeMap<String, Option<FilterValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_order: Option<SortOrder>,
}

impl SearchRequest {
    fn active_filters(&self) -> BTreeMap<&str, &FilterValue> {
        self.filters
            .iter()
            .filter_map(|(key, value)| value.as_ref().map(|value| (key.as_str(), value)))
            .collect()
    }
}

/// Filter value, shaped by the field it applies to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    /// `0` or `1` for presence filters
    Presence(u8),
    /// `[min?, max?]` year bounds for histogram filters
    Range(Vec<Option<i64>>),
    /// Selected keys for terms filters
    Terms(Vec<String>),
    /// Free text for match filters
    Text(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Asc => "asc",
            Self::Desc => "desc",
        }
    }
}

impl Default for SortOrder {
    fn default() -> Self {
        Self::Asc
    }
}

/// One facet bucket of the response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FacetBucket {
    pub key: Value,
    pub value: String,
    pub count: u64,
}

/// Unfiltered value bounds of a histogram field, in years.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeBounds {
    pub min: Option<i64>,
    pub max: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    pub sort_by: Option<String>,
    pub sort_order: SortOrder,
    pub total: u64,
    pub aggs: BTreeMap<String, Vec<FacetBucket>>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub ranges: BTreeMap<String, RangeBounds>,
    pub results: Vec<Value>,
    pub from: u64,
    pub to: u64,
}

/// Query scope: the data query applies every filter, a facet wrapper applies
/// every filter except its own.
#[derive(Clone, Copy, PartialEq)]
enum Scope<'a> {
    Data,
    Facet(&'a str),
}

/// Compiles requests for one entity type's search surface.
pub struct SearchCompiler {
    config: Arc<EntityTypeConfig>,
    columns: Vec<(String, ColumnConfig)>,
    filters: Vec<(String, FilterConfig)>,
}

impl SearchCompiler {
    pub fn new(config: Arc<EntityTypeConfig>) -> Self {
        let mut columns = Vec::new();
        let mut filters = Vec::new();
        match &config.es_display {
            Some(display) => {
                for column in &display.columns {
                    columns.push((column.key(), column.clone()));
                }
                for section in &display.filters {
                    for filter in &section.filters {
                        filters.push((filter.system_name().to_string(), filter.clone()));
                    }
                }
            }
            // Entity overview pages without a configured search surface get
            // the injected id-and-title column.
            None => {
                columns.push((
                    EDIT_RELATION_TITLE.to_string(),
                    ColumnConfig {
                        column: format!("${EDIT_RELATION_TITLE}"),
                        display_name: Some("Id and title".to_string()),
                        sortable: true,
                        main_link: true,
                        sub_field: None,
                        sub_field_type: None,
                    },
                ));
                filters.push((
                    EDIT_RELATION_TITLE.to_string(),
                    FilterConfig {
                        filter: format!("${EDIT_RELATION_TITLE}"),
                        kind: None,
                        interval: None,
                        sort: Some("id".to_string()),
                    },
                ));
            }
        }
        Self {
            config,
            columns,
            filters,
        }
    }

    pub fn entity_type_id(&self) -> uuid::Uuid {
        self.config.id
    }

    /// Field kind behind a column or filter key. Dotted keys address a
    /// sub-field of a nested column.
    fn kind_of(&self, key: &str) -> Result<FieldKind> {
        if key.contains('.') {
            return self
                .columns
                .iter()
                .find(|(column_key, _)| column_key == key)
                .and_then(|(_, column)| column.sub_field_type)
                .ok_or_else(|| SearchError::Invalid(format!("unknown column `{key}`")));
        }
        self.config
            .search_field(key)
            .map(|field| field.kind)
            .ok_or_else(|| SearchError::Invalid(format!("unknown search field `{key}`")))
    }

    fn filter_config(&self, key: &str) -> Option<&FilterConfig> {
        self.filters
            .iter()
            .find(|(filter_key, _)| filter_key == key)
            .map(|(_, filter)| filter)
    }

    fn widget(&self, key: &str) -> Option<FilterKind> {
        self.filter_config(key).and_then(|filter| filter.kind)
    }

    // Pagination

    fn window(&self, request: &SearchRequest) -> Result<(u64, u64)> {
        let size = request.size.unwrap_or(DEFAULT_SIZE);
        let from = request.page.unwrap_or(1).saturating_sub(1).saturating_mul(size);
        if from.saturating_add(size) > MAX_RESULT_WINDOW {
            return Err(SearchError::WindowExceeded { from, size });
        }
        Ok((from, size))
    }

    // Sorting

    fn sorting(&self, request: &SearchRequest) -> (Option<String>, SortOrder) {
        let sort_by = request.sort_by.clone().or_else(|| {
            self.columns
                .iter()
                .find(|(_, column)| column.sortable)
                .map(|(key, _)| key.clone())
        });
        (sort_by, request.sort_order.unwrap_or_default())
    }

    fn sort_clause(&self, sort_by: &str, order: SortOrder) -> Result<Value> {
        let kind = self.kind_of(sort_by)?;
        let clause = match kind {
            FieldKind::Edtf | FieldKind::EdtfInterval => match order {
                SortOrder::Asc => json!({ (format!("{sort_by}.lower")): "asc" }),
                SortOrder::Desc => json!({ (format!("{sort_by}.upper")): "desc" }),
            },
            FieldKind::UncertainCenturies => json!({
                (format!("{sort_by}.numeric")): {
                    "mode": sort_mode(order),
                    "order": order.as_str(),
                    "nested": { "path": sort_by },
                },
            }),
            FieldKind::Nested | FieldKind::NestedMultiType | FieldKind::NestedFlatten => json!({
                (format!("{sort_by}.value.normalized_keyword")): {
                    "mode": sort_mode(order),
                    "order": order.as_str(),
                    "nested": { "path": sort_by },
                },
            }),
            FieldKind::Text | FieldKind::TextList | FieldKind::TextFlatten => {
                json!({ (format!("{sort_by}.normalized_keyword")): order.as_str() })
            }
            _ => json!({ (sort_by): order.as_str() }),
        };
        Ok(json!([clause]))
    }

    // Requested document fields, per column

    fn doc_fields(&self) -> Result<Vec<String>> {
        let mut fields = Vec::new();
        for (key, _) in &self.columns {
            match self.kind_of(key)? {
                FieldKind::Nested | FieldKind::NestedMultiType | FieldKind::NestedFlatten => {
                    fields.push(format!("{key}.entity_type_name"));
                    fields.push(format!("{key}.id"));
                    fields.push(format!("{key}.value"));
                }
                FieldKind::UncertainCenturies => {
                    fields.push(format!("{key}.display"));
                    fields.push(format!("{key}.withoutUncertain"));
                    fields.push(format!("{key}.numeric"));
                }
                FieldKind::Edtf | FieldKind::EdtfInterval => {
                    fields.push(format!("{key}.text"));
                    fields.push(format!("{key}.lower"));
                    fields.push(format!("{key}.upper"));
                }
                FieldKind::Text | FieldKind::TextList | FieldKind::TextFlatten
                | FieldKind::Integer => {
                    fields.push(key.clone());
                }
            }
        }
        Ok(fields)
    }

    // Query construction

    fn query(
        &self,
        filters: &BTreeMap<&str, &FilterValue>,
        scope: Scope<'_>,
    ) -> Result<Option<Value>> {
        let mut must = Vec::new();
        let mut filter = Vec::new();
        for (&key, &value) in filters {
            if scope == Scope::Facet(key) {
                continue;
            }
            let kind = self.kind_of(key)?;
            match kind {
                FieldKind::Nested | FieldKind::NestedFlatten
                    if self.widget(key) == Some(FilterKind::NestedPresent) =>
                {
                    let FilterValue::Presence(present) = value else {
                        return Err(SearchError::Invalid(format!(
                            "filter `{key}` expects 0 or 1"
                        )));
                    };
                    let occur = if *present == 0 { "must_not" } else { "should" };
                    must.push(json!({
                        "bool": {
                            (occur): {
                                "nested": {
                                    "path": key,
                                    "query": { "exists": { "field": key } },
                                },
                            },
                        },
                    }));
                }
                FieldKind::Nested
                | FieldKind::NestedMultiType
                | FieldKind::NestedFlatten
                | FieldKind::UncertainCenturies => {
                    let FilterValue::Terms(terms) = value else {
                        return Err(SearchError::Invalid(format!(
                            "filter `{key}` expects a list of keys"
                        )));
                    };
                    let field = match kind {
                        FieldKind::NestedMultiType => format!("{key}.type_id"),
                        FieldKind::UncertainCenturies => format!("{key}.withoutUncertain"),
                        _ => format!("{key}.id"),
                    };
                    filter.push(json!({
                        "nested": {
                            "path": key,
                            "query": { "terms": { (field): terms } },
                        },
                    }));
                }
                FieldKind::Edtf | FieldKind::EdtfInterval => {
                    let FilterValue::Range(bounds) = value else {
                        return Err(SearchError::Invalid(format!(
                            "filter `{key}` expects [min, max] bounds"
                        )));
                    };
                    let mut range = Map::new();
                    if let Some(min) = bounds.first().copied().flatten() {
                        range.insert("gte".to_string(), json!(min));
                    }
                    if let Some(max) = bounds.get(1).copied().flatten() {
                        range.insert("lte".to_string(), json!(max));
                    }
                    filter.push(json!({
                        "range": { (format!("{key}.year_range")): range },
                    }));
                }
                FieldKind::Text | FieldKind::TextList => {
                    if self.widget(key) == Some(FilterKind::Dropdown) {
                        let FilterValue::Terms(terms) = value else {
                            return Err(SearchError::Invalid(format!(
                                "filter `{key}` expects a list of keys"
                            )));
                        };
                        filter.push(json!({
                            "terms": { (format!("{key}.keyword")): terms },
                        }));
                    } else {
                        let FilterValue::Text(text) = value else {
                            return Err(SearchError::Invalid(format!(
                                "filter `{key}` expects a query string"
                            )));
                        };
                        must.push(json!({
                            "match": { (key): { "query": text, "operator": "and" } },
                        }));
                    }
                }
                other => {
                    return Err(SearchError::Unimplemented {
                        field: key.to_string(),
                        kind: other.as_str().to_string(),
                    })
                }
            }
        }

        if must.is_empty() && filter.is_empty() {
            return Ok(None);
        }
        let mut clauses = Map::new();
        if !must.is_empty() {
            clauses.insert("must".to_string(), json!(must));
        }
        if !filter.is_empty() {
            clauses.insert("filter".to_string(), json!(filter));
        }
        Ok(Some(json!({ "bool": clauses })))
    }

    // Full-range probe

    fn histogram_keys(&self) -> Vec<&str> {
        self.filters
            .iter()
            .filter(|(key, filter)| {
                filter.kind == Some(FilterKind::HistogramSlider)
                    && matches!(
                        self.kind_of(key),
                        Ok(FieldKind::Edtf) | Ok(FieldKind::EdtfInterval)
                    )
            })
            .map(|(key, _)| key.as_str())
            .collect()
    }

    /// Body of the unfiltered min/max probe, if any histogram filter is
    /// configured.
    pub fn full_range_body(&self) -> Option<Value> {
        let mut aggs = Map::new();
        for key in self.histogram_keys() {
            aggs.insert(
                format!("{key}_min"),
                json!({ "min": { "field": format!("{key}.lower") } }),
            );
            aggs.insert(
                format!("{key}_max"),
                json!({ "max": { "field": format!("{key}.upper") } }),
            );
        }
        if aggs.is_empty() {
            return None;
        }
        Some(json!({ "size": 0, "aggs": aggs }))
    }

    pub fn extract_ranges(&self, raw: &Value) -> BTreeMap<String, RangeBounds> {
        let aggregations = &raw["aggregations"];
        let mut ranges = BTreeMap::new();
        for key in self.histogram_keys() {
            ranges.insert(
                key.to_string(),
                RangeBounds {
                    min: bound_year(&aggregations[format!("{key}_min").as_str()]),
                    max: bound_year(&aggregations[format!("{key}_max").as_str()]),
                },
            );
        }
        ranges
    }

    // Facet aggregations

    fn facet_aggs(
        &self,
        filters: &BTreeMap<&str, &FilterValue>,
        ranges: &BTreeMap<String, RangeBounds>,
    ) -> Result<Map<String, Value>> {
        let mut aggs = Map::new();
        for (key, filter) in &self.filters {
            let kind = self.kind_of(key)?;
            match kind {
                FieldKind::Nested | FieldKind::NestedFlatten
                    if filter.kind == Some(FilterKind::NestedPresent) =>
                {
                    aggs.insert(
                        key.clone(),
                        self.facet_agg(key, filters, json!({ "nested": { "path": key } }))?,
                    );
                    let missing_key = format!("{key}_missing");
                    aggs.insert(
                        missing_key.clone(),
                        self.facet_agg(
                            &missing_key,
                            filters,
                            json!({ "missing": { "field": key } }),
                        )?,
                    );
                }
                FieldKind::Nested | FieldKind::NestedFlatten => {
                    aggs.insert(
                        key.clone(),
                        self.facet_agg(
                            key,
                            filters,
                            nested_terms_agg(key, "id_value", &format!("{key}.id_value")),
                        )?,
                    );
                }
                FieldKind::NestedMultiType => {
                    aggs.insert(
                        key.clone(),
                        self.facet_agg(
                            key,
                            filters,
                            nested_terms_agg(key, "type_id_value", &format!("{key}.type_id_value")),
                        )?,
                    );
                }
                FieldKind::UncertainCenturies => {
                    aggs.insert(
                        key.clone(),
                        self.facet_agg(
                            key,
                            filters,
                            nested_terms_agg(
                                key,
                                "withoutUncertain",
                                &format!("{key}.withoutUncertain"),
                            ),
                        )?,
                    );
                }
                FieldKind::Text | FieldKind::TextList => match filter.kind {
                    Some(FilterKind::Dropdown) | None => {
                        aggs.insert(
                            key.clone(),
                            self.facet_agg(
                                key,
                                filters,
                                json!({
                                    "terms": {
                                        "field": format!("{key}.keyword"),
                                        "size": AGG_TERMS_SIZE,
                                        "min_doc_count": 0,
                                    },
                                }),
                            )?,
                        );
                    }
                    Some(FilterKind::Autocomplete) => {}
                    _ => {
                        return Err(SearchError::Unimplemented {
                            field: key.clone(),
                            kind: kind.as_str().to_string(),
                        })
                    }
                },
                FieldKind::Edtf | FieldKind::EdtfInterval
                    if filter.kind == Some(FilterKind::HistogramSlider) =>
                {
                    let bounds = ranges.get(key).copied().unwrap_or_default();
                    let mut histogram = Map::new();
                    histogram.insert(
                        "field".to_string(),
                        json!(format!("{key}.year_range")),
                    );
                    histogram.insert("interval".to_string(), json!(filter.interval.unwrap_or(10)));
                    histogram.insert("min_doc_count".to_string(), json!(0));
                    if let (Some(min), Some(max)) = (bounds.min, bounds.max) {
                        histogram.insert(
                            "extended_bounds".to_string(),
                            json!({ "min": min, "max": max }),
                        );
                    }
                    let agg_key = format!("{key}_hist");
                    aggs.insert(
                        agg_key.clone(),
                        self.facet_agg(&agg_key, filters, json!({ "histogram": histogram }))?,
                    );
                }
                other => {
                    return Err(SearchError::Unimplemented {
                        field: key.clone(),
                        kind: other.as_str().to_string(),
                    })
                }
            }
        }
        Ok(aggs)
    }

    /// Wraps a facet aggregation in a filter applying every other active
    /// filter. `agg_key` doubles as the sub-aggregation name so extraction
    /// can detect the wrapper.
    fn facet_agg(
        &self,
        agg_key: &str,
        filters: &BTreeMap<&str, &FilterValue>,
        inner: Value,
    ) -> Result<Value> {
        let own_key = agg_key
            .strip_suffix("_hist")
            .or_else(|| agg_key.strip_suffix("_missing"))
            .unwrap_or(agg_key);
        match self.query(filters, Scope::Facet(own_key))? {
            Some(query) => Ok(json!({
                "filter": query,
                "aggs": { (agg_key): inner },
            })),
            None => Ok(inner),
        }
    }

    // Request assembly and extraction

    /// Data request body: pagination, sort, requested fields, query and the
    /// facet aggregations under a `global` scope.
    pub fn compile(
        &self,
        request: &SearchRequest,
        ranges: &BTreeMap<String, RangeBounds>,
    ) -> Result<Value> {
        let (from, size) = self.window(request)?;
        let filters = request.active_filters();

        let mut body = Map::new();
        body.insert("_source".to_string(), json!(false));
        body.insert("track_total_hits".to_string(), json!(true));
        body.insert("from".to_string(), json!(from));
        body.insert("size".to_string(), json!(size));
        body.insert("fields".to_string(), json!(self.doc_fields()?));

        let (sort_by, sort_order) = self.sorting(request);
        if let Some(sort_by) = &sort_by {
            body.insert("sort".to_string(), self.sort_clause(sort_by, sort_order)?);
        }

        if let Some(query) = self.query(&filters, Scope::Data)? {
            body.insert("query".to_string(), query);
        }

        let facet_aggs = self.facet_aggs(&filters, ranges)?;
        if !facet_aggs.is_empty() {
            // The global scope frees facet counts from the data query; each
            // facet re-applies the other filters itself.
            body.insert(
                "aggs".to_string(),
                json!({ "facets": { "global": {}, "aggs": facet_aggs } }),
            );
        }
        Ok(Value::Object(body))
    }

    pub fn extract(
        &self,
        request: &SearchRequest,
        raw: &Value,
        ranges: BTreeMap<String, RangeBounds>,
    ) -> Result<SearchResponse> {
        let (from, _) = self.window(request)?;
        let (sort_by, sort_order) = self.sorting(request);
        let filters = request.active_filters();

        let total = raw["hits"]["total"]["value"].as_u64().unwrap_or(0);
        let results = self.extract_results(raw, sort_by.as_deref(), sort_order)?;
        let aggs = self.extract_aggs(raw, &filters)?;

        let to = from + results.len() as u64;
        Ok(SearchResponse {
            sort_by,
            sort_order,
            total,
            aggs,
            ranges,
            results,
            from: from + 1,
            to,
        })
    }

    fn extract_results(
        &self,
        raw: &Value,
        sort_by: Option<&str>,
        sort_order: SortOrder,
    ) -> Result<Vec<Value>> {
        let hits = raw["hits"]["hits"].as_array().cloned().unwrap_or_default();
        let mut results = Vec::with_capacity(hits.len());
        for hit in hits {
            let mut result = Map::new();
            result.insert("_id".to_string(), hit["_id"].clone());
            let fields = &hit["fields"];
            for (key, _) in &self.columns {
                let kind = self.kind_of(key)?;
                match kind {
                    FieldKind::Nested | FieldKind::NestedMultiType | FieldKind::NestedFlatten => {
                        let Some(rows) = fields[key.as_str()].as_array() else {
                            continue;
                        };
                        let mut rows: Vec<Value> = rows.iter().map(unwrap_field_arrays).collect();
                        // Field values come back in index order; re-sort the
                        // per-row list when it is the active sort column.
                        if sort_by == Some(key.as_str()) {
                            rows.sort_by_key(|row| row["value"].as_str().map(str::to_string));
                            if sort_order == SortOrder::Desc {
                                rows.reverse();
                            }
                        }
                        result.insert(key.clone(), json!(rows));
                    }
                    FieldKind::UncertainCenturies => {
                        let Some(rows) = fields[key.as_str()].as_array() else {
                            continue;
                        };
                        let mut rows: Vec<Value> = rows.iter().map(unwrap_field_arrays).collect();
                        if sort_by == Some(key.as_str()) {
                            rows.sort_by_key(|row| row["numeric"].as_i64());
                            if sort_order == SortOrder::Desc {
                                rows.reverse();
                            }
                        }
                        result.insert(key.clone(), json!(rows));
                    }
                    FieldKind::Edtf | FieldKind::EdtfInterval => {
                        let text_key = format!("{key}.text");
                        if let Some(text) = fields[text_key.as_str()]
                            .as_array()
                            .and_then(|values| values.first())
                        {
                            result.insert(key.clone(), text.clone());
                        }
                    }
                    FieldKind::TextList => {
                        if let Some(values) = fields[key.as_str()].as_array() {
                            result.insert(key.clone(), json!(values));
                        }
                    }
                    FieldKind::Text | FieldKind::TextFlatten | FieldKind::Integer => {
                        if let Some(value) = fields[key.as_str()]
                            .as_array()
                            .and_then(|values| values.first())
                        {
                            result.insert(key.clone(), value.clone());
                        }
                    }
                }
            }
            results.push(Value::Object(result));
        }
        Ok(results)
    }

    fn extract_aggs(
        &self,
        raw: &Value,
        filters: &BTreeMap<&str, &FilterValue>,
    ) -> Result<BTreeMap<String, Vec<FacetBucket>>> {
        let facets = &raw["aggregations"]["facets"];
        let mut aggs = BTreeMap::new();
        for (key, filter) in &self.filters {
            let kind = self.kind_of(key)?;
            let agg_key = match kind {
                FieldKind::Edtf | FieldKind::EdtfInterval => format!("{key}_hist"),
                _ => key.clone(),
            };
            let agg = unwrap_facet(&facets[agg_key.as_str()], &agg_key);
            if agg.is_null() {
                continue;
            }

            let selected: Vec<String> = match filters.get(key.as_str()) {
                Some(FilterValue::Terms(terms)) => terms.clone(),
                _ => Vec::new(),
            };
            let sort = filter.sort.as_deref();

            match kind {
                FieldKind::Nested | FieldKind::NestedFlatten
                    if filter.kind == Some(FilterKind::NestedPresent) =>
                {
                    let missing_key = format!("{key}_missing");
                    let missing = unwrap_facet(&facets[missing_key.as_str()], &missing_key);
                    aggs.insert(
                        key.clone(),
                        vec![
                            FacetBucket {
                                key: json!(0),
                                value: "No".to_string(),
                                count: missing["doc_count"].as_u64().unwrap_or(0),
                            },
                            FacetBucket {
                                key: json!(1),
                                value: "Yes".to_string(),
                                count: agg["doc_count"].as_u64().unwrap_or(0),
                            },
                        ],
                    );
                }
                FieldKind::Nested | FieldKind::NestedFlatten => {
                    let mut buckets = composite_buckets(&agg["id_value"], 1);
                    sort_buckets(&mut buckets, sort, kind)?;
                    aggs.insert(key.clone(), truncate_buckets(buckets, &selected));
                }
                FieldKind::NestedMultiType => {
                    let mut buckets = composite_buckets(&agg["type_id_value"], 2);
                    sort_buckets(&mut buckets, sort, kind)?;
                    aggs.insert(key.clone(), truncate_buckets(buckets, &selected));
                }
                FieldKind::UncertainCenturies => {
                    let mut buckets = plain_buckets(&agg["withoutUncertain"]);
                    sort_buckets(&mut buckets, sort, kind)?;
                    aggs.insert(key.clone(), truncate_buckets(buckets, &selected));
                }
                FieldKind::Text | FieldKind::TextList => {
                    let mut buckets = plain_buckets(agg);
                    sort_buckets(&mut buckets, sort, kind)?;
                    aggs.insert(key.clone(), truncate_buckets(buckets, &selected));
                }
                FieldKind::Edtf | FieldKind::EdtfInterval => {
                    let buckets = agg["buckets"]
                        .as_array()
                        .map(|buckets| {
                            buckets
                                .iter()
                                .map(|bucket| FacetBucket {
                                    key: bucket["key"].clone(),
                                    value: bucket["key"]
                                        .as_f64()
                                        .map(|year| (year as i64).to_string())
                                        .unwrap_or_else(|| bucket["key"].to_string()),
                                    count: bucket["doc_count"].as_u64().unwrap_or(0),
                                })
                                .collect()
                        })
                        .unwrap_or_default();
                    aggs.insert(agg_key, buckets);
                }
                other => {
                    return Err(SearchError::Unimplemented {
                        field: key.clone(),
                        kind: other.as_str().to_string(),
                    })
                }
            }
        }
        Ok(aggs)
    }

    // Suggest

    pub fn suggest_body(&self, field: &str, value: &str) -> Result<Value> {
        if self.widget(field) != Some(FilterKind::Autocomplete) {
            return Err(SearchError::Invalid(format!(
                "`{field}` is not an autocomplete filter"
            )));
        }
        Ok(json!({
            "_source": false,
            "suggest": {
                "autocomplete": {
                    "prefix": value,
                    "completion": {
                        "field": format!("{field}.completion"),
                        "skip_duplicates": true,
                        "size": 10,
                    },
                },
            },
        }))
    }

    pub fn extract_suggestions(raw: &Value) -> Vec<String> {
        raw["suggest"]["autocomplete"][0]["options"]
            .as_array()
            .map(|options| {
                options
                    .iter()
                    .filter_map(|option| option["text"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Executes compiled searches against the document store.
pub struct SearchEngine {
    store: Arc<dyn DocStore>,
    index: Arc<IndexManager>,
}

impl SearchEngine {
    pub fn new(store: Arc<dyn DocStore>, index: Arc<IndexManager>) -> Self {
        Self { store, index }
    }

    pub async fn search(
        &self,
        config: Arc<EntityTypeConfig>,
        request: &SearchRequest,
    ) -> Result<SearchResponse> {
        let compiler = SearchCompiler::new(config);
        let alias = self.index.alias_name(compiler.entity_type_id());

        let ranges = match compiler.full_range_body() {
            Some(body) => {
                let raw =
                    with_retries("search", || self.store.search(&alias, body.clone())).await?;
                compiler.extract_ranges(&raw)
            }
            None => BTreeMap::new(),
        };

        let body = compiler.compile(request, &ranges)?;
        debug!(alias = %alias, "executing search");
        let raw = with_retries("search", || self.store.search(&alias, body.clone())).await?;
        compiler.extract(request, &raw, ranges)
    }

    pub async fn suggest(
        &self,
        config: Arc<EntityTypeConfig>,
        field: &str,
        value: &str,
    ) -> Result<Vec<String>> {
        let compiler = SearchCompiler::new(config);
        let alias = self.index.alias_name(compiler.entity_type_id());
        let body = compiler.suggest_body(field, value)?;
        let raw = with_retries("suggest", || self.store.search(&alias, body.clone())).await?;
        Ok(SearchCompiler::extract_suggestions(&raw))
    }
}

fn sort_mode(order: SortOrder) -> &'static str {
    match order {
        SortOrder::Asc => "min",
        SortOrder::Desc => "max",
    }
}

fn nested_terms_agg(path: &str, name: &str, field: &str) -> Value {
    json!({
        "nested": { "path": path },
        "aggs": {
            (name): {
                "terms": {
                    "field": field,
                    "size": AGG_TERMS_SIZE,
                    "min_doc_count": 0,
                },
                "aggs": {
                    "reverse_nested": { "reverse_nested": {} },
                },
            },
        },
    })
}

/// Strips a facet filter wrapper. Wrapped facets carry their own name as the
/// single sub-aggregation.
fn unwrap_facet<'v>(agg: &'v Value, agg_key: &str) -> &'v Value {
    match agg.get(agg_key) {
        Some(inner) => inner,
        None => agg,
    }
}

/// Per-bucket doc counts come from the reverse-nested sub-aggregation when
/// present, so nested facets count parent documents.
fn bucket_count(bucket: &Value) -> u64 {
    bucket["reverse_nested"]["doc_count"]
        .as_u64()
        .or_else(|| bucket["doc_count"].as_u64())
        .unwrap_or(0)
}

/// Buckets keyed by a `|`-joined composite: the first `key_parts` segments
/// form the bucket key, the remainder is the display value.
fn composite_buckets(agg: &Value, key_parts: usize) -> Vec<FacetBucket> {
    agg["buckets"]
        .as_array()
        .map(|buckets| {
            buckets
                .iter()
                .filter_map(|bucket| {
                    let composite = bucket["key"].as_str()?;
                    let segments: Vec<&str> = composite.splitn(key_parts + 1, '|').collect();
                    let (key, value) = segments.split_at(segments.len().saturating_sub(1));
                    Some(FacetBucket {
                        key: json!(key.join("|")),
                        value: value.first().map(|v| v.to_string()).unwrap_or_default(),
                        count: bucket_count(bucket),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn plain_buckets(agg: &Value) -> Vec<FacetBucket> {
    agg["buckets"]
        .as_array()
        .map(|buckets| {
            buckets
                .iter()
                .map(|bucket| FacetBucket {
                    key: bucket["key"].clone(),
                    value: bucket["key"]
                        .as_str()
                        .map(str::to_string)
                        .unwrap_or_else(|| bucket["key"].to_string()),
                    count: bucket_count(bucket),
                })
                .collect()
        })
        .unwrap_or_default()
}

fn sort_buckets(
    buckets: &mut [FacetBucket],
    sort: Option<&str>,
    kind: FieldKind,
) -> Result<()> {
    let Some(sort) = sort else {
        return Ok(());
    };
    match sort {
        "alphabetically" => buckets.sort_by(|a, b| a.value.cmp(&b.value)),
        "id" => buckets.sort_by_key(|bucket| {
            bucket
                .key
                .as_str()
                .and_then(|key| key.parse::<i64>().ok())
                .unwrap_or(i64::MAX)
        }),
        "chronologically" if kind == FieldKind::UncertainCenturies => {
            buckets.sort_by_key(|bucket| {
                century::parse(&bucket.value)
                    .map(|century| century.numeric)
                    .unwrap_or(u32::MAX)
            })
        }
        other => {
            return Err(SearchError::Invalid(format!(
                "bucket sort `{other}` is not supported for `{}` filters",
                kind.as_str()
            )))
        }
    }
    Ok(())
}

/// Selected buckets always survive; the remainder is filled with non-empty
/// buckets up to the display limit.
fn truncate_buckets(buckets: Vec<FacetBucket>, selected: &[String]) -> Vec<FacetBucket> {
    let budget = AGG_DISPLAY_LIMIT.saturating_sub(selected.len());
    let mut kept_selected = Vec::new();
    let mut additional = Vec::new();
    for bucket in buckets {
        let is_selected = bucket
            .key
            .as_str()
            .map(|key| selected.iter().any(|s| s == key))
            .unwrap_or(false);
        if is_selected && kept_selected.len() < selected.len() {
            kept_selected.push(bucket);
        } else if bucket.count > 0 && additional.len() < budget {
            additional.push(bucket);
        }
    }
    kept_selected.extend(additional);
    kept_selected
}

/// ES `fields` responses wrap every leaf in an array; flatten nested rows to
/// single values.
fn unwrap_field_arrays(row: &Value) -> Value {
    match row.as_object() {
        Some(object) => Value::Object(
            object
                .iter()
                .map(|(key, value)| {
                    let single = value
                        .as_array()
                        .and_then(|values| values.first())
                        .cloned()
                        .unwrap_or_else(|| value.clone());
                    (key.clone(), single)
                })
                .collect(),
        ),
        None => row.clone(),
    }
}

/// Year of a min/max date aggregation value, read from `value_as_string`.
fn bound_year(agg: &Value) -> Option<i64> {
    let text = agg["value_as_string"].as_str()?;
    let (sign, body) = match text.strip_prefix('-') {
        Some(rest) => (-1, rest),
        None => (1, text),
    };
    let year: i64 = body.split('-').next()?.parse().ok()?;
    Some(sign * year)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{catalog_project, StubDocStore};

    async fn config(type_name: &str) -> Arc<EntityTypeConfig> {
        catalog_project()
            .resolver
            .entity_type_config("cinecos", type_name)
            .await
            .unwrap()
    }

    fn terms(values: &[&str]) -> Option<FilterValue> {
        Some(FilterValue::Terms(
            values.iter().map(|v| v.to_string()).collect(),
        ))
    }

    #[tokio::test]
    async fn pagination_stops_at_the_result_window() {
        let compiler = SearchCompiler::new(config("film").await);

        let at_limit = SearchRequest {
            page: Some(400),
            size: Some(25),
            ..SearchRequest::default()
        };
        let body = compiler.compile(&at_limit, &BTreeMap::new()).unwrap();
        assert_eq!(body["from"], json!(9975));
        assert_eq!(body["size"], json!(25));

        let past_limit = SearchRequest {
            page: Some(401),
            size: Some(25),
            ..SearchRequest::default()
        };
        let err = compiler.compile(&past_limit, &BTreeMap::new()).unwrap_err();
        assert!(matches!(
            err,
            SearchError::WindowExceeded {
                from: 10_000,
                size: 25
            }
        ));

        // Page numbers large enough to overflow the offset still hit the
        // window guard instead of wrapping around it.
        let absurd = SearchRequest {
            page: Some(u64::MAX),
            size: Some(25),
            ..SearchRequest::default()
        };
        let err = compiler.compile(&absurd, &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, SearchError::WindowExceeded { .. }));
    }

    #[tokio::test]
    async fn data_request_carries_filters_sort_and_global_facets() {
        let compiler = SearchCompiler::new(config("film").await);
        let mut request = SearchRequest::default();
        request
            .filters
            .insert("genre".to_string(), terms(&["drama"]));
        request.filters.insert(
            "title".to_string(),
            Some(FilterValue::Text("vert".to_string())),
        );

        let body = compiler.compile(&request, &BTreeMap::new()).unwrap();
        assert_eq!(body["_source"], json!(false));
        assert_eq!(body["track_total_hits"], json!(true));
        assert_eq!(body["from"], json!(0));
        assert_eq!(body["size"], json!(DEFAULT_SIZE));
        assert_eq!(
            body["fields"],
            json!([
                "title",
                "year",
                "actors.entity_type_name",
                "actors.id",
                "actors.value",
            ])
        );
        // First sortable column is the default sort.
        assert_eq!(body["sort"], json!([{ "title.normalized_keyword": "asc" }]));
        assert_eq!(
            body["query"],
            json!({
                "bool": {
                    "filter": [{ "terms": { "genre.keyword": ["drama"] } }],
                    "must": [{
                        "match": { "title": { "query": "vert", "operator": "and" } },
                    }],
                },
            })
        );

        assert_eq!(body["aggs"]["facets"]["global"], json!({}));
        let facets = &body["aggs"]["facets"]["aggs"];
        // The genre facet sees the title filter but never its own.
        let genre_wrapper = &facets["genre"]["filter"]["bool"];
        assert!(genre_wrapper.get("must").is_some());
        assert!(genre_wrapper.get("filter").is_none());
        assert_eq!(
            facets["genre"]["aggs"]["genre"]["terms"]["field"],
            json!("genre.keyword")
        );
        // The actors facet sees both active filters.
        let actors_wrapper = &facets["actors"]["filter"]["bool"];
        assert!(actors_wrapper.get("must").is_some());
        assert!(actors_wrapper.get("filter").is_some());
        assert_eq!(
            facets["actors"]["aggs"]["actors"]["aggs"]["id_value"]["terms"]["field"],
            json!("actors.id_value")
        );
    }

    #[tokio::test]
    async fn nested_and_century_filters_compile_to_nested_queries() {
        let compiler = SearchCompiler::new(config("film").await);
        let mut request = SearchRequest::default();
        request.filters.insert("actors".to_string(), terms(&["7"]));

        let body = compiler.compile(&request, &BTreeMap::new()).unwrap();
        assert_eq!(
            body["query"]["bool"]["filter"],
            json!([{
                "nested": {
                    "path": "actors",
                    "query": { "terms": { "actors.id": ["7"] } },
                },
            }])
        );

        let compiler = SearchCompiler::new(config("person").await);
        let mut request = SearchRequest::default();
        request
            .filters
            .insert("century".to_string(), terms(&["XVII"]));
        request.filters.insert(
            "life".to_string(),
            Some(FilterValue::Range(vec![Some(1600), None])),
        );

        let body = compiler.compile(&request, &BTreeMap::new()).unwrap();
        assert_eq!(
            body["query"]["bool"]["filter"],
            json!([
                {
                    "nested": {
                        "path": "century",
                        "query": { "terms": { "century.withoutUncertain": ["XVII"] } },
                    },
                },
                { "range": { "life.year_range": { "gte": 1600 } } },
            ])
        );
    }

    #[tokio::test]
    async fn histogram_probe_reads_unfiltered_bounds() {
        let compiler = SearchCompiler::new(config("person").await);

        let probe = compiler.full_range_body().unwrap();
        assert_eq!(probe["size"], json!(0));
        assert_eq!(
            probe["aggs"]["life_min"],
            json!({ "min": { "field": "life.lower" } })
        );
        assert_eq!(
            probe["aggs"]["life_max"],
            json!({ "max": { "field": "life.upper" } })
        );

        let raw = json!({
            "aggregations": {
                "life_min": { "value": -59958144000000.0, "value_as_string": "-0069-01-01" },
                "life_max": { "value": 61568352000000.0, "value_as_string": "1921-12-31" },
            },
        });
        let ranges = compiler.extract_ranges(&raw);
        assert_eq!(
            ranges["life"],
            RangeBounds {
                min: Some(-69),
                max: Some(1921)
            }
        );

        // Bounds feed the histogram aggregation.
        let body = compiler.compile(&SearchRequest::default(), &ranges).unwrap();
        let hist = &body["aggs"]["facets"]["aggs"]["life_hist"]["histogram"];
        assert_eq!(hist["field"], json!("life.year_range"));
        assert_eq!(hist["interval"], json!(10));
        assert_eq!(hist["extended_bounds"], json!({ "min": -69, "max": 1921 }));

        // No histogram filter configured means no probe at all.
        let film = SearchCompiler::new(config("film").await);
        assert!(film.full_range_body().is_none());
    }

    #[tokio::test]
    async fn extraction_reshapes_hits_and_facet_buckets() {
        let compiler = SearchCompiler::new(config("film").await);
        let mut request = SearchRequest {
            sort_by: Some("actors".to_string()),
            sort_order: Some(SortOrder::Desc),
            ..SearchRequest::default()
        };
        request
            .filters
            .insert("genre".to_string(), terms(&["drama"]));

        let raw = json!({
            "hits": {
                "total": { "value": 2, "relation": "eq" },
                "hits": [
                    {
                        "_id": "1",
                        "fields": {
                            "title": ["Vertigo"],
                            "year": [1958],
                            "actors": [
                                {
                                    "entity_type_name": ["person"],
                                    "id": [7],
                                    "value": ["Albert"],
                                },
                                {
                                    "entity_type_name": ["person"],
                                    "id": [9],
                                    "value": ["Zelda"],
                                },
                            ],
                        },
                    },
                    { "_id": "2", "fields": { "title": ["Rope"], "year": [1948] } },
                ],
            },
            "aggregations": {
                "facets": {
                    "doc_count": 2,
                    // Own filter excluded, so genre comes back unwrapped.
                    "genre": {
                        "buckets": [
                            { "key": "noir", "doc_count": 0 },
                            { "key": "drama", "doc_count": 2 },
                        ],
                    },
                    "actors": {
                        "doc_count": 2,
                        "actors": {
                            "doc_count": 3,
                            "id_value": {
                                "buckets": [{
                                    "key": "7|Albert",
                                    "doc_count": 3,
                                    "reverse_nested": { "doc_count": 2 },
                                }],
                            },
                        },
                    },
                },
            },
        });

        let response = compiler.extract(&request, &raw, BTreeMap::new()).unwrap();
        assert_eq!(response.total, 2);
        assert_eq!(response.from, 1);
        assert_eq!(response.to, 2);
        assert_eq!(response.sort_by.as_deref(), Some("actors"));

        // Nested rows are unwrapped and re-sorted by the active sort column.
        assert_eq!(
            response.results[0]["actors"],
            json!([
                { "entity_type_name": "person", "id": 9, "value": "Zelda" },
                { "entity_type_name": "person", "id": 7, "value": "Albert" },
            ])
        );
        assert_eq!(response.results[0]["title"], json!("Vertigo"));
        assert_eq!(response.results[1]["year"], json!(1948));

        // Empty buckets are dropped unless selected; nested counts come
        // from the reverse-nested sub-aggregation.
        assert_eq!(
            response.aggs["genre"],
            vec![FacetBucket {
                key: json!("drama"),
                value: "drama".to_string(),
                count: 2,
            }]
        );
        assert_eq!(
            response.aggs["actors"],
            vec![FacetBucket {
                key: json!("7"),
                value: "Albert".to_string(),
                count: 2,
            }]
        );
    }

    #[test]
    fn selected_buckets_survive_truncation_even_when_empty() {
        let buckets = vec![
            FacetBucket {
                key: json!("a"),
                value: "a".to_string(),
                count: 0,
            },
            FacetBucket {
                key: json!("b"),
                value: "b".to_string(),
                count: 4,
            },
        ];
        let kept = truncate_buckets(buckets.clone(), &["a".to_string()]);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].key, json!("a"));

        let kept = truncate_buckets(buckets, &[]);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].key, json!("b"));
    }

    #[test]
    fn century_buckets_sort_chronologically() {
        let mut buckets = vec![
            FacetBucket {
                key: json!("XVII"),
                value: "XVII".to_string(),
                count: 1,
            },
            FacetBucket {
                key: json!("IX"),
                value: "IX".to_string(),
                count: 1,
            },
        ];
        sort_buckets(
            &mut buckets,
            Some("chronologically"),
            FieldKind::UncertainCenturies,
        )
        .unwrap();
        assert_eq!(buckets[0].value, "IX");
    }

    #[tokio::test]
    async fn suggest_is_limited_to_autocomplete_filters() {
        let compiler = SearchCompiler::new(config("film").await);

        let err = compiler.suggest_body("genre", "dr").unwrap_err();
        assert!(matches!(err, SearchError::Invalid(_)));

        let body = compiler.suggest_body("title", "ver").unwrap();
        assert_eq!(
            body["suggest"]["autocomplete"]["completion"]["field"],
            json!("title.completion")
        );

        let raw = json!({
            "suggest": {
                "autocomplete": [{
                    "options": [{ "text": "Vertigo" }, { "text": "Vera Cruz" }],
                }],
            },
        });
        assert_eq!(
            SearchCompiler::extract_suggestions(&raw),
            vec!["Vertigo".to_string(), "Vera Cruz".to_string()]
        );
    }

    #[tokio::test]
    async fn histogram_fields_cost_one_extra_request() {
        let fixture = catalog_project();
        let store = StubDocStore::default();
        let index = Arc::new(IndexManager::new(Arc::new(store.clone()), "tessella"));
        let engine = SearchEngine::new(Arc::new(store.clone()), index);

        let film = fixture
            .resolver
            .entity_type_config("cinecos", "film")
            .await
            .unwrap();
        engine.search(film, &SearchRequest::default()).await.unwrap();
        assert_eq!(store.search_requests().len(), 1);

        let person = fixture
            .resolver
            .entity_type_config("cinecos", "person")
            .await
            .unwrap();
        engine.search(person, &SearchRequest::default()).await.unwrap();
        let requests = store.search_requests();
        assert_eq!(requests.len(), 3);
        // The probe runs first and fetches no documents.
        assert_eq!(requests[1].1["size"], json!(0));
        assert!(requests[2].1["aggs"]["facets"]["aggs"]
            .get("life_hist")
            .is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_store_failures_are_retried() {
        let fixture = catalog_project();
        let store = StubDocStore::default();
        let index = Arc::new(IndexManager::new(Arc::new(store.clone()), "tessella"));
        let engine = SearchEngine::new(Arc::new(store.clone()), index);
        let film = fixture
            .resolver
            .entity_type_config("cinecos", "film")
            .await
            .unwrap();

        // Two timeouts in a row stay within the retry budget.
        store.fail_transiently(2);
        let response = engine
            .search(Arc::clone(&film), &SearchRequest::default())
            .await
            .unwrap();
        assert_eq!(response.total, 0);
        assert_eq!(store.search_requests().len(), 1);

        // A third consecutive timeout exhausts it.
        store.fail_transiently(3);
        let err = engine.search(film, &SearchRequest::default()).await.unwrap_err();
        assert!(matches!(err, SearchError::Transient(_)));
    }
}
