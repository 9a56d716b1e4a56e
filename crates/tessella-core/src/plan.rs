//! Fetch planning.
//!
//! Given the field expressions a caller wants rendered, the planner emits the
//! minimal tree of properties and traversals the gateway has to load. Plans
//! for the same traversal in both directions keep distinct branches, and plan
//! depth is bounded by the expression set, never by the type graph.

use std::collections::{BTreeMap, BTreeSet};

use tessella_config::{FieldKind, SearchFieldConfig};

use crate::error::{CoreError, Result};
use crate::expr::{self, FieldExpression, Leaf, Path, RelationKey};

/// Minimal description of what to fetch for one entity level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchPlan {
    /// Entity property system names; always contains `id`
    pub e_props: BTreeSet<String>,
    /// Relation property system names of the edge leading here
    pub r_props: BTreeSet<String>,
    /// Traversals to expand below this level
    pub relations: BTreeMap<RelationKey, FetchPlan>,
}

impl Default for FetchPlan {
    fn default() -> Self {
        Self::new()
    }
}

impl FetchPlan {
    pub fn new() -> Self {
        let mut e_props = BTreeSet::new();
        e_props.insert("id".to_string());
        Self {
            e_props,
            r_props: BTreeSet::new(),
            relations: BTreeMap::new(),
        }
    }

    /// Child plan for a traversal, created on first use. Relation branches
    /// always carry the relation and entity `id`.
    pub fn branch(&mut self, key: RelationKey) -> &mut FetchPlan {
        self.relations.entry(key).or_insert_with(|| {
            let mut plan = FetchPlan::new();
            plan.r_props.insert("id".to_string());
            plan
        })
    }

    /// Every property name the plan fetches, across all levels. The renderer
    /// never reads a property outside this set.
    pub fn closure(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        self.collect_closure(&mut names);
        names
    }

    fn collect_closure(&self, names: &mut BTreeSet<String>) {
        names.extend(self.e_props.iter().cloned());
        names.extend(self.r_props.iter().cloned());
        for child in self.relations.values() {
            child.collect_closure(names);
        }
    }

    fn add_path(&mut self, prefix: &[RelationKey], path: &Path) {
        let mut node = self;
        for key in prefix.iter().chain(path.traversals.iter()) {
            node = node.branch(key.clone());
        }
        match &path.leaf {
            Leaf::EntityProp(name) => {
                // display_name and entity_type_name resolve from config, not
                // from stored properties.
                if name != "display_name" && name != "entity_type_name" {
                    node.e_props.insert(name.clone());
                }
            }
            Leaf::RelationProp(name) => {
                node.r_props.insert(name.clone());
            }
        }
    }
}

/// Builds [`FetchPlan`]s from parsed expressions and search configuration.
pub struct FetchPlanner;

impl FetchPlanner {
    /// Merges all paths of all expressions into one plan.
    pub fn plan(expressions: &[FieldExpression]) -> FetchPlan {
        let mut plan = FetchPlan::new();
        for expression in expressions {
            for path in expression.paths() {
                plan.add_path(&[], path);
            }
        }
        plan
    }

    /// Plan for the full `es_data` configuration of one entity type: scalar
    /// selectors, interval start/end selectors, and nested parts rooted at
    /// their base traversal.
    pub fn plan_search_fields(fields: &[SearchFieldConfig]) -> Result<FetchPlan> {
        let mut plan = FetchPlan::new();
        for field in fields {
            match field.kind {
                FieldKind::Text
                | FieldKind::TextList
                | FieldKind::TextFlatten
                | FieldKind::Integer
                | FieldKind::Edtf
                | FieldKind::UncertainCenturies => {
                    let selector = required_selector(field)?;
                    let expression = FieldExpression::parse(selector)?;
                    for path in expression.paths() {
                        plan.add_path(&[], path);
                    }
                }
                FieldKind::EdtfInterval => {
                    for selector in [field.start.as_deref(), field.end.as_deref()]
                        .into_iter()
                        .flatten()
                    {
                        let expression = FieldExpression::parse(selector)?;
                        for path in expression.paths() {
                            plan.add_path(&[], path);
                        }
                    }
                }
                FieldKind::Nested | FieldKind::NestedMultiType | FieldKind::NestedFlatten => {
                    let base = match field.base.as_deref() {
                        Some(raw) => expr::parse_base(raw)?,
                        None => Vec::new(),
                    };
                    for part in field.parts.values() {
                        let expression = FieldExpression::parse(&part.selector_value)?;
                        for path in expression.paths() {
                            plan.add_path(&base, path);
                        }
                    }
                    if let Some(raw) = field.filter.as_deref() {
                        let (selector, _) = parse_filter_clause(raw)?;
                        for path in selector.paths() {
                            plan.add_path(&base, path);
                        }
                    }
                }
            }
        }
        Ok(plan)
    }
}

/// Parses a nested-field filter clause `<selector> == <literal>` into the
/// selector expression and the comparison literal.
pub fn parse_filter_clause(raw: &str) -> Result<(FieldExpression, String)> {
    let (lhs, rhs) = raw
        .split_once(" == ")
        .ok_or_else(|| CoreError::expression(raw, "filter clause must contain ` == `"))?;
    let selector = FieldExpression::parse(lhs.trim())?;
    let literal = rhs.trim().trim_matches('"').to_string();
    Ok((selector, literal))
}

fn required_selector(field: &SearchFieldConfig) -> Result<&str> {
    field.selector_value.as_deref().ok_or_else(|| {
        CoreError::expression(
            &field.system_name,
            format!("`{}` field has no selector", field.kind.as_str()),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(raw: &str) -> FieldExpression {
        FieldExpression::parse(raw).unwrap()
    }

    #[test]
    fn plan_always_fetches_id() {
        let plan = FetchPlanner::plan(&[parse("$title")]);
        assert!(plan.e_props.contains("id"));
        assert!(plan.e_props.contains("title"));
    }

    #[test]
    fn forward_and_inverse_are_distinct_branches() {
        let plan = FetchPlanner::plan(&[parse("$r_cast->$name"), parse("$ri_cast->$title")]);
        assert_eq!(plan.relations.len(), 2);
        assert!(plan
            .relations
            .contains_key(&RelationKey::Forward("cast".to_string())));
        assert!(plan
            .relations
            .contains_key(&RelationKey::Inverse("cast".to_string())));
    }

    #[test]
    fn paths_merge_into_one_branch() {
        let plan = FetchPlanner::plan(&[parse("$r_cast->$name"), parse("$r_cast.order")]);
        let branch = &plan.relations[&RelationKey::Forward("cast".to_string())];
        assert!(branch.e_props.contains("name"));
        assert!(branch.r_props.contains("order"));
        assert!(branch.r_props.contains("id"));
    }

    #[test]
    fn reserved_leaves_are_not_fetched_as_properties() {
        let plan = FetchPlanner::plan(&[parse("$r_cast->$display_name")]);
        let branch = &plan.relations[&RelationKey::Forward("cast".to_string())];
        assert!(!branch.e_props.contains("display_name"));
        assert!(branch.e_props.contains("id"));
    }

    #[test]
    fn closure_covers_every_referenced_property() {
        let expressions = vec![parse("$title"), parse("$r_cast->$name $||$ $r_cast.order")];
        let plan = FetchPlanner::plan(&expressions);
        let closure = plan.closure();
        for expression in &expressions {
            for path in expression.paths() {
                if !matches!(path.leaf.name(), "display_name" | "entity_type_name") {
                    assert!(closure.contains(path.leaf.name()), "{}", path.leaf.name());
                }
            }
        }
    }

    #[test]
    fn nested_field_plans_parts_under_base() {
        let field: SearchFieldConfig = serde_json::from_value(json!({
            "system_name": "cast",
            "type": "nested",
            "base": "$r_cast",
            "parts": {
                "id": { "type": "integer", "selector_value": "$id" },
                "value": { "type": "text", "selector_value": "$name" },
            },
            "filter": "$kind == \"actor\"",
        }))
        .unwrap();
        let plan = FetchPlanner::plan_search_fields(&[field]).unwrap();
        let branch = &plan.relations[&RelationKey::Forward("cast".to_string())];
        assert!(branch.e_props.contains("name"));
        assert!(branch.e_props.contains("kind"));
        assert!(plan.relations.len() == 1);
    }

    #[test]
    fn interval_field_plans_both_bounds() {
        let field: SearchFieldConfig = serde_json::from_value(json!({
            "system_name": "life",
            "type": "edtf_interval",
            "start": "$date_of_birth",
            "end": "$date_of_death",
        }))
        .unwrap();
        let plan = FetchPlanner::plan_search_fields(&[field]).unwrap();
        assert!(plan.e_props.contains("date_of_birth"));
        assert!(plan.e_props.contains("date_of_death"));
    }

    #[test]
    fn scalar_field_without_selector_is_rejected() {
        let field: SearchFieldConfig = serde_json::from_value(json!({
            "system_name": "title",
            "type": "text",
        }))
        .unwrap();
        assert!(FetchPlanner::plan_search_fields(&[field]).is_err());
    }
}
