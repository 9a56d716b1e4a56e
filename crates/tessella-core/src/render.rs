//! Field expression evaluation against fetched trees.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use tessella_config::EntityTypeConfig;

use crate::expr::{FieldExpression, Leaf, Path, RelationKey, Span, Template};
use crate::tree::{FetchedTree, RelationEntry};

/// What to do when a path leaf has no value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingPolicy {
    /// Drop the rendering
    Omit,
    /// Substitute the literal `N/A`
    NotAvailable,
}

const NOT_AVAILABLE: &str = "N/A";

#[derive(Clone, Copy)]
enum Context<'t> {
    Root(&'t FetchedTree),
    Entry(&'t RelationEntry),
}

impl<'t> Context<'t> {
    fn expand(&self, key: &RelationKey) -> Vec<Context<'t>> {
        match self {
            Context::Root(tree) => tree
                .relations
                .get(key)
                .map(|entries| entries.values().map(Context::Entry).collect())
                .unwrap_or_default(),
            Context::Entry(entry) => {
                if *key == RelationKey::Source {
                    entry.sources.values().map(Context::Entry).collect()
                } else {
                    entry
                        .relations
                        .get(key)
                        .map(|entries| entries.values().map(Context::Entry).collect())
                        .unwrap_or_default()
                }
            }
        }
    }

    fn entity_type_id(&self) -> Uuid {
        match self {
            Context::Root(tree) => tree.entity_type_id,
            Context::Entry(entry) => entry.entity_type_id,
        }
    }

    fn e_prop(&self, name: &str) -> Option<&'t Value> {
        match self {
            Context::Root(tree) => tree.e_props.get(name),
            Context::Entry(entry) => entry.e_props.get(name),
        }
    }

    fn r_prop(&self, name: &str) -> Option<&'t Value> {
        match self {
            Context::Root(_) => None,
            Context::Entry(entry) => entry.r_props.get(name),
        }
    }
}

/// Renders field expressions to strings.
pub struct FieldRenderer;

impl FieldRenderer {
    /// Renders an expression against a fetched tree. Alternatives contribute
    /// in order; duplicates are dropped.
    pub fn render(
        expression: &FieldExpression,
        tree: &FetchedTree,
        configs: &BTreeMap<String, Arc<EntityTypeConfig>>,
        policy: MissingPolicy,
    ) -> Vec<String> {
        Self::render_context(expression, Context::Root(tree), configs, policy)
    }

    /// Renders an expression with a relation entry as the current context, as
    /// nested search field parts do.
    pub fn render_entry(
        expression: &FieldExpression,
        entry: &RelationEntry,
        configs: &BTreeMap<String, Arc<EntityTypeConfig>>,
        policy: MissingPolicy,
    ) -> Vec<String> {
        Self::render_context(expression, Context::Entry(entry), configs, policy)
    }

    fn render_context(
        expression: &FieldExpression,
        root: Context<'_>,
        configs: &BTreeMap<String, Arc<EntityTypeConfig>>,
        policy: MissingPolicy,
    ) -> Vec<String> {
        let mut output: Vec<String> = Vec::new();
        for template in &expression.alternatives {
            for rendering in render_template(template, root, configs, policy) {
                let rendering = rendering.replace('\'', "\"");
                if !output.contains(&rendering) {
                    output.push(rendering);
                }
            }
        }
        output
    }
}

fn render_template(
    template: &Template,
    root: Context<'_>,
    configs: &BTreeMap<String, Arc<EntityTypeConfig>>,
    policy: MissingPolicy,
) -> Vec<String> {
    let paths: Vec<&Path> = template.paths().collect();
    let prefix = common_prefix(&paths);

    // The common traversal prefix is applied once so sibling paths of one
    // template stay paired per relation entry.
    let mut contexts = vec![root];
    for key in &prefix {
        contexts = contexts
            .iter()
            .flat_map(|context| context.expand(key))
            .collect();
    }

    let mut renderings = Vec::new();
    for context in contexts {
        renderings.extend(render_spans(template, context, &prefix, configs, policy));
    }
    renderings
}

fn render_spans(
    template: &Template,
    context: Context<'_>,
    prefix: &[RelationKey],
    configs: &BTreeMap<String, Arc<EntityTypeConfig>>,
    policy: MissingPolicy,
) -> Vec<String> {
    let mut acc = vec![String::new()];
    for span in &template.spans {
        match span {
            Span::Literal(text) => {
                for rendering in &mut acc {
                    rendering.push_str(text);
                }
            }
            Span::Path(path) => {
                let tail = &path.traversals[prefix.len()..];
                let mut leaves = vec![context];
                for key in tail {
                    leaves = leaves
                        .iter()
                        .flat_map(|context| context.expand(key))
                        .collect();
                }
                let mut values: Vec<String> = Vec::new();
                for leaf_context in leaves {
                    if let Some(value) = resolve_leaf(&path.leaf, leaf_context, configs) {
                        values.push(value);
                    }
                }
                if values.is_empty() {
                    match policy {
                        MissingPolicy::Omit => return Vec::new(),
                        MissingPolicy::NotAvailable => values.push(NOT_AVAILABLE.to_string()),
                    }
                }
                acc = acc
                    .iter()
                    .flat_map(|rendering| {
                        values.iter().map(move |value| {
                            let mut combined = rendering.clone();
                            combined.push_str(value);
                            combined
                        })
                    })
                    .collect();
            }
        }
    }
    acc
}

fn resolve_leaf(
    leaf: &Leaf,
    context: Context<'_>,
    configs: &BTreeMap<String, Arc<EntityTypeConfig>>,
) -> Option<String> {
    let value = match leaf {
        Leaf::EntityProp(name) => match name.as_str() {
            "display_name" => {
                return config_by_id(configs, context.entity_type_id())
                    .map(|config| config.display_name.clone());
            }
            "entity_type_name" => {
                return config_by_id(configs, context.entity_type_id())
                    .map(|config| config.system_name.clone());
            }
            _ => context.e_prop(name)?,
        },
        Leaf::RelationProp(name) => context.r_prop(name)?,
    };
    stringify(value)
}

fn config_by_id(
    configs: &BTreeMap<String, Arc<EntityTypeConfig>>,
    entity_type_id: Uuid,
) -> Option<&Arc<EntityTypeConfig>> {
    configs.values().find(|config| config.id == entity_type_id)
}

fn stringify(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Array(_) | Value::Object(_) => serde_json::to_string(value).ok(),
    }
}

fn common_prefix(paths: &[&Path]) -> Vec<RelationKey> {
    let Some(first) = paths.first() else {
        return Vec::new();
    };
    let mut prefix: Vec<RelationKey> = first.traversals.clone();
    for path in &paths[1..] {
        let shared = prefix
            .iter()
            .zip(path.traversals.iter())
            .take_while(|(a, b)| a == b)
            .count();
        prefix.truncate(shared);
    }
    prefix
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn configs() -> BTreeMap<String, Arc<EntityTypeConfig>> {
        let mut configs = BTreeMap::new();
        for (name, display) in [("film", "Film"), ("person", "Person")] {
            let config: EntityTypeConfig = serde_json::from_value(json!({
                "id": Uuid::new_v4(),
                "system_name": name,
                "display_name": display,
            }))
            .unwrap();
            configs.insert(name.to_string(), Arc::new(config));
        }
        configs
    }

    fn person_entry(relation_id: i64, entity_id: i64, props: &[(&str, Value)]) -> (i64, RelationEntry) {
        let mut e_props = BTreeMap::from([("id".to_string(), json!(entity_id))]);
        for (name, value) in props {
            e_props.insert(name.to_string(), value.clone());
        }
        (
            relation_id,
            RelationEntry {
                r_props: BTreeMap::from([("id".to_string(), json!(relation_id))]),
                entity_id,
                entity_type_id: Uuid::nil(),
                e_props,
                relations: BTreeMap::new(),
                sources: BTreeMap::new(),
            },
        )
    }

    fn film_tree(configs: &BTreeMap<String, Arc<EntityTypeConfig>>) -> FetchedTree {
        FetchedTree {
            entity_type_id: configs["film"].id,
            e_props: BTreeMap::from([
                ("id".to_string(), json!(1)),
                ("title".to_string(), json!("Vertigo")),
            ]),
            relations: BTreeMap::new(),
        }
    }

    fn parse(raw: &str) -> FieldExpression {
        FieldExpression::parse(raw).unwrap()
    }

    #[test]
    fn renders_a_simple_property() {
        let configs = configs();
        let tree = film_tree(&configs);
        let values = FieldRenderer::render(&parse("$title"), &tree, &configs, MissingPolicy::Omit);
        assert_eq!(values, vec!["Vertigo"]);
    }

    #[test]
    fn reserved_leaves_resolve_from_config() {
        let configs = configs();
        let tree = film_tree(&configs);
        assert_eq!(
            FieldRenderer::render(&parse("$display_name"), &tree, &configs, MissingPolicy::Omit),
            vec!["Film"]
        );
        assert_eq!(
            FieldRenderer::render(
                &parse("$entity_type_name"),
                &tree,
                &configs,
                MissingPolicy::Omit
            ),
            vec!["film"]
        );
    }

    #[test]
    fn common_base_keeps_sibling_paths_paired() {
        let configs = configs();
        let mut tree = film_tree(&configs);
        let cast = RelationKey::Forward("acted_in".to_string());
        tree.relations.insert(
            cast,
            BTreeMap::from([
                person_entry(1, 7, &[("title", json!("A"))]),
                person_entry(2, 9, &[("title", json!("B'C"))]),
            ]),
        );

        let expression =
            parse("$r_acted_in->$title $||$ [$r_acted_in->$id] $r_acted_in->$title");
        let values = FieldRenderer::render(&expression, &tree, &configs, MissingPolicy::Omit);
        assert_eq!(values, vec!["A", "B\"C", "[7] A", "[9] B\"C"]);
    }

    #[test]
    fn relation_property_leaf_reads_edge_properties() {
        let configs = configs();
        let mut tree = film_tree(&configs);
        let (relation_id, mut entry) = person_entry(5, 10, &[]);
        entry.r_props.insert("order".to_string(), json!("2"));
        tree.relations.insert(
            RelationKey::Forward("cast".to_string()),
            BTreeMap::from([(relation_id, entry)]),
        );

        let values =
            FieldRenderer::render(&parse("$r_cast.order"), &tree, &configs, MissingPolicy::Omit);
        assert_eq!(values, vec!["2"]);
    }

    #[test]
    fn missing_policy_controls_unresolved_leaves() {
        let configs = configs();
        let tree = film_tree(&configs);
        assert!(FieldRenderer::render(&parse("$year"), &tree, &configs, MissingPolicy::Omit)
            .is_empty());
        assert_eq!(
            FieldRenderer::render(
                &parse("$year"),
                &tree,
                &configs,
                MissingPolicy::NotAvailable
            ),
            vec!["N/A"]
        );
    }

    #[test]
    fn empty_traversal_level_renders_nothing() {
        let configs = configs();
        let tree = film_tree(&configs);
        let values = FieldRenderer::render(
            &parse("$r_cast->$name"),
            &tree,
            &configs,
            MissingPolicy::Omit,
        );
        assert!(values.is_empty());
    }

    #[test]
    fn alternatives_union_without_duplicates() {
        let configs = configs();
        let tree = film_tree(&configs);
        let values = FieldRenderer::render(
            &parse("$title $||$ $title"),
            &tree,
            &configs,
            MissingPolicy::Omit,
        );
        assert_eq!(values, vec!["Vertigo"]);
    }

    #[test]
    fn list_values_render_as_json() {
        let configs = configs();
        let mut tree = film_tree(&configs);
        tree.e_props
            .insert("genre".to_string(), json!(["noir", "thriller"]));
        let values =
            FieldRenderer::render(&parse("$genre"), &tree, &configs, MissingPolicy::Omit);
        assert_eq!(values, vec![r#"["noir","thriller"]"#]);
    }
}
