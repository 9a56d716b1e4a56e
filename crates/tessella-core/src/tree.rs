//! In-memory result of executing a fetch plan.

use std::collections::BTreeMap;

use serde_json::Value;
use uuid::Uuid;

use crate::expr::RelationKey;

/// Fetched data for one root entity.
#[derive(Debug, Clone, Default)]
pub struct FetchedTree {
    pub entity_type_id: Uuid,
    /// Property values keyed by system name; always contains `id`
    pub e_props: BTreeMap<String, Value>,
    /// Relation expansions keyed by traversal, then by relation id
    pub relations: BTreeMap<RelationKey, BTreeMap<i64, RelationEntry>>,
}

/// One traversed relation: edge properties plus the destination entity.
#[derive(Debug, Clone, Default)]
pub struct RelationEntry {
    pub r_props: BTreeMap<String, Value>,
    pub entity_id: i64,
    pub entity_type_id: Uuid,
    pub e_props: BTreeMap<String, Value>,
    pub relations: BTreeMap<RelationKey, BTreeMap<i64, RelationEntry>>,
    /// Provenance edges of this relation, keyed by source relation id
    pub sources: BTreeMap<i64, RelationEntry>,
}

impl FetchedTree {
    /// All relation entries reached by following a traversal path from the
    /// root, in relation-id order level by level. A `Source` step below a
    /// relation resolves to that relation's provenance edges.
    pub fn entries_at<'t>(&'t self, path: &[RelationKey]) -> Vec<&'t RelationEntry> {
        let Some((first, rest)) = path.split_first() else {
            return Vec::new();
        };
        let mut current: Vec<&RelationEntry> = self
            .relations
            .get(first)
            .map(|entries| entries.values().collect())
            .unwrap_or_default();
        for key in rest {
            let mut next = Vec::new();
            for entry in current {
                if *key == RelationKey::Source {
                    next.extend(entry.sources.values());
                } else if let Some(entries) = entry.relations.get(key) {
                    next.extend(entries.values());
                }
            }
            current = next;
        }
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(entity_id: i64) -> RelationEntry {
        RelationEntry {
            entity_id,
            e_props: BTreeMap::from([("id".to_string(), json!(entity_id))]),
            ..Default::default()
        }
    }

    #[test]
    fn entries_follow_nested_traversals_in_id_order() {
        let cast = RelationKey::Forward("cast".to_string());
        let member = RelationKey::Inverse("member_of".to_string());

        let mut inner = BTreeMap::new();
        inner.insert(3, entry(30));
        inner.insert(1, entry(10));
        let mut outer_entry = entry(5);
        outer_entry.relations.insert(member.clone(), inner);

        let mut tree = FetchedTree::default();
        tree.relations
            .insert(cast.clone(), BTreeMap::from([(9, outer_entry)]));

        let leaves = tree.entries_at(&[cast, member]);
        assert_eq!(
            leaves.iter().map(|e| e.entity_id).collect::<Vec<_>>(),
            vec![10, 30]
        );
    }

    #[test]
    fn source_step_reads_provenance_of_the_relation() {
        let cast = RelationKey::Forward("cast".to_string());
        let mut relation = entry(5);
        relation.sources.insert(2, entry(200));

        let mut tree = FetchedTree::default();
        tree.relations
            .insert(cast.clone(), BTreeMap::from([(1, relation)]));

        let sources = tree.entries_at(&[cast, RelationKey::Source]);
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].entity_id, 200);
    }

    #[test]
    fn missing_branch_yields_no_entries() {
        let tree = FetchedTree::default();
        assert!(tree
            .entries_at(&[RelationKey::Forward("cast".to_string())])
            .is_empty());
    }
}
