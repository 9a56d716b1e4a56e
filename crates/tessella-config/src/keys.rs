//! Storage key helpers and reserved identifiers.
//!
//! Graph properties are stored under `p_<field-uuid>` keys with dashes
//! replaced by underscores; the literal `id` passes through unchanged.

use uuid::Uuid;

/// Entity system name that unions the property mappings of all entity types.
pub const ALL_TYPES: &str = "__all__";

/// Relation system name denoting source-provenance edges.
pub const SOURCE_RELATION: &str = "_source_";

/// Marker property stored on relation rows fetched through the union
/// mapping, identifying which relation type a row belongs to.
pub const RELATION_MARKER: &str = "__rel__";

/// Storage key the relation marker is stored under.
pub const RELATION_MARKER_KEY: &str = "p___rel__";

/// Replace all dashes in a string with underscores.
pub fn dtu(s: &str) -> String {
    s.replace('-', "_")
}

/// Replace all underscores in a string with dashes.
pub fn utd(s: &str) -> String {
    s.replace('_', "-")
}

/// Storage key for a data field id.
pub fn prop_key(field_id: &Uuid) -> String {
    format!("p_{}", dtu(&field_id.to_string()))
}

/// Parse a `p_<uuid>` storage key back into the field id.
pub fn parse_prop_key(key: &str) -> Option<Uuid> {
    let raw = key.strip_prefix("p_")?;
    Uuid::parse_str(&utd(raw)).ok()
}

/// Whether a system name is reserved and must be rejected at mutation boundaries.
pub fn is_reserved(name: &str) -> bool {
    name == ALL_TYPES || name == SOURCE_RELATION
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prop_key_round_trips() {
        let id = Uuid::new_v4();
        let key = prop_key(&id);
        assert!(key.starts_with("p_"));
        assert!(!key.contains('-'));
        assert_eq!(parse_prop_key(&key), Some(id));
    }

    #[test]
    fn id_key_is_not_a_prop_key() {
        assert_eq!(parse_prop_key("id"), None);
    }

    #[test]
    fn reserved_names() {
        assert!(is_reserved("__all__"));
        assert!(is_reserved("_source_"));
        assert!(!is_reserved("person"));
    }
}
