//! Project configuration loading and resolution.
//!
//! Every project carries its own entity types, relation types and search
//! surface configuration. This crate deserializes that configuration,
//! memoizes it per project and answers the name, id and property-key lookups
//! the rest of the system is built on.

pub mod error;
pub mod keys;
pub mod model;
pub mod resolver;
pub mod store;

pub use error::{ConfigError, Result};
pub use keys::{ALL_TYPES, RELATION_MARKER, RELATION_MARKER_KEY, SOURCE_RELATION};
pub use model::{
    ColumnConfig, DataFieldConfig, DisplayConfig, EdtfPosition, EntityTypeConfig, EsDisplayConfig,
    FieldKind, FilterConfig, FilterKind, FilterSection, ProjectConfig, RelationTypeConfig,
    SearchFieldConfig, SearchFieldPart, Validator,
};
pub use resolver::{ConfigResolver, EDIT_RELATION_TITLE};
pub use store::{ConfigStore, EntityTypeRecord, ProjectRecord, RelationTypeRecord};
