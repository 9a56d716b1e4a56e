//! Permission-filtered query surface over the graph core.
//!
//! A caller's [`permissions::Permissions`] shape a [`schema::ProjectSchema`]:
//! entity query types with only the granted fields, traversal fields for the
//! relation types the caller may read, and mutation entries for the types the
//! caller may write. [`execute::QueryExecutor`] runs client query trees
//! against that schema with one batched store query per traversal level, and
//! [`mutate::EntityMutator`] applies writes inside a single transaction with
//! a revision record per change.

pub mod error;
pub mod execute;
pub mod mutate;
pub mod permissions;
pub mod schema;
pub mod testing;

pub use error::{Result, SchemaError};
pub use execute::{ClientQuery, QueryExecutor, SourceSelection, TraversalSelection};
pub use mutate::{EntityMutator, RevisionEntry, RevisionError, RevisionLog};
pub use permissions::{
    AuthError, AuthProvider, Permission, Permissions, ProjectPermissions, TypePermissions,
};
pub use schema::{EntityQueryType, ProjectSchema, SchemaBuilder, TraversalField};
