//! Error types for tessella-config

use thiserror::Error;

/// Errors that can occur while loading or resolving configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Unknown project system name
    #[error("Project \"{name}\" not found")]
    ProjectNotFound { name: String },

    /// Unknown entity type system name within a project
    #[error("Entity type \"{name}\" of project \"{project}\" not found")]
    EntityTypeNotFound { project: String, name: String },

    /// Unknown entity type id within a project
    #[error("Entity type with id \"{id}\" of project \"{project}\" not found")]
    EntityTypeIdNotFound { project: String, id: uuid::Uuid },

    /// Unknown relation type system name within a project
    #[error("Relation type \"{name}\" of project \"{project}\" not found")]
    RelationTypeNotFound { project: String, name: String },

    /// Duplicate `(project, system_name)` on a configuration write
    #[error("\"{name}\" already exists in project \"{project}\"")]
    Conflict { project: String, name: String },

    /// A reserved system name (`__all__`, `_source_`) appeared in user input
    #[error("\"{name}\" is a reserved system name")]
    ReservedName { name: String },

    /// Stored configuration failed to deserialize
    #[error("Invalid configuration for \"{name}\": {source}")]
    Invalid {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    /// Transport failure from the backing configuration store
    #[error("Configuration store error: {0}")]
    Store(String),
}

impl ConfigError {
    /// Stable machine-readable code for API surfaces.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ProjectNotFound { .. }
            | Self::EntityTypeNotFound { .. }
            | Self::EntityTypeIdNotFound { .. }
            | Self::RelationTypeNotFound { .. } => "not_found",
            Self::Conflict { .. } => "conflict",
            Self::ReservedName { .. } | Self::Invalid { .. } => "invalid",
            Self::Store(_) => "transient",
        }
    }
}

/// Result type for tessella-config operations
pub type Result<T> = std::result::Result<T, ConfigError>;
