//! Error types for schema building, execution and mutation.

use thiserror::Error;

use crate::permissions::AuthError;

pub type Result<T> = std::result::Result<T, SchemaError>;

#[derive(Debug, Error)]
pub enum SchemaError {
    /// Configuration lookup failed
    #[error(transparent)]
    Config(#[from] tessella_config::ConfigError),

    /// Fetch planning or graph access failed
    #[error(transparent)]
    Core(#[from] tessella_core::CoreError),

    /// The request names something the schema does not expose
    #[error("unknown {kind} `{name}`")]
    NotFound { kind: &'static str, name: String },

    /// The caller lacks the permission for the requested operation
    #[error("not authorized: {0}")]
    Unauthorized(String),

    /// Malformed request body or field value
    #[error("invalid request: {0}")]
    Invalid(String),

    /// Revision persistence failed
    #[error("revision log failure: {0}")]
    Revision(String),
}

impl SchemaError {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Stable machine-readable code for API error envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(inner) => inner.code(),
            Self::Core(inner) => inner.code(),
            Self::NotFound { .. } => "not_found",
            Self::Unauthorized(_) => "unauthorized",
            Self::Invalid(_) => "invalid",
            Self::Revision(_) => "store",
        }
    }
}

impl From<AuthError> for SchemaError {
    fn from(error: AuthError) -> Self {
        Self::Unauthorized(error.0)
    }
}
