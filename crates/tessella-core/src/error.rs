//! Error types for fetch planning, graph access and rendering.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors surfaced by the graph store seam.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Transport failure or timeout; safe to retry
    #[error("transient graph store failure: {0}")]
    Transient(String),

    /// Non-retryable store failure
    #[error("graph store failure: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum CoreError {
    /// Configuration lookup failed
    #[error(transparent)]
    Config(#[from] tessella_config::ConfigError),

    /// Field-projection expression failed to parse
    #[error("invalid field expression `{expr}`: {message}")]
    Expression { expr: String, message: String },

    /// A stored entity or relation row failed to parse as JSON
    #[error("corrupt graph row {row_id}: {source}")]
    CorruptGraph {
        row_id: i64,
        #[source]
        source: serde_json::Error,
    },

    /// Transport failure that survived the retry budget
    #[error("transient graph store failure: {0}")]
    Transient(String),

    /// Non-retryable store failure
    #[error("graph store failure: {0}")]
    Store(String),
}

impl CoreError {
    pub fn expression(expr: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Expression {
            expr: expr.into(),
            message: message.into(),
        }
    }

    /// Stable machine-readable code for API error envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(inner) => inner.code(),
            Self::Expression { .. } => "invalid",
            Self::CorruptGraph { .. } => "corrupt_graph",
            Self::Transient(_) => "transient",
            Self::Store(_) => "store",
        }
    }
}

impl From<StoreError> for CoreError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::Transient(message) => Self::Transient(message),
            StoreError::Backend(message) => Self::Store(message),
        }
    }
}
