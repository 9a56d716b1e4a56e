//! Error types for document building, indexing and search compilation.

use thiserror::Error;

use crate::docstore::DocStoreError;

pub type Result<T> = std::result::Result<T, SearchError>;

/// Result window limit of the document store.
pub const MAX_RESULT_WINDOW: u64 = 10_000;

#[derive(Debug, Error)]
pub enum SearchError {
    /// Configuration lookup failed
    #[error(transparent)]
    Config(#[from] tessella_config::ConfigError),

    /// Fetch planning or graph access failed
    #[error(transparent)]
    Core(#[from] tessella_core::CoreError),

    /// Pagination reaches past the result window
    #[error("window of {from}+{size} exceeds the maximum of {MAX_RESULT_WINDOW}")]
    WindowExceeded { from: u64, size: u64 },

    /// Malformed search request or filter value
    #[error("invalid request: {0}")]
    Invalid(String),

    /// A search field value failed to convert
    #[error("field `{field}`: {message}")]
    Conversion { field: String, message: String },

    /// Configured value type is not supported in this position
    #[error("unimplemented field type `{kind}` for `{field}`")]
    Unimplemented { field: String, kind: String },

    /// Transient document store failure that survived the retry budget
    #[error("transient document store failure: {0}")]
    Transient(String),

    /// Non-retryable document store failure
    #[error("document store failure: {0}")]
    DocStore(String),

    /// Job state persistence failed
    #[error("job store failure: {0}")]
    JobStore(String),
}

impl SearchError {
    pub fn conversion(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Conversion {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Stable machine-readable code for API error envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(inner) => inner.code(),
            Self::Core(inner) => inner.code(),
            Self::WindowExceeded { .. } => "window_exceeded",
            Self::Invalid(_) | Self::Conversion { .. } => "invalid",
            Self::Unimplemented { .. } => "unimplemented",
            Self::Transient(_) => "transient",
            Self::DocStore(_) | Self::JobStore(_) => "store",
        }
    }
}

impl From<DocStoreError> for SearchError {
    fn from(error: DocStoreError) -> Self {
        match error {
            DocStoreError::Transient(message) => Self::Transient(message),
            DocStoreError::Backend(message) => Self::DocStore(message),
        }
    }
}
