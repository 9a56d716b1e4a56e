//! Abstract document store.
//!
//! Index creation, alias management, bulk writes and search are expressed
//! against this seam; the alias action bundle is handed over as one call so
//! the cut-over stays atomic for readers.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Errors surfaced by the document store seam.
#[derive(Debug, Error)]
pub enum DocStoreError {
    /// Transport failure or timeout; safe to retry
    #[error("transient document store failure: {0}")]
    Transient(String),

    /// Non-retryable store failure
    #[error("document store failure: {0}")]
    Backend(String),
}

/// One element of an atomic alias update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AliasAction {
    /// Point `alias` at `index`
    Add { index: String, alias: String },
    /// Drop `index` together with all its aliases
    RemoveIndex { index: String },
}

/// Document to bulk-write: external id plus body.
#[derive(Debug, Clone)]
pub struct BulkDoc {
    pub id: String,
    pub body: Value,
}

#[async_trait]
pub trait DocStore: Send + Sync {
    /// Creates an index with the given settings and mappings body.
    async fn create_index(&self, name: &str, body: Value) -> Result<(), DocStoreError>;

    /// Concrete indices currently behind an alias. Unknown aliases yield an
    /// empty list.
    async fn alias_members(&self, alias: &str) -> Result<Vec<String>, DocStoreError>;

    /// Applies all actions as one atomic bundle.
    async fn update_aliases(&self, actions: &[AliasAction]) -> Result<(), DocStoreError>;

    /// Writes a batch of documents to an index.
    async fn bulk_index(&self, index: &str, docs: &[BulkDoc]) -> Result<(), DocStoreError>;

    /// Runs a search body against an index or alias and returns the raw
    /// response.
    async fn search(&self, index: &str, body: Value) -> Result<Value, DocStoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn _assert_object_safe(_: &dyn DocStore) {}
}
