//! Search pipeline: document construction from graph data, index lifecycle
//! management, faceted query compilation and background reindex jobs.
//!
//! Documents are denormalised projections of graph entities, shaped by each
//! entity type's search field configuration. The document store is abstract;
//! [`docstore::DocStore`] captures the operations the pipeline needs.

pub mod century;
pub mod docs;
pub mod docstore;
pub mod edtf;
pub mod error;
pub mod index;
pub mod jobs;
pub mod query;
pub mod retry;
pub mod testing;

pub use docs::DocBuilder;
pub use docstore::{AliasAction, BulkDoc, DocStore, DocStoreError};
pub use error::{Result, SearchError, MAX_RESULT_WINDOW};
pub use index::IndexManager;
pub use jobs::{JobRunner, JobStatus, JobStore, JobStoreError, BATCH_SIZE};
pub use query::{
    FacetBucket, FilterValue, RangeBounds, SearchCompiler, SearchEngine, SearchRequest,
    SearchResponse, SortOrder, DEFAULT_SIZE,
};
