//! Graph query core: field-projection grammar, fetch planning, batched plan
//! execution and rendering.
//!
//! The crate turns declarative field expressions into minimal fetch plans,
//! executes them against an abstract [`store::GraphStore`], and evaluates the
//! expressions over the fetched trees. All store access is batched; transient
//! store failures are retried with exponential backoff.

pub mod context;
pub mod error;
pub mod expr;
pub mod gateway;
pub mod plan;
pub mod render;
pub mod retry;
pub mod store;
pub mod testing;
pub mod tree;

pub use context::{props_signature, RelationLoader, RequestContext};
pub use error::{CoreError, Result, StoreError};
pub use expr::{FieldExpression, Leaf, Path, RelationKey, Span, Template};
pub use gateway::GraphGateway;
pub use plan::{parse_filter_clause, FetchPlan, FetchPlanner};
pub use render::{FieldRenderer, MissingPolicy};
pub use store::{
    Direction, EdgeSelector, EntityRow, GraphStore, GraphTransaction, RelationRow, SourceRow,
};
pub use tree::{FetchedTree, RelationEntry};
