//! Normalized client-side data access.
//!
//! Queries are plain descriptors (collection, operation, payload) performed
//! through a pluggable [`Binding`](binding::Binding). Responses are normalized
//! into a shared [`Store`](cache::Store) so every entity lives once, results
//! are cached by query key as references, identical in-flight calls are
//! shared, and `update` calls can be applied optimistically with rollback.

pub mod binding;
pub mod cache;
pub mod config;
pub mod connection;
pub mod descriptor;
pub mod error;
pub mod query;
pub mod schema;

pub use connection::Connection;
pub use descriptor::{Operation, OperationKind, QueryDescriptor};
pub use error::{NormalizeError, QueryError, QueryWarning, SchemaError, TransportError};
pub use query::{FetchPolicy, Pending, Query, QueryOptions, QueryStatus};
pub use schema::Schema;
