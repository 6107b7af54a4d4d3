//! Error types shared by the store, the bindings and the query engine.
//!
//! Every error here is `Clone`: a pending query handle is a shared future and
//! each waiter receives its own copy of the outcome.

use thiserror::Error;

/// Failure reported by a transport binding.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
  /// The backend answered but rejected the operation
  #[error("backend rejected request: {0}")]
  Backend(String),
  /// The request never produced a backend answer (connection, decode, ...)
  #[error("request failed: {0}")]
  Request(String),
  /// Local storage used by a binding failed
  #[error("storage error: {0}")]
  Storage(String),
  #[error("{collection} {id} not found")]
  NotFound { collection: String, id: String },
  #[error("operation {0} is not supported by this binding")]
  Unsupported(String),
  #[error("invalid payload: {0}")]
  InvalidPayload(String),
}

/// Failure while walking a response against a collection shape.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
  #[error("entity in {collection} is missing its id field '{id_field}'")]
  MissingId { collection: String, id_field: String },
  #[error("expected an object for {collection}, found {found}")]
  NotAnObject { collection: String, found: String },
  #[error("collection {0} is not registered")]
  UnknownCollection(String),
}

/// Failure while registering collection shapes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
  #[error("{collection}.{field} points at unregistered collection {target}")]
  UnknownTarget {
    collection: String,
    field: String,
    target: String,
  },
  #[error("collection {0} has an empty id field")]
  EmptyIdField(String),
  #[error("{collection}.{field}: unknown field kind '{kind}' (expected 'scalar' or a relation)")]
  UnknownFieldKind {
    collection: String,
    field: String,
    kind: String,
  },
}

/// Error surfaced through a query's `error` state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
  /// The binding call was rejected; previously cached data is untouched
  #[error("network failure: {0}")]
  Network(#[from] TransportError),
  /// Cache-only policy and nothing cached for the key
  #[error("no cached result for query {key} and fetch policy is cache-only")]
  CacheMiss { key: String },
  /// The rollback record could not be reapplied; the entity is left as-is
  #[error("could not roll back optimistic update of {collection} {id}: entity no longer exists")]
  OptimisticRollback { collection: String, id: String },
  #[error(transparent)]
  Normalize(#[from] NormalizeError),
}

/// Non-fatal diagnostics attached to a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryWarning {
  /// No default fetch policy exists for the operation; network-only was used
  UnresolvedPolicy { key: String, operation: String },
}

impl std::fmt::Display for QueryWarning {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::UnresolvedPolicy { key, operation } => write!(
        f,
        "no cache policy found for {} query with key {}, using network-only",
        operation, key
      ),
    }
  }
}
