//! Transport bindings: the pluggable backends a connection performs queries
//! against.
//!
//! The core only relies on "eventually resolves once". Latency, retries and
//! persistence are the binding's business.

mod documents;
mod http;
mod memory;
mod sqlite;

#[cfg(test)]
pub(crate) mod testing;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::descriptor::QueryDescriptor;
use crate::error::TransportError;

pub use http::HttpBinding;
pub use memory::MemoryBinding;
pub use sqlite::SqliteBinding;

/// Metadata about one backend collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionInfo {
  pub name: String,
  pub count: u64,
}

/// A backend that can perform query descriptors.
#[async_trait]
pub trait Binding: Send + Sync {
  /// Perform one descriptor and return the raw (possibly nested) response.
  async fn perform(&self, query: &QueryDescriptor) -> Result<Value, TransportError>;

  /// List the collections the backend knows about.
  async fn get_all_collections(&self) -> Result<Vec<CollectionInfo>, TransportError>;
}
