//! In-process binding holding documents in memory.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use super::documents::evaluate;
use super::{Binding, CollectionInfo};
use crate::descriptor::QueryDescriptor;
use crate::error::TransportError;

/// Runtime binding: a backend that lives in the current process.
#[derive(Debug, Default)]
pub struct MemoryBinding {
  collections: Mutex<BTreeMap<String, Vec<Value>>>,
}

impl MemoryBinding {
  pub fn new() -> Self {
    Self::default()
  }

  /// Create a binding pre-populated with documents per collection.
  pub fn with_documents(seed: BTreeMap<String, Vec<Value>>) -> Self {
    Self {
      collections: Mutex::new(seed),
    }
  }

  /// Parse a seed of the form `{"Collection": [doc, ...], ...}`.
  pub fn from_seed(seed: &Value) -> Result<Self, TransportError> {
    let seed: BTreeMap<String, Vec<Value>> = serde_json::from_value(seed.clone())
      .map_err(|e| TransportError::InvalidPayload(format!("invalid seed: {}", e)))?;
    Ok(Self::with_documents(seed))
  }

  /// Snapshot of a collection's documents.
  pub fn documents(&self, collection: &str) -> Vec<Value> {
    self
      .collections
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .get(collection)
      .cloned()
      .unwrap_or_default()
  }
}

#[async_trait]
impl Binding for MemoryBinding {
  async fn perform(&self, query: &QueryDescriptor) -> Result<Value, TransportError> {
    let mut collections = self
      .collections
      .lock()
      .unwrap_or_else(PoisonError::into_inner);
    let docs = collections
      .entry(query.collection().to_string())
      .or_default();
    Ok(evaluate(docs, query)?.response)
  }

  async fn get_all_collections(&self) -> Result<Vec<CollectionInfo>, TransportError> {
    let collections = self
      .collections
      .lock()
      .unwrap_or_else(PoisonError::into_inner);
    Ok(
      collections
        .iter()
        .map(|(name, docs)| CollectionInfo {
          name: name.clone(),
          count: docs.len() as u64,
        })
        .collect(),
    )
  }
}
