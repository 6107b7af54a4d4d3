//! A store paired with the binding its queries run against.

use futures::FutureExt;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

use crate::binding::{Binding, CollectionInfo};
use crate::cache::{InFlightTable, SharedResponse, Store};
use crate::descriptor::QueryDescriptor;
use crate::error::TransportError;
use crate::query::{Query, QueryOptions};

/// Connection between the normalized store and a transport binding.
///
/// Cloning yields a handle to the same store, binding slot and in-flight
/// table.
#[derive(Clone)]
pub struct Connection {
  binding: Arc<RwLock<Arc<dyn Binding>>>,
  store: Store,
  in_flight: Arc<InFlightTable>,
}

impl Connection {
  pub fn new<B: Binding + 'static>(binding: B, store: Store) -> Self {
    Self::with_binding(Arc::new(binding), store)
  }

  pub fn with_binding(binding: Arc<dyn Binding>, store: Store) -> Self {
    Self {
      binding: Arc::new(RwLock::new(binding)),
      store,
      in_flight: Arc::new(InFlightTable::new()),
    }
  }

  /// Swap the binding. Calls already in flight finish on the old one.
  pub fn set_binding(&self, binding: Arc<dyn Binding>) {
    *self.binding.write().unwrap_or_else(PoisonError::into_inner) = binding;
  }

  fn binding(&self) -> Arc<dyn Binding> {
    Arc::clone(&self.binding.read().unwrap_or_else(PoisonError::into_inner))
  }

  pub fn store(&self) -> &Store {
    &self.store
  }

  pub fn in_flight(&self) -> &InFlightTable {
    &self.in_flight
  }

  /// Perform `query` on the binding, joining the pending call for the same
  /// query key if there is one.
  pub fn perform(&self, query: &QueryDescriptor) -> SharedResponse {
    let (pending, joined) = self.in_flight.join_or_start(query.key(), || {
      let binding = self.binding();
      let query = query.clone();
      async move { binding.perform(&query).await }.boxed()
    });
    if joined {
      debug!(key = query.key(), %query, "joined in-flight request");
    }
    pending
  }

  pub async fn get_all_collections(&self) -> Result<Vec<CollectionInfo>, TransportError> {
    self.binding().get_all_collections().await
  }

  /// Drop every cached result of `collection` so the next read refetches.
  pub fn invalidate(&self, collection: &str) -> usize {
    let cleared = self.store.clear_collection(collection);
    debug!(collection, cleared, "invalidated cached queries");
    cleared
  }

  /// Build a query bound to this connection.
  pub fn query(&self, descriptor: QueryDescriptor, options: QueryOptions) -> Query {
    Query::new(self.clone(), descriptor, options)
  }
}

impl std::fmt::Debug for Connection {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Connection")
      .field("store", &self.store)
      .field("in_flight", &self.in_flight.len())
      .finish_non_exhaustive()
  }
}
