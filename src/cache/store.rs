//! The store: entity maps, cached query results and change notification
//! behind one lock.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;

use super::entity_store::{Entity, EntityId, EntityStore, FieldSnapshot};
use super::normalize;
use super::query_cache::{CachedQuery, QueryCache, QueryResult};
use crate::error::NormalizeError;
use crate::schema::Schema;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Change notification published after each mutation step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
  EntityUpserted { collection: String, id: EntityId },
  EntityDeleted { collection: String, id: EntityId },
  QueryUpdated { key: String },
  QueryCleared { key: String },
}

#[derive(Default)]
struct StoreState {
  entities: EntityStore,
  queries: QueryCache,
  collection_versions: HashMap<String, u64>,
  query_versions: HashMap<String, u64>,
}

/// Normalized cache shared by every query of one application.
///
/// Cloning is cheap and yields a handle to the same store. All mutation goes
/// through [`Store::transact`], which runs one closure under the lock and
/// publishes the resulting events once the lock is released.
pub struct Store {
  schema: Arc<Schema>,
  state: Arc<Mutex<StoreState>>,
  events: broadcast::Sender<StoreEvent>,
}

impl Store {
  pub fn new(schema: Schema) -> Self {
    let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
    Self {
      schema: Arc::new(schema),
      state: Arc::new(Mutex::new(StoreState::default())),
      events,
    }
  }

  pub fn schema(&self) -> &Schema {
    &self.schema
  }

  /// Receive change events from now on.
  pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
    self.events.subscribe()
  }

  fn lock(&self) -> MutexGuard<'_, StoreState> {
    // State is only mutated inside `transact`; a panic there cannot leave a
    // half-applied step visible to other callers of this method.
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Run `step` as one atomic mutation.
  pub fn transact<R, F>(&self, step: F) -> R
  where
    F: FnOnce(&mut Transaction<'_>) -> R,
  {
    let (result, events) = {
      let mut state = self.lock();
      let mut tx = Transaction {
        schema: &self.schema,
        state: &mut state,
        events: Vec::new(),
      };
      let result = step(&mut tx);
      (result, tx.events)
    };

    for event in events {
      // No receivers is fine
      let _ = self.events.send(event);
    }
    result
  }

  /// Normalize `entity` (and anything embedded in it) into the store.
  pub fn upsert(&self, collection: &str, entity: &Value) -> Result<QueryResult, NormalizeError> {
    self.transact(|tx| tx.normalize(collection, entity))
  }

  /// The stored record, with relations as id references.
  pub fn get(&self, collection: &str, id: &EntityId) -> Option<Entity> {
    self.lock().entities.get(collection, id).cloned()
  }

  /// Remove an entity and null every reference to it.
  pub fn delete(&self, collection: &str, id: &EntityId) -> bool {
    self.transact(|tx| tx.delete(collection, id))
  }

  /// Rebuild the object graph behind `result`.
  pub fn denormalize(&self, collection: &str, result: &QueryResult) -> Value {
    let state = self.lock();
    normalize::denormalize(&self.schema, &state.entities, collection, result)
  }

  /// A single entity with its relations expanded.
  pub fn resolve(&self, collection: &str, id: &Value) -> Value {
    self.denormalize(collection, &QueryResult::One(id.clone()))
  }

  pub fn cached(&self, key: &str) -> Option<CachedQuery> {
    self.lock().queries.get(key).cloned()
  }

  pub fn has_cached(&self, key: &str) -> bool {
    self.lock().queries.contains(key)
  }

  pub fn clear_result(&self, key: &str) -> bool {
    self.transact(|tx| tx.remove_result(key))
  }

  /// Drop every cached result of a collection.
  pub fn clear_collection(&self, collection: &str) -> usize {
    self.transact(|tx| tx.remove_collection_results(collection))
  }

  /// Drop all entities and cached results.
  pub fn clear(&self) {
    self.transact(|tx| tx.clear())
  }

  pub fn entity_count(&self, collection: &str) -> usize {
    self.lock().entities.len(collection)
  }

  pub fn entity_ids(&self, collection: &str) -> Vec<EntityId> {
    self.lock().entities.ids(collection)
  }

  pub fn cached_query_count(&self) -> usize {
    self.lock().queries.len()
  }

  /// Incremented on every change to an entity of `collection`.
  pub fn collection_version(&self, collection: &str) -> u64 {
    self
      .lock()
      .collection_versions
      .get(collection)
      .copied()
      .unwrap_or(0)
  }

  /// Incremented on every change to the cached result for `key`.
  pub fn query_version(&self, key: &str) -> u64 {
    self.lock().query_versions.get(key).copied().unwrap_or(0)
  }
}

impl Clone for Store {
  fn clone(&self) -> Self {
    Self {
      schema: Arc::clone(&self.schema),
      state: Arc::clone(&self.state),
      events: self.events.clone(),
    }
  }
}

impl std::fmt::Debug for Store {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Store")
      .field("schema", &self.schema)
      .finish_non_exhaustive()
  }
}

/// Mutable view of the store for the duration of one atomic step.
pub struct Transaction<'a> {
  schema: &'a Schema,
  state: &'a mut StoreState,
  events: Vec<StoreEvent>,
}

impl Transaction<'_> {
  pub fn schema(&self) -> &Schema {
    self.schema
  }

  fn record(&mut self, event: StoreEvent) {
    match &event {
      StoreEvent::EntityUpserted { collection, .. } | StoreEvent::EntityDeleted { collection, .. } => {
        *self
          .state
          .collection_versions
          .entry(collection.clone())
          .or_default() += 1;
      }
      StoreEvent::QueryUpdated { key } | StoreEvent::QueryCleared { key } => {
        *self.state.query_versions.entry(key.clone()).or_default() += 1;
      }
    }
    self.events.push(event);
  }

  pub fn normalize(&mut self, collection: &str, raw: &Value) -> Result<QueryResult, NormalizeError> {
    let (result, written) =
      normalize::normalize(self.schema, &mut self.state.entities, collection, raw)?;
    for (collection, id) in written {
      self.record(StoreEvent::EntityUpserted { collection, id });
    }
    Ok(result)
  }

  pub fn denormalize(&self, collection: &str, result: &QueryResult) -> Value {
    normalize::denormalize(self.schema, &self.state.entities, collection, result)
  }

  pub fn get(&self, collection: &str, id: &EntityId) -> Option<&Entity> {
    self.state.entities.get(collection, id)
  }

  pub fn delete(&mut self, collection: &str, id: &EntityId) -> bool {
    let Some((_, touched)) = self.state.entities.delete(self.schema, collection, id) else {
      return false;
    };
    let purged = self.state.queries.purge_reference(collection, id);

    self.record(StoreEvent::EntityDeleted {
      collection: collection.to_string(),
      id: id.clone(),
    });
    for (collection, id) in touched {
      self.record(StoreEvent::EntityUpserted { collection, id });
    }
    for key in purged {
      self.record(StoreEvent::QueryUpdated { key });
    }
    true
  }

  pub fn snapshot_fields<'f, I>(&self, collection: &str, id: &EntityId, fields: I) -> Option<FieldSnapshot>
  where
    I: IntoIterator<Item = &'f str>,
  {
    self.state.entities.snapshot_fields(collection, id, fields)
  }

  pub fn restore_fields(&mut self, snapshot: &FieldSnapshot) -> bool {
    if !self.state.entities.restore_fields(snapshot) {
      return false;
    }
    self.record(StoreEvent::EntityUpserted {
      collection: snapshot.collection.clone(),
      id: snapshot.id.clone(),
    });
    true
  }

  pub fn cached(&self, key: &str) -> Option<&CachedQuery> {
    self.state.queries.get(key)
  }

  pub fn put_result(&mut self, key: &str, collection: &str, result: QueryResult) {
    self.state.queries.put(key, collection, result);
    self.record(StoreEvent::QueryUpdated {
      key: key.to_string(),
    });
  }

  pub fn remove_result(&mut self, key: &str) -> bool {
    if self.state.queries.remove(key).is_none() {
      return false;
    }
    self.record(StoreEvent::QueryCleared {
      key: key.to_string(),
    });
    true
  }

  pub fn remove_collection_results(&mut self, collection: &str) -> usize {
    let keys = self.state.queries.remove_collection(collection);
    let removed = keys.len();
    for key in keys {
      self.record(StoreEvent::QueryCleared { key });
    }
    removed
  }

  pub fn clear(&mut self) {
    for key in self.state.queries.clear() {
      self.record(StoreEvent::QueryCleared { key });
    }
    self.state.entities.clear();
  }
}
