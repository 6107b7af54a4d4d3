//! Reference-only query results, keyed by query key.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::collections::HashMap;

use super::entity_store::EntityId;

/// Pagination envelope as returned by the backend, kept verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct Pagination(Value);

impl Pagination {
  pub fn new(raw: Value) -> Self {
    Self(raw)
  }

  pub fn cursor(&self) -> Option<&Value> {
    self.0.get("cursor")
  }

  /// `isLast`, falling back to `last`.
  pub fn is_last(&self) -> bool {
    self
      .0
      .get("isLast")
      .or_else(|| self.0.get("last"))
      .and_then(Value::as_bool)
      .unwrap_or(false)
  }

  pub fn raw(&self) -> &Value {
    &self.0
  }
}

/// One page worth of ids, or the ids accumulated over several pages.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
  pub pagination: Pagination,
  pub ids: Vec<Value>,
}

/// Shape of a query result with every entity replaced by its id.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryResult {
  /// Null response, or a single reference whose target was deleted
  Empty,
  One(Value),
  Many(Vec<Value>),
  Page(Page),
  /// Response stored as-is (deletes, counts, unregistered collections)
  Raw(Value),
}

impl QueryResult {
  /// Drop every reference to `id`. Returns whether anything changed.
  fn purge(&mut self, id: &EntityId) -> bool {
    let matches = |v: &Value| EntityId::from_value(v).as_ref() == Some(id);
    if let Self::One(v) = self {
      let hit = matches(v);
      if hit {
        *self = Self::Empty;
      }
      return hit;
    }
    match self {
      Self::Many(ids) | Self::Page(Page { ids, .. }) => {
        let before = ids.len();
        ids.retain(|v| !matches(v));
        ids.len() != before
      }
      _ => false,
    }
  }
}

/// Merge an incoming page into the previously accumulated one.
///
/// A start-cursor request resets the sequence; otherwise new ids are appended
/// after the previous ones, skipping ids already present.
pub fn merge_page(previous: Option<&Page>, incoming: Page, reset: bool) -> Page {
  let mut ids = match previous {
    Some(prev) if !reset => prev.ids.clone(),
    _ => Vec::new(),
  };

  for id in incoming.ids {
    let key = EntityId::from_value(&id);
    let seen = ids
      .iter()
      .any(|existing| key.is_some() && EntityId::from_value(existing) == key);
    if !seen {
      ids.push(id);
    }
  }

  Page {
    pagination: incoming.pagination,
    ids,
  }
}

#[derive(Debug, Clone)]
pub struct CachedQuery {
  /// Collection the referenced ids belong to
  pub collection: String,
  pub result: QueryResult,
  pub cached_at: DateTime<Utc>,
}

impl CachedQuery {
  pub fn is_stale(&self, stale_time: Duration) -> bool {
    Utc::now() - self.cached_at > stale_time
  }
}

#[derive(Debug, Default)]
pub struct QueryCache {
  entries: HashMap<String, CachedQuery>,
}

impl QueryCache {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn get(&self, key: &str) -> Option<&CachedQuery> {
    self.entries.get(key)
  }

  pub fn contains(&self, key: &str) -> bool {
    self.entries.contains_key(key)
  }

  pub fn put(&mut self, key: &str, collection: &str, result: QueryResult) {
    self.entries.insert(
      key.to_string(),
      CachedQuery {
        collection: collection.to_string(),
        result,
        cached_at: Utc::now(),
      },
    );
  }

  pub fn remove(&mut self, key: &str) -> Option<CachedQuery> {
    self.entries.remove(key)
  }

  /// Remove every entry of a collection, returning the removed keys.
  pub fn remove_collection(&mut self, collection: &str) -> Vec<String> {
    let keys: Vec<String> = self
      .entries
      .iter()
      .filter(|(_, entry)| entry.collection == collection)
      .map(|(key, _)| key.clone())
      .collect();
    for key in &keys {
      self.entries.remove(key);
    }
    keys
  }

  /// Drop references to a deleted entity from every cached result of its
  /// collection. Returns the keys of the rewritten entries.
  pub fn purge_reference(&mut self, collection: &str, id: &EntityId) -> Vec<String> {
    self
      .entries
      .iter_mut()
      .filter(|(_, entry)| entry.collection == collection)
      .filter_map(|(key, entry)| entry.result.purge(id).then(|| key.clone()))
      .collect()
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn clear(&mut self) -> Vec<String> {
    self.entries.drain().map(|(key, _)| key).collect()
  }
}
