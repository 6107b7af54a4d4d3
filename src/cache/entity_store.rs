//! Per-collection entity maps.

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;

use crate::schema::Schema;

/// An entity record: its fields, with relations held as id references.
pub type Entity = Map<String, Value>;

/// Lookup key of an entity within its collection.
///
/// Numeric and string ids share one key space, so `1` and `"1"` name the
/// same entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(String);

impl EntityId {
  pub fn from_value(value: &Value) -> Option<Self> {
    match value {
      Value::String(s) => Some(Self(s.clone())),
      Value::Number(n) => Some(Self(n.to_string())),
      _ => None,
    }
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl From<&str> for EntityId {
  fn from(s: &str) -> Self {
    Self(s.to_string())
  }
}

impl From<u64> for EntityId {
  fn from(n: u64) -> Self {
    Self(n.to_string())
  }
}

impl fmt::Display for EntityId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Prior values of selected fields of one entity. `None` means the field
/// was absent.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSnapshot {
  pub collection: String,
  pub id: EntityId,
  pub fields: Vec<(String, Option<Value>)>,
}

/// Entities touched while nulling references to a deleted entity.
pub type TouchedEntities = Vec<(String, EntityId)>;

#[derive(Debug, Default)]
pub struct EntityStore {
  collections: HashMap<String, HashMap<EntityId, Entity>>,
}

impl EntityStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Shallow-merge `fields` into the entity, inserting it if missing.
  ///
  /// Returns whether anything changed.
  pub fn upsert(&mut self, collection: &str, id: EntityId, fields: Entity) -> bool {
    let entities = self.collections.entry(collection.to_string()).or_default();
    match entities.get_mut(&id) {
      Some(existing) => {
        let mut changed = false;
        for (field, value) in fields {
          if existing.get(&field) != Some(&value) {
            existing.insert(field, value);
            changed = true;
          }
        }
        changed
      }
      None => {
        entities.insert(id, fields);
        true
      }
    }
  }

  pub fn get(&self, collection: &str, id: &EntityId) -> Option<&Entity> {
    self.collections.get(collection)?.get(id)
  }

  pub fn contains(&self, collection: &str, id: &EntityId) -> bool {
    self.get(collection, id).is_some()
  }

  /// Remove the entity and null every reference to it held by other
  /// entities. Returns the removed record and the entities that were
  /// rewritten, or `None` if the entity did not exist.
  pub fn delete(
    &mut self,
    schema: &Schema,
    collection: &str,
    id: &EntityId,
  ) -> Option<(Entity, TouchedEntities)> {
    let removed = self.collections.get_mut(collection)?.remove(id)?;
    let mut touched = Vec::new();

    for (owner, field, relation) in schema.relations_to(collection) {
      let Some(entities) = self.collections.get_mut(owner) else {
        continue;
      };
      for (owner_id, entity) in entities.iter_mut() {
        let Some(value) = entity.get_mut(field) else {
          continue;
        };
        let rewritten = if relation.many {
          match value {
            Value::Array(refs) => {
              let before = refs.len();
              refs.retain(|r| EntityId::from_value(r).as_ref() != Some(id));
              refs.len() != before
            }
            _ => false,
          }
        } else if EntityId::from_value(value).as_ref() == Some(id) {
          *value = Value::Null;
          true
        } else {
          false
        };
        // One entry per entity, however many of its fields pointed here
        let entry = (owner.to_string(), owner_id.clone());
        if rewritten && !touched.contains(&entry) {
          touched.push(entry);
        }
      }
    }

    Some((removed, touched))
  }

  /// Capture the current values of `fields` on an entity.
  pub fn snapshot_fields<'a, I>(
    &self,
    collection: &str,
    id: &EntityId,
    fields: I,
  ) -> Option<FieldSnapshot>
  where
    I: IntoIterator<Item = &'a str>,
  {
    let entity = self.get(collection, id)?;
    Some(FieldSnapshot {
      collection: collection.to_string(),
      id: id.clone(),
      fields: fields
        .into_iter()
        .map(|f| (f.to_string(), entity.get(f).cloned()))
        .collect(),
    })
  }

  /// Put the snapshot's values back. Fields that were absent are removed.
  /// Returns false if the entity no longer exists.
  pub fn restore_fields(&mut self, snapshot: &FieldSnapshot) -> bool {
    let Some(entity) = self
      .collections
      .get_mut(&snapshot.collection)
      .and_then(|entities| entities.get_mut(&snapshot.id))
    else {
      return false;
    };

    for (field, value) in &snapshot.fields {
      match value {
        Some(v) => {
          entity.insert(field.clone(), v.clone());
        }
        None => {
          entity.remove(field);
        }
      }
    }
    true
  }

  pub fn len(&self, collection: &str) -> usize {
    self.collections.get(collection).map_or(0, HashMap::len)
  }

  pub fn ids(&self, collection: &str) -> Vec<EntityId> {
    let mut ids: Vec<EntityId> = self
      .collections
      .get(collection)
      .map(|entities| entities.keys().cloned().collect())
      .unwrap_or_default();
    ids.sort();
    ids
  }

  pub fn clear(&mut self) {
    self.collections.clear();
  }
}
