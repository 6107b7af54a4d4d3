//! Query descriptors and query key derivation.

use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Whether an operation reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
  Read,
  Write,
}

/// Operation performed by a descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(into = "String")]
pub enum Operation {
  FindOne,
  FindMany,
  Count,
  Create,
  Update,
  UpdateMany,
  Delete,
  DeleteMany,
  /// Custom backend action, neither read- nor write-kind
  Action(String),
}

impl Operation {
  pub fn kind(&self) -> Option<OperationKind> {
    match self {
      Self::FindOne | Self::FindMany | Self::Count => Some(OperationKind::Read),
      Self::Create | Self::Update | Self::UpdateMany | Self::Delete | Self::DeleteMany => {
        Some(OperationKind::Write)
      }
      Self::Action(_) => None,
    }
  }

  pub fn is_read(&self) -> bool {
    self.kind() == Some(OperationKind::Read)
  }

  pub fn is_write(&self) -> bool {
    self.kind() == Some(OperationKind::Write)
  }

  /// `delete` and `deleteMany` responses carry no entity to store.
  pub fn is_delete(&self) -> bool {
    matches!(self, Self::Delete | Self::DeleteMany)
  }

  /// `updateMany` and `deleteMany` answer with a summary such as `{count}`.
  pub fn is_bulk(&self) -> bool {
    matches!(self, Self::UpdateMany | Self::DeleteMany)
  }
}

impl fmt::Display for Operation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Self::FindOne => "findOne",
      Self::FindMany => "findMany",
      Self::Count => "count",
      Self::Create => "create",
      Self::Update => "update",
      Self::UpdateMany => "updateMany",
      Self::Delete => "delete",
      Self::DeleteMany => "deleteMany",
      Self::Action(name) => return write!(f, "action:{}", name),
    };
    f.write_str(name)
  }
}

impl From<Operation> for String {
  fn from(op: Operation) -> Self {
    op.to_string()
  }
}

impl FromStr for Operation {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let op = match s {
      "findOne" => Self::FindOne,
      "findMany" => Self::FindMany,
      "count" => Self::Count,
      "create" => Self::Create,
      "update" => Self::Update,
      "updateMany" => Self::UpdateMany,
      "delete" => Self::Delete,
      "deleteMany" => Self::DeleteMany,
      other => match other.strip_prefix("action:") {
        Some(name) if !name.is_empty() => Self::Action(name.to_string()),
        _ => return Err(format!("unknown operation '{}'", s)),
      },
    };
    Ok(op)
  }
}

/// One logical operation against a collection. Immutable once built.
#[derive(Debug, Clone, Serialize)]
pub struct QueryDescriptor {
  collection: String,
  operation: Operation,
  payload: Value,
  #[serde(skip)]
  key: String,
  #[serde(skip)]
  cache_key: String,
}

impl QueryDescriptor {
  pub fn new(collection: impl Into<String>, operation: Operation, payload: Value) -> Self {
    let collection = collection.into();
    let key = query_key(&collection, &operation, &payload);
    let cache_key = match payload.as_object() {
      Some(fields) if fields.contains_key("cursor") => {
        let mut without_cursor = fields.clone();
        without_cursor.remove("cursor");
        query_key(&collection, &operation, &Value::Object(without_cursor))
      }
      _ => key.clone(),
    };
    Self {
      collection,
      operation,
      payload,
      key,
      cache_key,
    }
  }

  pub fn find_one(collection: impl Into<String>, payload: Value) -> Self {
    Self::new(collection, Operation::FindOne, payload)
  }

  pub fn find_many(collection: impl Into<String>, payload: Value) -> Self {
    Self::new(collection, Operation::FindMany, payload)
  }

  pub fn count(collection: impl Into<String>, payload: Value) -> Self {
    Self::new(collection, Operation::Count, payload)
  }

  pub fn create(collection: impl Into<String>, payload: Value) -> Self {
    Self::new(collection, Operation::Create, payload)
  }

  pub fn update(collection: impl Into<String>, payload: Value) -> Self {
    Self::new(collection, Operation::Update, payload)
  }

  pub fn update_many(collection: impl Into<String>, payload: Value) -> Self {
    Self::new(collection, Operation::UpdateMany, payload)
  }

  pub fn delete(collection: impl Into<String>, payload: Value) -> Self {
    Self::new(collection, Operation::Delete, payload)
  }

  pub fn delete_many(collection: impl Into<String>, payload: Value) -> Self {
    Self::new(collection, Operation::DeleteMany, payload)
  }

  pub fn collection(&self) -> &str {
    &self.collection
  }

  pub fn operation(&self) -> &Operation {
    &self.operation
  }

  pub fn payload(&self) -> &Value {
    &self.payload
  }

  /// Deterministic key over collection, operation and the whole payload.
  /// Identifies one backend call; used to share in-flight requests.
  pub fn key(&self) -> &str {
    &self.key
  }

  /// Key of the cached result. Same as [`key`](Self::key) except that the
  /// cursor is left out, so every page of a paginated query accumulates
  /// into one entry.
  pub fn cache_key(&self) -> &str {
    &self.cache_key
  }

  /// `payload.where.<id_field>`, the entity targeted by single-entity writes.
  pub fn where_id(&self, id_field: &str) -> Option<&Value> {
    self
      .payload
      .get("where")
      .and_then(|w| w.get(id_field))
      .filter(|v| !v.is_null())
  }

  /// `payload.data`, the fields written by create/update operations.
  pub fn data(&self) -> Option<&Map<String, Value>> {
    self.payload.get("data").and_then(Value::as_object)
  }

  /// Whether the requested cursor is the "first page" sentinel.
  ///
  /// No cursor, a null cursor, or a cursor object without an id all start
  /// from the beginning.
  pub fn cursor_is_start(&self) -> bool {
    match self.payload.get("cursor") {
      None | Some(Value::Null) => true,
      Some(Value::Object(cursor)) => cursor.get("id").map_or(true, Value::is_null),
      Some(_) => false,
    }
  }
}

impl fmt::Display for QueryDescriptor {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}.{}({})", self.collection, self.operation, self.payload)
  }
}

/// Derive the query key: SHA-256 over collection, operation and the
/// canonical payload.
fn query_key(collection: &str, operation: &Operation, payload: &Value) -> String {
  let input = format!(
    "{}:{}:{}",
    collection,
    operation,
    canonicalize(payload)
  );

  // SHA256 hash for stable, fixed-length keys
  let mut hasher = Sha256::new();
  hasher.update(input.as_bytes());
  hex::encode(hasher.finalize())
}

/// Rebuild a value with object keys inserted in sorted order, so the
/// serialized form is independent of the caller's field order.
fn canonicalize(value: &Value) -> Value {
  match value {
    Value::Object(map) => {
      let mut keys: Vec<&String> = map.keys().collect();
      keys.sort();
      let mut sorted = Map::new();
      for key in keys {
        sorted.insert(key.clone(), canonicalize(&map[key]));
      }
      Value::Object(sorted)
    }
    Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
    other => other.clone(),
  }
}
