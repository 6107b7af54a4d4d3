//! Normalization of nested responses into the entity store, and the
//! reverse walk that rebuilds object graphs from references.

use serde_json::{Map, Value};

use super::entity_store::{EntityId, EntityStore};
use super::query_cache::{Page, Pagination, QueryResult};
use crate::error::NormalizeError;
use crate::schema::{CollectionShape, Schema};

/// Entities written while normalizing one response, in write order.
pub type Written = Vec<(String, EntityId)>;

/// Extract every entity of `raw` into `entities` and describe the response
/// by reference.
///
/// Children are stored before their parents. `raw` may be an entity object,
/// an array of entity objects, a `{pagination, data}` envelope or null; any
/// other value is kept as [`QueryResult::Raw`].
pub fn normalize(
  schema: &Schema,
  entities: &mut EntityStore,
  collection: &str,
  raw: &Value,
) -> Result<(QueryResult, Written), NormalizeError> {
  let shape = schema
    .get(collection)
    .ok_or_else(|| NormalizeError::UnknownCollection(collection.to_string()))?;
  let mut written = Vec::new();

  let result = match raw {
    Value::Null => QueryResult::Empty,
    Value::Array(items) => QueryResult::Many(normalize_all(
      schema,
      entities,
      shape,
      items,
      &mut written,
    )?),
    Value::Object(obj) if is_page(obj) => {
      let items = obj.get("data").and_then(Value::as_array).map(Vec::as_slice);
      let ids = normalize_all(schema, entities, shape, items.unwrap_or(&[]), &mut written)?;
      let pagination = obj.get("pagination").cloned().unwrap_or(Value::Null);
      QueryResult::Page(Page {
        pagination: Pagination::new(pagination),
        ids,
      })
    }
    Value::Object(obj) => {
      QueryResult::One(normalize_entity(schema, entities, shape, obj, &mut written)?)
    }
    other => QueryResult::Raw(other.clone()),
  };

  Ok((result, written))
}

fn is_page(obj: &Map<String, Value>) -> bool {
  obj.contains_key("pagination") && obj.get("data").is_some_and(Value::is_array)
}

fn normalize_all(
  schema: &Schema,
  entities: &mut EntityStore,
  shape: &CollectionShape,
  items: &[Value],
  written: &mut Written,
) -> Result<Vec<Value>, NormalizeError> {
  items
    .iter()
    .map(|item| match item {
      Value::Object(obj) => normalize_entity(schema, entities, shape, obj, written),
      other => Err(NormalizeError::NotAnObject {
        collection: shape.name().to_string(),
        found: type_name(other).to_string(),
      }),
    })
    .collect()
}

fn normalize_entity(
  schema: &Schema,
  entities: &mut EntityStore,
  shape: &CollectionShape,
  obj: &Map<String, Value>,
  written: &mut Written,
) -> Result<Value, NormalizeError> {
  let id_value = shape
    .id_of(obj)
    .cloned()
    .ok_or_else(|| missing_id(shape))?;
  let id = EntityId::from_value(&id_value).ok_or_else(|| missing_id(shape))?;

  let mut record = Map::with_capacity(obj.len());
  for (field, value) in obj {
    let stored = match shape.relation(field) {
      Some(rel) => {
        let target = schema
          .get(&rel.target)
          .ok_or_else(|| NormalizeError::UnknownCollection(rel.target.clone()))?;
        match value {
          Value::Array(items) if rel.many => Value::Array(
            items
              .iter()
              .map(|item| normalize_reference(schema, entities, target, item, written))
              .collect::<Result<_, _>>()?,
          ),
          other => normalize_reference(schema, entities, target, other, written)?,
        }
      }
      None => value.clone(),
    };
    record.insert(field.clone(), stored);
  }

  entities.upsert(shape.name(), id.clone(), record);
  written.push((shape.name().to_string(), id));
  Ok(id_value)
}

/// Embedded objects are extracted; ids and nulls are already references.
fn normalize_reference(
  schema: &Schema,
  entities: &mut EntityStore,
  target: &CollectionShape,
  value: &Value,
  written: &mut Written,
) -> Result<Value, NormalizeError> {
  match value {
    Value::Object(obj) => normalize_entity(schema, entities, target, obj, written),
    other => Ok(other.clone()),
  }
}

fn missing_id(shape: &CollectionShape) -> NormalizeError {
  NormalizeError::MissingId {
    collection: shape.name().to_string(),
    id_field: shape.id_field().to_string(),
  }
}

fn type_name(value: &Value) -> &'static str {
  match value {
    Value::Null => "null",
    Value::Bool(_) => "bool",
    Value::Number(_) => "number",
    Value::String(_) => "string",
    Value::Array(_) => "array",
    Value::Object(_) => "object",
  }
}

/// Rebuild the full object graph behind a reference-only result.
///
/// Ids that no longer resolve become `null` (single references) or are
/// skipped (sequences). Never mutates the store.
pub fn denormalize(
  schema: &Schema,
  entities: &EntityStore,
  collection: &str,
  result: &QueryResult,
) -> Value {
  let mut path = Vec::new();
  match result {
    QueryResult::Empty => Value::Null,
    QueryResult::Raw(value) => value.clone(),
    QueryResult::One(id) => resolve(schema, entities, collection, id, &mut path).unwrap_or(Value::Null),
    QueryResult::Many(ids) => Value::Array(resolve_all(schema, entities, collection, ids, &mut path)),
    QueryResult::Page(page) => {
      let mut envelope = Map::new();
      envelope.insert("pagination".to_string(), page.pagination.raw().clone());
      envelope.insert(
        "data".to_string(),
        Value::Array(resolve_all(schema, entities, collection, &page.ids, &mut path)),
      );
      Value::Object(envelope)
    }
  }
}

fn resolve_all(
  schema: &Schema,
  entities: &EntityStore,
  collection: &str,
  ids: &[Value],
  path: &mut Vec<(String, EntityId)>,
) -> Vec<Value> {
  ids
    .iter()
    .filter_map(|id| resolve(schema, entities, collection, id, path))
    .collect()
}

/// Resolve one reference. `path` holds the entities being expanded above
/// this one; a reference back into it is left as the bare id.
fn resolve(
  schema: &Schema,
  entities: &EntityStore,
  collection: &str,
  id_value: &Value,
  path: &mut Vec<(String, EntityId)>,
) -> Option<Value> {
  let id = EntityId::from_value(id_value)?;
  let record = entities.get(collection, &id)?;
  let node = (collection.to_string(), id);
  if path.contains(&node) {
    return Some(id_value.clone());
  }

  let Some(shape) = schema.get(collection) else {
    return Some(Value::Object(record.clone()));
  };

  path.push(node);
  let mut out = Map::with_capacity(record.len());
  for (field, value) in record {
    let expanded = match shape.relation(field) {
      Some(rel) => match value {
        Value::Array(ids) if rel.many => {
          Value::Array(resolve_all(schema, entities, &rel.target, ids, path))
        }
        Value::Null => Value::Null,
        other => resolve(schema, entities, &rel.target, other, path).unwrap_or(Value::Null),
      },
      None => value.clone(),
    };
    out.insert(field.clone(), expanded);
  }
  path.pop();

  Some(Value::Object(out))
}
