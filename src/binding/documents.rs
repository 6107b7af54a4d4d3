//! Evaluation of query descriptors over a plain list of JSON documents.
//!
//! Shared by the bindings that keep documents locally. Documents are
//! identified by their `id` field.

use serde_json::{json, Map, Value};

use crate::cache::EntityId;
use crate::descriptor::{Operation, QueryDescriptor};
use crate::error::TransportError;

const ID_FIELD: &str = "id";

/// Response of one evaluation and whether the document list was modified.
#[derive(Debug)]
pub(super) struct Outcome {
  pub response: Value,
  pub changed: bool,
}

impl Outcome {
  fn read(response: Value) -> Self {
    Self {
      response,
      changed: false,
    }
  }

  fn write(response: Value) -> Self {
    Self {
      response,
      changed: true,
    }
  }
}

pub(super) fn evaluate(
  docs: &mut Vec<Value>,
  query: &QueryDescriptor,
) -> Result<Outcome, TransportError> {
  let payload = query.payload();
  let filter = payload.get("where").unwrap_or(&Value::Null);

  match query.operation() {
    Operation::FindOne => Ok(Outcome::read(
      docs
        .iter()
        .find(|doc| matches(doc, filter))
        .cloned()
        .unwrap_or(Value::Null),
    )),
    Operation::FindMany => {
      let found: Vec<&Value> = docs.iter().filter(|doc| matches(doc, filter)).collect();
      if payload.get("take").is_some() || payload.get("cursor").is_some() {
        Ok(Outcome::read(paginate(&found, query)))
      } else {
        Ok(Outcome::read(Value::Array(
          found.into_iter().cloned().collect(),
        )))
      }
    }
    Operation::Count => Ok(Outcome::read(json!(docs
      .iter()
      .filter(|doc| matches(doc, filter))
      .count()))),
    Operation::Create => {
      let mut data = mutation_data(query)?.clone();
      match data.get(ID_FIELD).and_then(EntityId::from_value) {
        Some(id) if docs.iter().any(|doc| doc_id(doc).as_ref() == Some(&id)) => {
          return Err(TransportError::Backend(format!(
            "{} {} already exists",
            query.collection(),
            id
          )));
        }
        Some(_) => {}
        None => {
          data.insert(ID_FIELD.to_string(), json!(next_id(docs)));
        }
      }
      let doc = Value::Object(data);
      docs.push(doc.clone());
      Ok(Outcome::write(doc))
    }
    Operation::Update => {
      let data = mutation_data(query)?;
      let doc = docs
        .iter_mut()
        .find(|doc| matches(doc, filter))
        .ok_or_else(|| not_found(query, filter))?;
      merge(doc, data);
      Ok(Outcome::write(doc.clone()))
    }
    Operation::UpdateMany => {
      let data = mutation_data(query)?;
      let mut count = 0;
      for doc in docs.iter_mut().filter(|doc| matches(doc, filter)) {
        merge(doc, data);
        count += 1;
      }
      Ok(Outcome {
        response: json!({ "count": count }),
        changed: count > 0,
      })
    }
    Operation::Delete => {
      let index = docs
        .iter()
        .position(|doc| matches(doc, filter))
        .ok_or_else(|| not_found(query, filter))?;
      Ok(Outcome::write(docs.remove(index)))
    }
    Operation::DeleteMany => {
      let before = docs.len();
      docs.retain(|doc| !matches(doc, filter));
      let count = before - docs.len();
      Ok(Outcome {
        response: json!({ "count": count }),
        changed: count > 0,
      })
    }
    Operation::Action(name) => Err(TransportError::Unsupported(format!("action:{}", name))),
  }
}

/// Cursor pagination: start after the document whose id is `cursor.id`,
/// return up to `take` documents.
fn paginate(found: &[&Value], query: &QueryDescriptor) -> Value {
  let payload = query.payload();
  let start = if query.cursor_is_start() {
    0
  } else {
    let cursor = payload.get("cursor").unwrap_or(&Value::Null);
    let cursor_id = EntityId::from_value(cursor.get(ID_FIELD).unwrap_or(cursor));
    found
      .iter()
      .position(|doc| doc_id(doc).is_some() && doc_id(doc) == cursor_id)
      .map_or(found.len(), |i| i + 1)
  };
  let take = payload
    .get("take")
    .and_then(Value::as_u64)
    .map_or(found.len(), |t| t as usize);
  let end = start.saturating_add(take).min(found.len());

  let page: Vec<Value> = found[start..end].iter().map(|doc| (*doc).clone()).collect();
  let cursor = match page.last().and_then(|doc| doc.get(ID_FIELD)) {
    Some(id) => json!({ "id": id }),
    None => payload.get("cursor").cloned().unwrap_or(Value::Null),
  };

  json!({
    "pagination": { "cursor": cursor, "isLast": end >= found.len() },
    "data": page,
  })
}

fn doc_id(doc: &Value) -> Option<EntityId> {
  doc.get(ID_FIELD).and_then(EntityId::from_value)
}

fn next_id(docs: &[Value]) -> u64 {
  docs
    .iter()
    .filter_map(|doc| doc.get(ID_FIELD).and_then(Value::as_u64))
    .max()
    .map_or(1, |max| max + 1)
}

fn mutation_data(query: &QueryDescriptor) -> Result<&Map<String, Value>, TransportError> {
  query.data().ok_or_else(|| {
    TransportError::InvalidPayload(format!("{} requires a 'data' object", query.operation()))
  })
}

fn merge(doc: &mut Value, data: &Map<String, Value>) {
  if let Value::Object(fields) = doc {
    for (field, value) in data {
      fields.insert(field.clone(), value.clone());
    }
  }
}

fn not_found(query: &QueryDescriptor, filter: &Value) -> TransportError {
  let id = filter
    .get(ID_FIELD)
    .and_then(EntityId::from_value)
    .map_or_else(|| filter.to_string(), |id| id.to_string());
  TransportError::NotFound {
    collection: query.collection().to_string(),
    id,
  }
}

/// Recursive equality filter. An object filter on a field holding a bare
/// reference compares its `id` against the reference.
fn matches(doc: &Value, filter: &Value) -> bool {
  match (doc, filter) {
    (_, Value::Null) => true,
    (Value::Object(fields), Value::Object(conditions)) => conditions.iter().all(|(field, cond)| {
      match fields.get(field) {
        Some(value) => matches(value, cond),
        None => cond.is_null(),
      }
    }),
    (reference, Value::Object(conditions)) if conditions.len() == 1 => conditions
      .get(ID_FIELD)
      .is_some_and(|id| scalar_eq(reference, id)),
    (value, cond) => scalar_eq(value, cond),
  }
}

fn scalar_eq(a: &Value, b: &Value) -> bool {
  match (EntityId::from_value(a), EntityId::from_value(b)) {
    (Some(x), Some(y)) => x == y,
    _ => a == b,
  }
}
