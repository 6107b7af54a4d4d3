//! Collection shape registry.
//!
//! Every collection the store knows about is declared here up front: its id
//! field and which fields are relations into other collections. The
//! normalizer consumes the registry as plain data.

use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::error::SchemaError;

const DEFAULT_ID_FIELD: &str = "id";

/// A relation from one collection's field into another collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
  pub target: String,
  /// Plural relation (array of references)
  pub many: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKind {
  Scalar,
  Relation(Relation),
}

/// Declared shape of one collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionShape {
  name: String,
  id_field: String,
  fields: BTreeMap<String, FieldKind>,
}

impl CollectionShape {
  fn new(name: &str) -> Self {
    Self {
      name: name.to_string(),
      id_field: DEFAULT_ID_FIELD.to_string(),
      fields: BTreeMap::new(),
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn id_field(&self) -> &str {
    &self.id_field
  }

  /// Field kind, if declared. Undeclared fields are treated as scalars.
  pub fn field(&self, name: &str) -> Option<&FieldKind> {
    self.fields.get(name)
  }

  pub fn relation(&self, field: &str) -> Option<&Relation> {
    match self.fields.get(field) {
      Some(FieldKind::Relation(rel)) => Some(rel),
      _ => None,
    }
  }

  /// All relation fields of this collection.
  pub fn relations(&self) -> impl Iterator<Item = (&str, &Relation)> {
    self.fields.iter().filter_map(|(name, kind)| match kind {
      FieldKind::Relation(rel) => Some((name.as_str(), rel)),
      FieldKind::Scalar => None,
    })
  }

  /// The id value of a raw entity object.
  pub fn id_of<'a>(&self, entity: &'a Map<String, Value>) -> Option<&'a Value> {
    entity.get(&self.id_field).filter(|v| !v.is_null())
  }
}

/// Registry of collection shapes for one store.
#[derive(Debug, Clone, Default)]
pub struct Schema {
  collections: BTreeMap<String, CollectionShape>,
}

impl Schema {
  pub fn builder() -> SchemaBuilder {
    SchemaBuilder::default()
  }

  /// Build a schema from configuration declarations.
  pub fn from_decls(decls: &BTreeMap<String, CollectionDecl>) -> Result<Self, SchemaError> {
    let mut builder = Self::builder();
    for (name, decl) in decls {
      let mut shape = CollectionShape::new(name);
      if let Some(id) = &decl.id {
        shape.id_field = id.clone();
      }
      for (field, field_decl) in &decl.fields {
        let kind = match field_decl {
          FieldDecl::Kind(kind) if kind.eq_ignore_ascii_case("scalar") => FieldKind::Scalar,
          FieldDecl::Kind(kind) => {
            return Err(SchemaError::UnknownFieldKind {
              collection: name.clone(),
              field: field.clone(),
              kind: kind.clone(),
            })
          }
          FieldDecl::Relation { relation, many } => FieldKind::Relation(Relation {
            target: relation.clone(),
            many: *many,
          }),
        };
        shape.fields.insert(field.clone(), kind);
      }
      builder.collections.insert(name.clone(), shape);
    }
    builder.build()
  }

  pub fn get(&self, collection: &str) -> Option<&CollectionShape> {
    self.collections.get(collection)
  }

  pub fn contains(&self, collection: &str) -> bool {
    self.collections.contains_key(collection)
  }

  pub fn collections(&self) -> impl Iterator<Item = &CollectionShape> {
    self.collections.values()
  }

  /// Every `(collection, field, relation)` whose relation targets `target`.
  pub fn relations_to<'a>(
    &'a self,
    target: &'a str,
  ) -> impl Iterator<Item = (&'a str, &'a str, &'a Relation)> + 'a {
    self.collections.values().flat_map(move |shape| {
      shape
        .relations()
        .filter(move |(_, rel)| rel.target == target)
        .map(move |(field, rel)| (shape.name(), field, rel))
    })
  }
}

#[derive(Debug, Default)]
pub struct SchemaBuilder {
  collections: BTreeMap<String, CollectionShape>,
}

impl SchemaBuilder {
  /// Register a collection. Registering the same name twice replaces it.
  pub fn collection<F>(mut self, name: &str, declare: F) -> Self
  where
    F: FnOnce(CollectionBuilder) -> CollectionBuilder,
  {
    let shape = declare(CollectionBuilder {
      shape: CollectionShape::new(name),
    })
    .shape;
    self.collections.insert(name.to_string(), shape);
    self
  }

  /// Validate and freeze the registry.
  pub fn build(self) -> Result<Schema, SchemaError> {
    for shape in self.collections.values() {
      if shape.id_field.is_empty() {
        return Err(SchemaError::EmptyIdField(shape.name.clone()));
      }
      for (field, rel) in shape.relations() {
        if !self.collections.contains_key(&rel.target) {
          return Err(SchemaError::UnknownTarget {
            collection: shape.name.clone(),
            field: field.to_string(),
            target: rel.target.clone(),
          });
        }
      }
    }
    Ok(Schema {
      collections: self.collections,
    })
  }
}

pub struct CollectionBuilder {
  shape: CollectionShape,
}

impl CollectionBuilder {
  pub fn id_field(mut self, field: &str) -> Self {
    self.shape.id_field = field.to_string();
    self
  }

  pub fn scalar(mut self, field: &str) -> Self {
    self.shape.fields.insert(field.to_string(), FieldKind::Scalar);
    self
  }

  pub fn relation(self, field: &str, target: &str) -> Self {
    self.with_relation(field, target, false)
  }

  pub fn relation_many(self, field: &str, target: &str) -> Self {
    self.with_relation(field, target, true)
  }

  fn with_relation(mut self, field: &str, target: &str, many: bool) -> Self {
    self.shape.fields.insert(
      field.to_string(),
      FieldKind::Relation(Relation {
        target: target.to_string(),
        many,
      }),
    );
    self
  }
}

/// Collection declaration as written in the configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CollectionDecl {
  /// Id field name (defaults to `id`)
  pub id: Option<String>,
  #[serde(default)]
  pub fields: BTreeMap<String, FieldDecl>,
}

/// `scalar` or `{ relation: Target, many: bool }`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum FieldDecl {
  Kind(String),
  Relation {
    relation: String,
    #[serde(default)]
    many: bool,
  },
}
