//! Durable local binding backed by SQLite.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::documents::evaluate;
use super::{Binding, CollectionInfo};
use crate::descriptor::QueryDescriptor;
use crate::error::TransportError;

/// Schema for the document table.
const DOCUMENT_SCHEMA: &str = r#"
-- One row per document, ordered by insertion within a collection
CREATE TABLE IF NOT EXISTS documents (
    collection TEXT NOT NULL,
    position INTEGER NOT NULL,
    doc_id TEXT,
    data BLOB NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (collection, position)
);

CREATE INDEX IF NOT EXISTS idx_documents_doc_id
    ON documents(collection, doc_id);
"#;

/// Local storage binding: documents persist across runs in a SQLite file.
pub struct SqliteBinding {
  conn: Mutex<Connection>,
}

impl SqliteBinding {
  /// Open (or create) the database at `path`, or at the default location.
  pub fn open(path: Option<&Path>) -> Result<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create binding directory: {}", e))?;
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open binding database at {}: {}", path.display(), e))?;
    Self::with_connection(conn)
  }

  /// Database that lives only as long as the binding.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory binding database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(DOCUMENT_SCHEMA)
      .map_err(|e| eyre!("Failed to run binding migrations: {}", e))?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  /// Get the default database path.
  fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("usedb").join("bindings.db"))
  }

  fn lock(&self) -> MutexGuard<'_, Connection> {
    self.conn.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

fn storage_error(e: rusqlite::Error) -> TransportError {
  TransportError::Storage(e.to_string())
}

fn load(conn: &Connection, collection: &str) -> Result<Vec<Value>, TransportError> {
  let mut stmt = conn
    .prepare("SELECT data FROM documents WHERE collection = ? ORDER BY position")
    .map_err(storage_error)?;

  let rows = stmt
    .query_map(params![collection], |row| row.get::<_, Vec<u8>>(0))
    .map_err(storage_error)?;

  let mut docs = Vec::new();
  for row in rows {
    let data = row.map_err(storage_error)?;
    let doc = serde_json::from_slice(&data)
      .map_err(|e| TransportError::Storage(format!("corrupt document in {}: {}", collection, e)))?;
    docs.push(doc);
  }
  Ok(docs)
}

/// Replace a collection's rows with `docs` in one transaction.
fn save(conn: &mut Connection, collection: &str, docs: &[Value]) -> Result<(), TransportError> {
  let tx = conn.transaction().map_err(storage_error)?;

  tx.execute(
    "DELETE FROM documents WHERE collection = ?",
    params![collection],
  )
  .map_err(storage_error)?;

  for (position, doc) in docs.iter().enumerate() {
    let data = serde_json::to_vec(doc)
      .map_err(|e| TransportError::Storage(format!("failed to serialize document: {}", e)))?;
    let doc_id = doc.get("id").map(|id| match id {
      Value::String(s) => s.clone(),
      other => other.to_string(),
    });
    tx.execute(
      "INSERT INTO documents (collection, position, doc_id, data, updated_at)
       VALUES (?, ?, ?, ?, datetime('now'))",
      params![collection, position as i64, doc_id, data],
    )
    .map_err(storage_error)?;
  }

  tx.commit().map_err(storage_error)
}

#[async_trait]
impl Binding for SqliteBinding {
  async fn perform(&self, query: &QueryDescriptor) -> Result<Value, TransportError> {
    let mut conn = self.lock();
    let mut docs = load(&conn, query.collection())?;
    let outcome = evaluate(&mut docs, query)?;
    if outcome.changed {
      save(&mut conn, query.collection(), &docs)?;
    }
    Ok(outcome.response)
  }

  async fn get_all_collections(&self) -> Result<Vec<CollectionInfo>, TransportError> {
    let conn = self.lock();
    let mut stmt = conn
      .prepare(
        "SELECT collection, COUNT(*) FROM documents
         GROUP BY collection ORDER BY collection",
      )
      .map_err(storage_error)?;

    let rows = stmt
      .query_map([], |row| {
        Ok(CollectionInfo {
          name: row.get(0)?,
          count: row.get::<_, i64>(1)? as u64,
        })
      })
      .map_err(storage_error)?;

    rows
      .collect::<Result<Vec<_>, _>>()
      .map_err(storage_error)
  }
}
