//! SQLite implementation of the structured store, response cache and sync log.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use super::traits::{CachedEntry, Key, ResponseStore, Row, Store, StoreAdapter};
use crate::http::codec::SerializedRequest;
use crate::http::endpoint::EndpointKey;
use crate::http::Method;
use crate::query::filter::Filter;
use crate::sync::{SyncQueue, SyncQueueEntry, UndoRedoRecord};

/// SQLite-backed storage shared by every store handle it opens.
#[derive(Clone)]
pub struct SqliteStorage {
  conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
  /// Open (or create) the database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create store directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open store database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// A private, non-persistent database.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    Self::from_connection(conn)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("offline-proxy").join("store.db"))
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Arc::new(Mutex::new(conn)),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  fn run_migrations(&self) -> Result<()> {
    lock(&self.conn)?
      .execute_batch(SCHEMA)
      .map_err(|e| eyre!("Failed to run store migrations: {}", e))
  }
}

const SCHEMA: &str = r#"
-- Shredded rows, one logical store per REST resource type
CREATE TABLE IF NOT EXISTS store_rows (
    store_name TEXT NOT NULL,
    row_key TEXT NOT NULL,
    key_json TEXT NOT NULL,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (store_name, row_key)
);

-- Raw request/response pairs keyed by fingerprint
CREATE TABLE IF NOT EXISTS response_cache (
    fingerprint TEXT PRIMARY KEY,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    url_base TEXT NOT NULL,
    request TEXT NOT NULL,
    response TEXT NOT NULL,
    shredded TEXT,
    cached_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_response_cache_base
    ON response_cache(method, url_base);

-- Pending mutations awaiting replay, FIFO by id
CREATE TABLE IF NOT EXISTS sync_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    endpoint_key TEXT NOT NULL,
    request TEXT NOT NULL,
    undo_redo TEXT,
    enqueued_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sync_queue_endpoint ON sync_queue(endpoint_key);
"#;

fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>> {
  conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
}

/// Handle to one named store.
struct SqliteStore {
  conn: Arc<Mutex<Connection>>,
  name: String,
}

impl StoreAdapter for SqliteStorage {
  fn open_store(&self, name: &str) -> Result<Box<dyn Store>> {
    Ok(Box::new(SqliteStore {
      conn: Arc::clone(&self.conn),
      name: name.to_string(),
    }))
  }
}

impl Store for SqliteStore {
  fn name(&self) -> &str {
    &self.name
  }

  fn find_by_key(&self, key: &Key) -> Result<Option<Value>> {
    let conn = lock(&self.conn)?;
    let data: Option<String> = conn
      .query_row(
        "SELECT value FROM store_rows WHERE store_name = ? AND row_key = ?",
        params![self.name, key.storage_text()],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up row in {}: {}", self.name, e))?;

    data
      .map(|d| serde_json::from_str(&d).map_err(|e| eyre!("Failed to deserialize row: {}", e)))
      .transpose()
  }

  fn find(&self, filter: &Filter) -> Result<Vec<Row>> {
    let conn = lock(&self.conn)?;
    let mut stmt = conn
      .prepare("SELECT key_json, value FROM store_rows WHERE store_name = ? ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let raw: Vec<(String, String)> = stmt
      .query_map(params![self.name], |row| Ok((row.get(0)?, row.get(1)?)))
      .map_err(|e| eyre!("Failed to query {}: {}", self.name, e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read rows from {}: {}", self.name, e))?;

    let mut rows = Vec::new();
    for (key_json, value) in raw {
      let value: Value =
        serde_json::from_str(&value).map_err(|e| eyre!("Failed to deserialize row: {}", e))?;
      if filter.matches(&value) {
        let key =
          serde_json::from_str(&key_json).map_err(|e| eyre!("Failed to deserialize key: {}", e))?;
        rows.push(Row { key, value });
      }
    }
    Ok(rows)
  }

  fn upsert_all(&self, rows: &[Row]) -> Result<()> {
    let conn = lock(&self.conn)?;
    for row in rows {
      let key_json =
        serde_json::to_string(&row.key).map_err(|e| eyre!("Failed to serialize key: {}", e))?;
      // ON CONFLICT keeps the rowid, so replaced rows keep their position
      conn
        .execute(
          "INSERT INTO store_rows (store_name, row_key, key_json, value, updated_at)
           VALUES (?, ?, ?, ?, datetime('now'))
           ON CONFLICT(store_name, row_key) DO UPDATE SET
             key_json = excluded.key_json,
             value = excluded.value,
             updated_at = excluded.updated_at",
          params![self.name, row.key.storage_text(), key_json, row.value.to_string()],
        )
        .map_err(|e| eyre!("Failed to upsert row into {}: {}", self.name, e))?;
    }
    Ok(())
  }

  fn remove_by_key(&self, key: &Key) -> Result<()> {
    lock(&self.conn)?
      .execute(
        "DELETE FROM store_rows WHERE store_name = ? AND row_key = ?",
        params![self.name, key.storage_text()],
      )
      .map_err(|e| eyre!("Failed to remove row from {}: {}", self.name, e))?;
    Ok(())
  }
}

type EntryColumns = (String, String, Option<String>, String);

impl SqliteStorage {
  fn decode_entry(columns: EntryColumns) -> Result<CachedEntry> {
    let (request, response, shredded, cached_at) = columns;
    Ok(CachedEntry {
      request: serde_json::from_str(&request)
        .map_err(|e| eyre!("Failed to deserialize cached request: {}", e))?,
      response: serde_json::from_str(&response)
        .map_err(|e| eyre!("Failed to deserialize cached response: {}", e))?,
      shredded: shredded
        .map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(|e| eyre!("Failed to deserialize shredded index: {}", e))?,
      cached_at: parse_datetime(&cached_at)?,
    })
  }
}

impl ResponseStore for SqliteStorage {
  fn get_entry(&self, fingerprint: &str) -> Result<Option<CachedEntry>> {
    let columns: Option<EntryColumns> = lock(&self.conn)?
      .query_row(
        "SELECT request, response, shredded, cached_at FROM response_cache
         WHERE fingerprint = ?",
        params![fingerprint],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query response cache: {}", e))?;

    columns.map(Self::decode_entry).transpose()
  }

  fn find_entry_by_base(&self, method: Method, url_base: &str) -> Result<Option<CachedEntry>> {
    let columns: Option<EntryColumns> = lock(&self.conn)?
      .query_row(
        "SELECT request, response, shredded, cached_at FROM response_cache
         WHERE method = ? AND url_base = ?
         ORDER BY rowid DESC LIMIT 1",
        params![method.as_str(), url_base],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query response cache: {}", e))?;

    columns.map(Self::decode_entry).transpose()
  }

  fn put_entry(&self, fingerprint: &str, url_base: &str, entry: &CachedEntry) -> Result<()> {
    let request = serde_json::to_string(&entry.request)
      .map_err(|e| eyre!("Failed to serialize request: {}", e))?;
    let response = serde_json::to_string(&entry.response)
      .map_err(|e| eyre!("Failed to serialize response: {}", e))?;
    let shredded = entry
      .shredded
      .as_ref()
      .map(serde_json::to_string)
      .transpose()
      .map_err(|e| eyre!("Failed to serialize shredded index: {}", e))?;

    lock(&self.conn)?
      .execute(
        "INSERT OR REPLACE INTO response_cache
           (fingerprint, method, url, url_base, request, response, shredded, cached_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        params![
          fingerprint,
          entry.request.method.as_str(),
          entry.request.url,
          url_base,
          request,
          response,
          shredded,
          entry.cached_at.to_rfc3339(),
        ],
      )
      .map_err(|e| eyre!("Failed to store cached response: {}", e))?;
    Ok(())
  }

  fn delete_entry(&self, fingerprint: &str) -> Result<bool> {
    let removed = lock(&self.conn)?
      .execute(
        "DELETE FROM response_cache WHERE fingerprint = ?",
        params![fingerprint],
      )
      .map_err(|e| eyre!("Failed to delete cached response: {}", e))?;
    Ok(removed > 0)
  }
}

impl SqliteStorage {
  fn query_sync_entries(&self, endpoint: Option<&str>) -> Result<Vec<SyncQueueEntry>> {
    let conn = lock(&self.conn)?;
    let mut stmt = conn
      .prepare(
        "SELECT id, endpoint_key, request, undo_redo, enqueued_at FROM sync_queue
         WHERE ?1 IS NULL OR endpoint_key = ?1
         ORDER BY id",
      )
      .map_err(|e| eyre!("Failed to prepare sync queue query: {}", e))?;

    let raw: Vec<(i64, String, String, Option<String>, String)> = stmt
      .query_map(params![endpoint], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
      })
      .map_err(|e| eyre!("Failed to query sync queue: {}", e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read sync queue: {}", e))?;

    raw
      .into_iter()
      .map(|(id, endpoint_key, request, undo_redo, enqueued_at)| {
        Ok(SyncQueueEntry {
          id,
          endpoint_key,
          request: serde_json::from_str(&request)
            .map_err(|e| eyre!("Failed to deserialize queued request: {}", e))?,
          undo_redo_data_array: undo_redo
            .map(|u| serde_json::from_str(&u))
            .transpose()
            .map_err(|e| eyre!("Failed to deserialize undo/redo data: {}", e))?,
          enqueued_at: parse_datetime(&enqueued_at)?,
        })
      })
      .collect()
  }
}

impl SyncQueue for SqliteStorage {
  fn insert_request(
    &self,
    request: &SerializedRequest,
    undo_redo: Option<&[UndoRedoRecord]>,
  ) -> Result<()> {
    let endpoint_key = EndpointKey::new(request.method, &request.url);
    let request_json =
      serde_json::to_string(request).map_err(|e| eyre!("Failed to serialize request: {}", e))?;
    let undo_redo_json = undo_redo
      .map(serde_json::to_string)
      .transpose()
      .map_err(|e| eyre!("Failed to serialize undo/redo data: {}", e))?;

    lock(&self.conn)?
      .execute(
        "INSERT INTO sync_queue (endpoint_key, request, undo_redo, enqueued_at)
         VALUES (?, ?, ?, ?)",
        params![
          endpoint_key.as_str(),
          request_json,
          undo_redo_json,
          Utc::now().to_rfc3339()
        ],
      )
      .map_err(|e| eyre!("Failed to enqueue request: {}", e))?;
    Ok(())
  }

  fn pending(&self) -> Result<Vec<SyncQueueEntry>> {
    self.query_sync_entries(None)
  }

  fn pending_for(&self, endpoint_key: &EndpointKey) -> Result<Vec<SyncQueueEntry>> {
    self.query_sync_entries(Some(endpoint_key.as_str()))
  }

  fn remove(&self, id: i64) -> Result<()> {
    lock(&self.conn)?
      .execute("DELETE FROM sync_queue WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to remove sync queue entry {}: {}", id, e))?;
    Ok(())
  }
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
