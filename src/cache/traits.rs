//! Core traits and types for local persistence.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::http::codec::{SerializedRequest, SerializedResponse};
use crate::http::Method;
use crate::query::filter::Filter;
use crate::shred::ResourceType;

/// Row key: one id field, or an ordered list of field values for compound ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Key {
  Composite(Vec<Value>),
  Scalar(Value),
}

impl Key {
  /// Canonical text used to address the row in storage.
  ///
  /// String ids are used verbatim so that the id taken from a URL (`"5"`)
  /// and a numeric id in a payload (`5`) land on the same row. Composite
  /// keys apply the same rule per part.
  pub fn storage_text(&self) -> String {
    match self {
      Key::Scalar(value) => scalar_text(value),
      Key::Composite(parts) => {
        Value::Array(parts.iter().map(|p| Value::String(scalar_text(p))).collect()).to_string()
      }
    }
  }

  /// True when the payload had no value for the id field(s).
  pub fn is_missing(&self) -> bool {
    match self {
      Key::Scalar(value) => value.is_null(),
      Key::Composite(parts) => parts.is_empty() || parts.iter().all(Value::is_null),
    }
  }
}

fn scalar_text(value: &Value) -> String {
  match value {
    Value::String(s) => s.clone(),
    other => other.to_string(),
  }
}

impl From<&str> for Key {
  fn from(s: &str) -> Self {
    Key::Scalar(Value::String(s.to_string()))
  }
}

/// A stored row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
  pub key: Key,
  pub value: Value,
}

/// A named collection of rows, one per REST resource type.
pub trait Store: Send + Sync {
  fn name(&self) -> &str;

  fn find_by_key(&self, key: &Key) -> Result<Option<Value>>;

  /// Rows matching `filter`, in insertion order.
  fn find(&self, filter: &Filter) -> Result<Vec<Row>>;

  /// Insert or replace rows; each row is atomic, the batch is not.
  fn upsert_all(&self, rows: &[Row]) -> Result<()>;

  fn remove_by_key(&self, key: &Key) -> Result<()>;
}

/// Opens named stores.
pub trait StoreAdapter: Send + Sync {
  fn open_store(&self, name: &str) -> Result<Box<dyn Store>>;
}

/// Which rows of which store a cached response was shredded into.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShreddedIndex {
  pub name: String,
  pub resource_identifier: Option<String>,
  pub keys: Vec<Key>,
  pub resource_type: ResourceType,
}

/// A cached request/response pair.
#[derive(Debug, Clone)]
pub struct CachedEntry {
  pub request: SerializedRequest,
  pub response: SerializedResponse,
  pub shredded: Option<Vec<ShreddedIndex>>,
  /// When the entry was written
  pub cached_at: DateTime<Utc>,
}

/// Raw response cache keyed by request fingerprint.
pub trait ResponseStore: Send + Sync {
  fn get_entry(&self, fingerprint: &str) -> Result<Option<CachedEntry>>;

  /// Most recent entry for `method` whose URL, minus its query, is `url_base`.
  fn find_entry_by_base(&self, method: Method, url_base: &str) -> Result<Option<CachedEntry>>;

  fn put_entry(&self, fingerprint: &str, url_base: &str, entry: &CachedEntry) -> Result<()>;

  /// Returns whether an entry was removed.
  fn delete_entry(&self, fingerprint: &str) -> Result<bool>;
}
