//! Shredding: splitting response payloads into store rows, and back.

pub mod binary;
pub mod oracle_rest;
pub mod simple;

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::cache::traits::{Key, Row, ShreddedIndex};
use crate::http::{Response, CACHE_EXPIRATION_HEADER};

/// Whether a payload held one resource or a list of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
  Single,
  Collection,
}

impl ResourceType {
  pub fn as_str(&self) -> &'static str {
    match self {
      ResourceType::Single => "single",
      ResourceType::Collection => "collection",
    }
  }

  pub fn parse(value: &str) -> Option<Self> {
    match value {
      "single" => Some(ResourceType::Single),
      "collection" => Some(ResourceType::Collection),
      _ => None,
    }
  }
}

impl fmt::Display for ResourceType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Rows extracted from one payload. `keys[i]` is the key of `data[i]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShreddedRecordSet {
  pub name: String,
  pub resource_identifier: Option<String>,
  pub keys: Vec<Key>,
  pub data: Vec<Value>,
  pub resource_type: ResourceType,
}

impl ShreddedRecordSet {
  /// A record set with no rows, produced for empty or malformed payloads.
  pub fn empty(name: &str, resource_identifier: Option<String>) -> Self {
    Self {
      name: name.to_string(),
      resource_identifier,
      keys: Vec::new(),
      data: Vec::new(),
      resource_type: ResourceType::Collection,
    }
  }

  /// Rows with a usable key; rows whose id fields are absent are skipped.
  pub fn rows(&self) -> Vec<Row> {
    self
      .keys
      .iter()
      .zip(&self.data)
      .filter(|(key, _)| !key.is_missing())
      .map(|(key, value)| Row {
        key: key.clone(),
        value: value.clone(),
      })
      .collect()
  }

  /// What the response cache remembers about this set.
  pub fn index(&self) -> ShreddedIndex {
    ShreddedIndex {
      name: self.name.clone(),
      resource_identifier: self.resource_identifier.clone(),
      keys: self.keys.clone(),
      resource_type: self.resource_type,
    }
  }
}

/// Id field(s) of a resource. A list makes a composite key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IdAttribute {
  Single(String),
  Composite(Vec<String>),
}

impl IdAttribute {
  pub fn extract(&self, item: &Value) -> Key {
    match self {
      IdAttribute::Single(field) => Key::Scalar(item.get(field).cloned().unwrap_or(Value::Null)),
      IdAttribute::Composite(fields) => Key::Composite(
        fields
          .iter()
          .map(|field| item.get(field).cloned().unwrap_or(Value::Null))
          .collect(),
      ),
    }
  }
}

impl IdAttribute {
  /// Key named by the last URL segment. Composite ids are written
  /// comma-separated (`/orders/eu,42`); a segment with the wrong number of
  /// parts is taken as a scalar id.
  pub fn key_for_url_id(&self, id: &str) -> Key {
    match self {
      IdAttribute::Composite(fields) => {
        let parts: Vec<&str> = id.split(',').collect();
        if parts.len() == fields.len() {
          Key::Composite(parts.into_iter().map(|p| Value::String(p.to_string())).collect())
        } else {
          Key::from(id)
        }
      }
      IdAttribute::Single(_) => Key::from(id),
    }
  }
}

impl From<&str> for IdAttribute {
  fn from(field: &str) -> Self {
    IdAttribute::Single(field.to_string())
  }
}

/// Splits a response body into record sets. Never fails: a payload that
/// cannot be parsed yields a set without rows.
pub trait Shredder: Send + Sync {
  fn store_name(&self) -> &str;

  fn shred(&self, response: &Response) -> Vec<ShreddedRecordSet>;

  /// Key of the row a URL id (last path segment) refers to.
  fn url_key(&self, id: &str) -> Key {
    Key::from(id)
  }
}

/// Rebuilds a response body from exactly one record set.
pub trait Unshredder: Send + Sync {
  fn unshred(&self, data: &[ShreddedRecordSet], response: Response) -> Result<Response>;
}

/// A shredder/unshredder pair for one resource.
#[derive(Clone)]
pub struct JsonProcessor {
  pub shredder: Arc<dyn Shredder>,
  pub unshredder: Arc<dyn Unshredder>,
}

impl JsonProcessor {
  pub fn new(shredder: Arc<dyn Shredder>, unshredder: Arc<dyn Unshredder>) -> Self {
    Self {
      shredder,
      unshredder,
    }
  }

  pub fn simple(store_name: &str, id_attribute: IdAttribute) -> Self {
    Self::new(
      Arc::new(simple::SimpleShredder::new(store_name, id_attribute)),
      Arc::new(simple::SimpleUnshredder),
    )
  }

  pub fn oracle_rest(store_name: &str, id_attribute: IdAttribute) -> Self {
    Self::new(
      Arc::new(oracle_rest::OracleRestShredder::new(store_name, id_attribute)),
      Arc::new(oracle_rest::OracleRestUnshredder),
    )
  }

  pub fn binary(store_name: &str) -> Self {
    Self::new(
      Arc::new(binary::BinaryShredder::new(store_name)),
      Arc::new(binary::BinaryUnshredder),
    )
  }

  pub fn store_name(&self) -> &str {
    self.shredder.store_name()
  }

  pub fn url_key(&self, id: &str) -> Key {
    self.shredder.url_key(id)
  }
}

impl fmt::Debug for JsonProcessor {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("JsonProcessor")
      .field("store", &self.store_name())
      .finish()
  }
}

/// The only record set an unshredder accepts.
pub(crate) fn expect_single_set(data: &[ShreddedRecordSet]) -> Result<&ShreddedRecordSet> {
  match data {
    [set] => Ok(set),
    _ => Err(eyre!(
      "shredded data is not in the correct format: expected 1 record set, got {}",
      data.len()
    )),
  }
}

/// Shared shape of the JSON unshredders: a `single` set with one row renders
/// as that row; anything else goes through `wrap_collection`.
pub(crate) fn render_json(
  data: &[ShreddedRecordSet],
  mut response: Response,
  wrap_collection: impl FnOnce(Vec<Value>) -> Value,
) -> Result<Response> {
  let set = expect_single_set(data)?;
  let payload = match (set.resource_type, set.data.as_slice()) {
    (ResourceType::Single, [row]) => row.clone(),
    _ => wrap_collection(set.data.clone()),
  };

  response.body = payload.to_string().into_bytes();
  response.headers.set(CACHE_EXPIRATION_HEADER, "");
  Ok(response)
}

/// Parse a JSON body for shredding; `None` (logged) when empty or malformed.
pub(crate) fn parse_payload(store_name: &str, response: &Response) -> Option<Value> {
  if response.body.is_empty() {
    return None;
  }
  match serde_json::from_slice(&response.body) {
    Ok(payload) => Some(payload),
    Err(e) => {
      tracing::warn!(store = store_name, url = %response.url, "Error during shredding: {}", e);
      None
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_url_id_addresses_composite_rows() {
    let attr = IdAttribute::Composite(vec!["region".to_string(), "number".to_string()]);
    let from_url = attr.key_for_url_id("eu,42");
    let from_payload = attr.extract(&json!({"region": "eu", "number": 42}));
    assert_eq!(from_url.storage_text(), from_payload.storage_text());

    // wrong arity falls back to a scalar id
    assert_eq!(attr.key_for_url_id("eu"), Key::from("eu"));
    assert_eq!(IdAttribute::from("id").key_for_url_id("a,b"), Key::from("a,b"));
  }

  #[test]
  fn test_composite_key_extraction() {
    let attr = IdAttribute::Composite(vec!["dept".to_string(), "id".to_string()]);
    let key = attr.extract(&json!({"dept": "eng", "id": 7}));
    assert_eq!(key, Key::Composite(vec![json!("eng"), json!(7)]));
  }

  #[test]
  fn test_rows_skip_missing_keys() {
    let set = ShreddedRecordSet {
      name: "items".to_string(),
      resource_identifier: None,
      keys: vec![Key::Scalar(json!(1)), Key::Scalar(Value::Null)],
      data: vec![json!({"id": 1}), json!({"name": "no id"})],
      resource_type: ResourceType::Collection,
    };
    let rows = set.rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].value, json!({"id": 1}));
  }

  #[test]
  fn test_unshredder_rejects_wrong_set_count() {
    let response = Response::new(200, "OK");
    let err = render_json(&[], response, Value::Array).unwrap_err();
    assert!(err.to_string().contains("not in the correct format"));
  }

  #[test]
  fn test_id_attribute_from_yaml() {
    let single: IdAttribute = serde_yaml::from_str("id").unwrap();
    assert_eq!(single, IdAttribute::from("id"));
    let composite: IdAttribute = serde_yaml::from_str("[dept, id]").unwrap();
    assert!(matches!(composite, IdAttribute::Composite(ref f) if f.len() == 2));
  }
}
