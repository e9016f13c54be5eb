//! Plain JSON resources: an array is a collection, an object a single row.

use color_eyre::Result;
use serde_json::Value;

use super::{
  parse_payload, render_json, IdAttribute, ResourceType, ShreddedRecordSet, Shredder, Unshredder,
};
use crate::cache::traits::Key;
use crate::http::Response;

pub struct SimpleShredder {
  store_name: String,
  id_attribute: IdAttribute,
}

impl SimpleShredder {
  pub fn new(store_name: &str, id_attribute: IdAttribute) -> Self {
    Self {
      store_name: store_name.to_string(),
      id_attribute,
    }
  }
}

impl Shredder for SimpleShredder {
  fn store_name(&self) -> &str {
    &self.store_name
  }

  fn url_key(&self, id: &str) -> Key {
    self.id_attribute.key_for_url_id(id)
  }

  fn shred(&self, response: &Response) -> Vec<ShreddedRecordSet> {
    tracing::debug!(store = %self.store_name, "shredding simple JSON response");
    let resource_identifier = response.headers.get("etag").map(str::to_string);

    let Some(payload) = parse_payload(&self.store_name, response) else {
      return vec![ShreddedRecordSet::empty(&self.store_name, resource_identifier)];
    };

    let (resource_type, data) = match payload {
      Value::Array(items) => (ResourceType::Collection, items),
      single => (ResourceType::Single, vec![single]),
    };
    let keys = data.iter().map(|item| self.id_attribute.extract(item)).collect();

    vec![ShreddedRecordSet {
      name: self.store_name.clone(),
      resource_identifier,
      keys,
      data,
      resource_type,
    }]
  }
}

pub struct SimpleUnshredder;

impl Unshredder for SimpleUnshredder {
  fn unshred(&self, data: &[ShreddedRecordSet], response: Response) -> Result<Response> {
    render_json(data, response, Value::Array)
  }
}
