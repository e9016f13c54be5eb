//! Oracle REST resources: collections arrive as `{items: [...], count, ...}`.

use color_eyre::Result;
use serde_json::{json, Value};

use super::{
  parse_payload, render_json, IdAttribute, ResourceType, ShreddedRecordSet, Shredder, Unshredder,
};
use crate::cache::traits::Key;
use crate::http::Response;

const ECID_HEADER: &str = "x-oracle-dms-ecid";

pub struct OracleRestShredder {
  store_name: String,
  id_attribute: IdAttribute,
}

impl OracleRestShredder {
  pub fn new(store_name: &str, id_attribute: IdAttribute) -> Self {
    Self {
      store_name: store_name.to_string(),
      id_attribute,
    }
  }
}

impl Shredder for OracleRestShredder {
  fn store_name(&self) -> &str {
    &self.store_name
  }

  fn url_key(&self, id: &str) -> Key {
    self.id_attribute.key_for_url_id(id)
  }

  fn shred(&self, response: &Response) -> Vec<ShreddedRecordSet> {
    tracing::debug!(store = %self.store_name, "shredding Oracle REST response");
    let resource_identifier = response.headers.get(ECID_HEADER).map(str::to_string);

    let Some(payload) = parse_payload(&self.store_name, response) else {
      return vec![ShreddedRecordSet::empty(&self.store_name, resource_identifier)];
    };

    let (resource_type, data) = match payload.get("items") {
      Some(Value::Array(items)) => (ResourceType::Collection, items.clone()),
      _ => (ResourceType::Single, vec![payload]),
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

pub struct OracleRestUnshredder;

impl Unshredder for OracleRestUnshredder {
  fn unshred(&self, data: &[ShreddedRecordSet], response: Response) -> Result<Response> {
    render_json(data, response, |items| {
      let count = items.len();
      json!({ "items": items, "count": count })
    })
  }
}
