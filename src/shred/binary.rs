//! Opaque bodies (images, documents): one row per URL, stored base64-encoded.

use base64::{engine::general_purpose::STANDARD, Engine};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;

use super::{expect_single_set, ResourceType, ShreddedRecordSet, Shredder, Unshredder};
use crate::cache::traits::Key;
use crate::http::{Response, CACHE_EXPIRATION_HEADER, RESPONSE_URL_HEADER};

pub struct BinaryShredder {
  store_name: String,
}

impl BinaryShredder {
  pub fn new(store_name: &str) -> Self {
    Self {
      store_name: store_name.to_string(),
    }
  }
}

impl Shredder for BinaryShredder {
  fn store_name(&self) -> &str {
    &self.store_name
  }

  fn shred(&self, response: &Response) -> Vec<ShreddedRecordSet> {
    let url = if response.url.is_empty() {
      response.headers.get(RESPONSE_URL_HEADER).unwrap_or_default()
    } else {
      response.url.as_str()
    };

    vec![ShreddedRecordSet {
      name: self.store_name.clone(),
      resource_identifier: response.headers.get("etag").map(str::to_string),
      keys: vec![Key::from(url)],
      data: vec![Value::String(STANDARD.encode(&response.body))],
      resource_type: ResourceType::Single,
    }]
  }
}

pub struct BinaryUnshredder;

impl Unshredder for BinaryUnshredder {
  fn unshred(&self, data: &[ShreddedRecordSet], mut response: Response) -> Result<Response> {
    let set = expect_single_set(data)?;
    let encoded = match set.data.as_slice() {
      [Value::String(encoded)] => encoded,
      _ => return Err(eyre!("shredded data is not in the correct format: expected one blob")),
    };

    response.body = STANDARD
      .decode(encoded)
      .map_err(|e| eyre!("Failed to decode stored blob: {}", e))?;
    response.headers.set(CACHE_EXPIRATION_HEADER, "");
    Ok(response)
  }
}
