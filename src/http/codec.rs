//! JSON-safe forms of requests and responses for persistence and replay.

use base64::{engine::general_purpose::STANDARD, Engine};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};

use super::{Headers, Method, Request, Response};

/// A body as it is written to storage: UTF-8 text verbatim, anything else base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "encoding", content = "data", rename_all = "lowercase")]
pub enum SerializedBody {
  Text(String),
  Base64(String),
}

impl SerializedBody {
  pub fn encode(bytes: &[u8]) -> Self {
    match std::str::from_utf8(bytes) {
      Ok(text) => SerializedBody::Text(text.to_string()),
      Err(_) => SerializedBody::Base64(STANDARD.encode(bytes)),
    }
  }

  pub fn decode(&self) -> Result<Vec<u8>> {
    match self {
      SerializedBody::Text(text) => Ok(text.clone().into_bytes()),
      SerializedBody::Base64(data) => STANDARD
        .decode(data)
        .map_err(|e| eyre!("Failed to decode base64 body: {}", e)),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedRequest {
  pub method: Method,
  pub url: String,
  pub headers: Headers,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub body: Option<SerializedBody>,
}

impl From<&Request> for SerializedRequest {
  fn from(request: &Request) -> Self {
    Self {
      method: request.method,
      url: request.url.clone(),
      headers: request.headers.clone(),
      body: request.body.as_deref().map(SerializedBody::encode),
    }
  }
}

impl SerializedRequest {
  pub fn into_request(self) -> Result<Request> {
    let body = self.body.map(|b| b.decode()).transpose()?;
    Ok(Request {
      method: self.method,
      url: self.url,
      headers: self.headers,
      body,
    })
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedResponse {
  pub status: u16,
  pub status_text: String,
  #[serde(default)]
  pub url: String,
  pub headers: Headers,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub body: Option<SerializedBody>,
}

impl From<&Response> for SerializedResponse {
  fn from(response: &Response) -> Self {
    Self {
      status: response.status,
      status_text: response.status_text.clone(),
      url: response.url.clone(),
      headers: response.headers.clone(),
      body: if response.body.is_empty() {
        None
      } else {
        Some(SerializedBody::encode(&response.body))
      },
    }
  }
}

impl SerializedResponse {
  pub fn into_response(self) -> Result<Response> {
    let body = self.body.map(|b| b.decode()).transpose()?.unwrap_or_default();
    Ok(Response {
      status: self.status,
      status_text: self.status_text,
      url: self.url,
      headers: self.headers,
      body,
    })
  }
}

/// Convert a request into response form: same URL, headers and body, status 200.
///
/// Request and response share enough shape that an optimistic local write can
/// be answered with the request itself.
pub fn response_from_request(request: &Request) -> Response {
  Response {
    status: 200,
    status_text: "OK".to_string(),
    url: request.url.clone(),
    headers: request.headers.clone(),
    body: request.body.clone().unwrap_or_default(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_binary_body_survives_json() {
    let request = Request::new(Method::Post, "/upload").with_body(vec![0xff, 0x00, 0x10]);
    let serialized = SerializedRequest::from(&request);
    assert!(matches!(serialized.body, Some(SerializedBody::Base64(_))));

    let text = serde_json::to_string(&serialized).unwrap();
    let restored: SerializedRequest = serde_json::from_str(&text).unwrap();
    assert_eq!(restored.into_request().unwrap(), request);
  }

  #[test]
  fn test_wire_shape() {
    let request = Request::new(Method::Put, "/items/5")
      .with_header("If-Match", "v1")
      .with_json(&json!({"id": 5}));
    let value = serde_json::to_value(SerializedRequest::from(&request)).unwrap();
    assert_eq!(value["method"], "PUT");
    assert_eq!(value["headers"]["if-match"], "v1");
    assert_eq!(value["body"]["encoding"], "text");
    assert_eq!(value["body"]["data"], r#"{"id":5}"#);
  }

  #[test]
  fn test_response_from_request_copies_payload() {
    let request = Request::new(Method::Put, "/items/5").with_body("{}");
    let response = response_from_request(&request);
    assert_eq!(response.status, 200);
    assert_eq!(response.url, "/items/5");
    assert_eq!(response.body, b"{}");
  }
}
