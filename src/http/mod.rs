//! HTTP value types shared by every layer of the proxy.
//!
//! `Request` and `Response` are plain owned values: cloning one duplicates its
//! headers and buffers its body, so a copy can be kept for the failure path
//! while another is handed to a request handler.

pub mod codec;
pub mod endpoint;
pub mod transport;

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Marks a response as served from the local cache; carries its expiry (or "").
pub const CACHE_EXPIRATION_HEADER: &str = "x-oracle-jscpt-cache-expiration-date";
/// `single` or `collection`, set when a response is written to the cache.
pub const RESOURCE_TYPE_HEADER: &str = "x-oracle-jscpt-resource-type";
/// Copy of an ETag synthesized while the server was unreachable.
pub const ETAG_GENERATED_HEADER: &str = "x-oracle-jscpt-etag-generated";
/// Fallback URL for responses that lost theirs (binary shredding keys on it).
pub const RESPONSE_URL_HEADER: &str = "x-oracle-jscpt-response-url";

/// HTTP methods the proxy dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
  Get,
  Head,
  Post,
  Put,
  Patch,
  Delete,
  Options,
}

impl Method {
  pub fn as_str(&self) -> &'static str {
    match self {
      Method::Get => "GET",
      Method::Head => "HEAD",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Patch => "PATCH",
      Method::Delete => "DELETE",
      Method::Options => "OPTIONS",
    }
  }

  /// GET and HEAD: the only methods whose responses go to the response cache.
  pub fn is_read(&self) -> bool {
    matches!(self, Method::Get | Method::Head)
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Method {
  type Err = color_eyre::Report;

  fn from_str(s: &str) -> Result<Self> {
    match s.to_ascii_uppercase().as_str() {
      "GET" => Ok(Method::Get),
      "HEAD" => Ok(Method::Head),
      "POST" => Ok(Method::Post),
      "PUT" => Ok(Method::Put),
      "PATCH" => Ok(Method::Patch),
      "DELETE" => Ok(Method::Delete),
      "OPTIONS" => Ok(Method::Options),
      other => Err(eyre!("Unsupported HTTP method: {}", other)),
    }
  }
}

/// Header map with case-insensitive names (stored lowercased).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, String>")]
pub struct Headers(BTreeMap<String, String>);

impl Headers {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn get(&self, name: &str) -> Option<&str> {
    self.0.get(&name.to_ascii_lowercase()).map(String::as_str)
  }

  pub fn contains(&self, name: &str) -> bool {
    self.0.contains_key(&name.to_ascii_lowercase())
  }

  pub fn set(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
    self
      .0
      .insert(name.as_ref().to_ascii_lowercase(), value.into());
  }

  pub fn remove(&mut self, name: &str) -> Option<String> {
    self.0.remove(&name.to_ascii_lowercase())
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
    self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }
}

impl From<BTreeMap<String, String>> for Headers {
  fn from(map: BTreeMap<String, String>) -> Self {
    map.into_iter().collect()
  }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for Headers {
  fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
    let mut headers = Headers::new();
    for (name, value) in iter {
      headers.set(name, value);
    }
    headers
  }
}

/// An outgoing request.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
  pub method: Method,
  pub url: String,
  pub headers: Headers,
  pub body: Option<Vec<u8>>,
}

impl Request {
  pub fn new(method: Method, url: impl Into<String>) -> Self {
    Self {
      method,
      url: url.into(),
      headers: Headers::new(),
      body: None,
    }
  }

  pub fn get(url: impl Into<String>) -> Self {
    Self::new(Method::Get, url)
  }

  pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
    self.headers.set(name, value);
    self
  }

  pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
    self.body = Some(body.into());
    self
  }

  /// Attach a JSON body and the matching content type.
  pub fn with_json(self, value: &Value) -> Self {
    self
      .with_header("content-type", "application/json")
      .with_body(value.to_string())
  }

  /// The URL with its query string and fragment removed.
  pub fn url_without_search(&self) -> &str {
    strip_search(&self.url)
  }

  /// Trailing path segment, taken as the resource id (`/items/5` -> `5`).
  pub fn url_id(&self) -> Option<&str> {
    let base = self.url_without_search();
    let (_, last) = base.rsplit_once('/')?;
    if last.is_empty() {
      None
    } else {
      Some(last)
    }
  }

  /// The URL one path segment up (`/items/5` -> `/items`).
  pub fn collection_url(&self) -> Option<String> {
    let base = self.url_without_search();
    let (parent, last) = base.rsplit_once('/')?;
    if last.is_empty() || parent.is_empty() || parent.ends_with('/') {
      return None;
    }
    Some(parent.to_string())
  }

  /// Decoded query parameters in order of appearance.
  pub fn query_pairs(&self) -> Vec<(String, String)> {
    let query = match self.url.split_once('?') {
      Some((_, rest)) => rest.split('#').next().unwrap_or_default(),
      None => return Vec::new(),
    };
    url::form_urlencoded::parse(query.as_bytes())
      .into_owned()
      .collect()
  }
}

/// A response, either from the network or synthesized locally.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
  pub status: u16,
  pub status_text: String,
  pub url: String,
  pub headers: Headers,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, status_text: impl Into<String>) -> Self {
    Self {
      status,
      status_text: status_text.into(),
      url: String::new(),
      headers: Headers::new(),
      body: Vec::new(),
    }
  }

  pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
    self.headers.set(name, value);
    self
  }

  pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
    self.body = body.into();
    self
  }

  pub fn with_url(mut self, url: impl Into<String>) -> Self {
    self.url = url.into();
    self
  }

  /// Status in the 200-299 range.
  pub fn ok(&self) -> bool {
    (200..=299).contains(&self.status)
  }

  /// Whether this response originated from the local cache.
  pub fn is_cached(&self) -> bool {
    self.headers.contains(CACHE_EXPIRATION_HEADER)
  }

  /// Parsed cache expiration; `None` when absent, empty or unparseable.
  pub fn cache_expiration(&self) -> Option<DateTime<Utc>> {
    self
      .headers
      .get(CACHE_EXPIRATION_HEADER)
      .and_then(parse_http_date)
  }

  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }

  pub fn json(&self) -> Result<Value> {
    serde_json::from_slice(&self.body).map_err(|e| eyre!("Failed to parse response body: {}", e))
  }

  /// Replace the body with a JSON payload.
  pub fn set_json_body(&mut self, value: &Value) {
    self.body = value.to_string().into_bytes();
    self.headers.set("content-type", "application/json");
  }

  /// A copy of this response with a different status line.
  pub fn with_status(mut self, status: u16, status_text: impl Into<String>) -> Self {
    self.status = status;
    self.status_text = status_text.into();
    self
  }
}

fn strip_search(url: &str) -> &str {
  let end = url.find(['?', '#']).unwrap_or(url.len());
  &url[..end]
}

/// Parse an HTTP-date (`Wed, 21 Oct 2015 07:28:00 GMT`) or RFC 3339 timestamp.
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
  let value = value.trim();
  if value.is_empty() {
    return None;
  }
  DateTime::parse_from_rfc2822(value)
    .or_else(|_| DateTime::parse_from_rfc3339(value))
    .map(|dt| dt.with_timezone(&Utc))
    .ok()
}

/// Format a timestamp as an HTTP-date.
pub fn format_http_date(date: DateTime<Utc>) -> String {
  date.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}
