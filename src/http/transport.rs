//! Network transport boundary.

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::time::Duration;

use super::{Headers, Request, Response};

/// Performs a real network fetch.
///
/// Implementations resolve with any HTTP status (4xx and 5xx included) and
/// return `Err` only when no response could be obtained at all.
pub trait Transport: Send + Sync {
  fn fetch(&self, request: Request) -> BoxFuture<'_, Result<Response>>;
}

/// `reqwest`-backed transport. Timeouts are enforced here, not by the proxy.
#[derive(Clone)]
pub struct ReqwestTransport {
  client: reqwest::Client,
}

impl ReqwestTransport {
  pub fn new(timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }

  async fn send(&self, request: Request) -> Result<Response> {
    let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
      .map_err(|e| eyre!("Invalid method {}: {}", request.method, e))?;

    let mut builder = self.client.request(method, &request.url);
    for (name, value) in request.headers.iter() {
      builder = builder.header(name, value);
    }
    if let Some(body) = request.body {
      builder = builder.body(body);
    }

    let response = builder
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", request.url, e))?;

    let status = response.status();
    let url = response.url().to_string();
    let mut headers = Headers::new();
    for (name, value) in response.headers() {
      let Ok(value) = value.to_str() else {
        continue;
      };
      let merged = match headers.get(name.as_str()) {
        Some(existing) => format!("{}, {}", existing, value),
        None => value.to_string(),
      };
      headers.set(name.as_str(), merged);
    }

    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read response body from {}: {}", url, e))?;

    Ok(Response {
      status: status.as_u16(),
      status_text: status.canonical_reason().unwrap_or_default().to_string(),
      url,
      headers,
      body: body.to_vec(),
    })
  }
}

impl Transport for ReqwestTransport {
  fn fetch(&self, request: Request) -> BoxFuture<'_, Result<Response>> {
    tracing::debug!(method = %request.method, url = %request.url, "network fetch");
    self.send(request).boxed()
  }
}
