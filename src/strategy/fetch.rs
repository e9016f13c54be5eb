//! Cache-vs-network policies for GET/HEAD.

use color_eyre::Result;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::cache::header_expiration;
use crate::http::{Request, Response};
use crate::proxy::RequestContext;

/// Receives the server's answer to a background refresh and returns the
/// response that should be cached in its place.
pub type ServerResponseCallback =
  Arc<dyn Fn(Request, Response) -> BoxFuture<'static, Result<Response>> + Send + Sync>;

/// Decides where a GET/HEAD response comes from.
pub trait FetchStrategy: Send + Sync {
  fn fetch<'a>(&'a self, ctx: &'a RequestContext, request: Request) -> BoxFuture<'a, Result<Response>>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackgroundFetch {
  #[default]
  Enabled,
  Disabled,
}

/// Serve from the cache whenever possible; refresh in the background.
pub struct CacheFirstStrategy {
  callback: Option<ServerResponseCallback>,
}

impl CacheFirstStrategy {
  /// Without a callback, background results are only used to refresh the cache.
  pub fn new(background_fetch: BackgroundFetch, callback: Option<ServerResponseCallback>) -> Self {
    let callback = match background_fetch {
      BackgroundFetch::Disabled => None,
      BackgroundFetch::Enabled => Some(callback.unwrap_or_else(|| Arc::new(passthrough) as ServerResponseCallback)),
    };
    Self { callback }
  }
}

fn passthrough(_request: Request, response: Response) -> BoxFuture<'static, Result<Response>> {
  async move { Ok(response) }.boxed()
}

impl Default for CacheFirstStrategy {
  fn default() -> Self {
    Self::new(BackgroundFetch::Enabled, None)
  }
}

impl FetchStrategy for CacheFirstStrategy {
  fn fetch<'a>(&'a self, ctx: &'a RequestContext, request: Request) -> BoxFuture<'a, Result<Response>> {
    fetch_from_cache_or_server(ctx, request, self.callback.clone()).boxed()
  }
}

/// Network while online; the cache only when offline or the server fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheIfOfflineStrategy;

impl FetchStrategy for CacheIfOfflineStrategy {
  fn fetch<'a>(&'a self, ctx: &'a RequestContext, request: Request) -> BoxFuture<'a, Result<Response>> {
    async move {
      if !ctx.services.connectivity.is_online() {
        return fetch_from_cache_or_server(ctx, request, None).await;
      }

      match ctx.services.transport.fetch(request.clone()).await {
        Ok(response) if response.ok() => Ok(with_request_url(response, &request)),
        // 3xx and 4xx belong to the client, never overridden by the cache
        Ok(response) if response.status < 500 => Ok(response),
        Ok(response) => {
          tracing::debug!(url = %request.url, status = response.status, "server error, falling back to cache");
          fetch_from_cache_or_server(ctx, request, None).await
        }
        Err(e) => {
          tracing::debug!(url = %request.url, "network unreachable, falling back to cache: {}", e);
          fetch_from_cache_or_server(ctx, request, None).await
        }
      }
    }
    .boxed()
  }
}

/// Shared resolution: query handler, then response cache, then network.
///
/// A local answer triggers the background refresh when a callback is set.
/// A miss is fetched in the critical path; if that fails too the answer is
/// a 503.
pub async fn fetch_from_cache_or_server(
  ctx: &RequestContext,
  request: Request,
  callback: Option<ServerResponseCallback>,
) -> Result<Response> {
  if let Some(handler) = &ctx.options.query_handler {
    if let Some(response) = handler.handle(ctx, &request)? {
      tracing::debug!(endpoint = %ctx.endpoint_key, url = %request.url, "answered by query handler");
      spawn_refresh(ctx, request, callback);
      return Ok(response);
    }
  }

  let cached = ctx
    .services
    .cache
    .match_request(&request, false, ctx.options.json_processor.as_ref())?;
  if let Some(response) = cached {
    spawn_refresh(ctx, request, callback);
    return Ok(response);
  }

  match ctx.services.transport.fetch(request.clone()).await {
    Ok(response) => {
      let response = with_request_url(response, &request);
      if let Some(callback) = callback {
        let ctx = ctx.clone();
        let refreshed = response.clone();
        tokio::spawn(async move {
          if let Err(e) = run_callback(&ctx, request, refreshed, callback).await {
            tracing::warn!(endpoint = %ctx.endpoint_key, "Server response callback failed: {}", e);
          }
        });
      }
      Ok(response)
    }
    Err(e) => {
      tracing::info!(url = %request.url, "No cached response exists: {}", e);
      Ok(Response::new(503, "No cached response exists").with_url(request.url))
    }
  }
}

/// Fetch again in the background and hand the result to `callback`.
///
/// Skipped while offline: the fetch could only fail.
fn spawn_refresh(ctx: &RequestContext, request: Request, callback: Option<ServerResponseCallback>) {
  let Some(callback) = callback else {
    return;
  };
  if !ctx.services.connectivity.is_online() {
    tracing::debug!(url = %request.url, "offline, skipping background refresh");
    return;
  }

  let ctx = ctx.clone();
  tokio::spawn(async move {
    let response = match ctx.services.transport.fetch(request.clone()).await {
      Ok(response) => with_request_url(response, &request),
      Err(e) => {
        tracing::debug!(url = %request.url, "Background refresh failed: {}", e);
        return;
      }
    };
    if let Err(e) = run_callback(&ctx, request, response, callback).await {
      tracing::warn!(endpoint = %ctx.endpoint_key, "Server response callback failed: {}", e);
    }
  });
}

/// Run the user callback, then refresh an existing cache entry with its result.
async fn run_callback(
  ctx: &RequestContext,
  request: Request,
  response: Response,
  callback: ServerResponseCallback,
) -> Result<Response> {
  let resolved = callback(request.clone(), response).await?;

  if request.method.is_read() && !resolved.is_cached() && ctx.services.cache.has_match(&request, false)? {
    tracing::debug!(url = %request.url, "refreshing cache from background fetch");
    ctx.services.cache.put(
      &request,
      &resolved,
      header_expiration(&request, &resolved),
      ctx.options.json_processor.as_ref(),
    )?;
  }
  Ok(resolved)
}

fn with_request_url(mut response: Response, request: &Request) -> Response {
  if response.url.is_empty() {
    response.url = request.url.clone();
  }
  response
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::proxy::testing::{context_with, ScriptedTransport};
  use crate::proxy::ProxyOptions;
  use std::time::Duration;
  use tokio::sync::mpsc;

  #[tokio::test]
  async fn test_cache_if_offline_prefers_network() {
    let transport = ScriptedTransport::replying(vec![Response::new(200, "OK").with_body("net")]);
    let ctx = context_with(transport, ProxyOptions::default());
    let request = Request::get("/items");
    ctx
      .services
      .cache
      .put(&request, &Response::new(200, "OK").with_body("cached"), None, None)
      .unwrap();

    let response = CacheIfOfflineStrategy.fetch(&ctx, request).await.unwrap();
    assert_eq!(response.text(), "net");
    assert_eq!(response.url, "/items");
  }

  #[tokio::test]
  async fn test_cache_if_offline_passes_client_errors_through() {
    let transport = ScriptedTransport::replying(vec![Response::new(404, "Not Found")]);
    let ctx = context_with(transport, ProxyOptions::default());
    let request = Request::get("/items");
    ctx
      .services
      .cache
      .put(&request, &Response::new(200, "OK"), None, None)
      .unwrap();

    let response = CacheIfOfflineStrategy.fetch(&ctx, request).await.unwrap();
    assert_eq!(response.status, 404);
  }

  #[tokio::test]
  async fn test_cache_if_offline_falls_back_on_server_error() {
    let transport = ScriptedTransport::replying(vec![Response::new(502, "Bad Gateway")]);
    let ctx = context_with(transport, ProxyOptions::default());
    let request = Request::get("/items");
    ctx
      .services
      .cache
      .put(&request, &Response::new(200, "OK").with_body("cached"), None, None)
      .unwrap();

    let response = CacheIfOfflineStrategy.fetch(&ctx, request).await.unwrap();
    assert_eq!(response.text(), "cached");
    assert!(response.is_cached());
  }

  #[tokio::test]
  async fn test_miss_without_network_is_503() {
    let ctx = context_with(ScriptedTransport::unreachable(), ProxyOptions::default());
    ctx.services.connectivity.set_online(false);

    let response = CacheIfOfflineStrategy.fetch(&ctx, Request::get("/nothing")).await.unwrap();
    assert_eq!(response.status, 503);
    assert_eq!(response.status_text, "No cached response exists");
  }

  #[tokio::test]
  async fn test_cache_first_refreshes_in_background() {
    let transport = ScriptedTransport::replying(vec![Response::new(200, "OK").with_body("fresh")]);
    let ctx = context_with(transport, ProxyOptions::default());
    let request = Request::get("/items");
    ctx
      .services
      .cache
      .put(&request, &Response::new(200, "OK").with_body("cached"), None, None)
      .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let callback: ServerResponseCallback = Arc::new(
      move |_request: Request, response: Response| -> BoxFuture<'static, Result<Response>> {
        let tx = tx.clone();
        async move {
          let _ = tx.send(response.text());
          Ok(response)
        }
        .boxed()
      },
    );
    let strategy = CacheFirstStrategy::new(BackgroundFetch::Enabled, Some(callback));

    let response = strategy.fetch(&ctx, request.clone()).await.unwrap();
    assert_eq!(response.text(), "cached");

    let seen = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
    assert_eq!(seen.as_deref(), Some("fresh"));

    // The cache is written after the callback returns.
    for _ in 0..50 {
      let hit = ctx.services.cache.match_request(&request, false, None).unwrap().unwrap();
      if hit.text() == "fresh" {
        return;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("cache was not refreshed");
  }

  #[tokio::test]
  async fn test_cache_first_miss_goes_to_network() {
    let transport = ScriptedTransport::replying(vec![Response::new(200, "OK").with_body("net")]);
    let ctx = context_with(transport.clone(), ProxyOptions::default());
    let request = Request::get("/items");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let callback: ServerResponseCallback = Arc::new(
      move |_request: Request, response: Response| -> BoxFuture<'static, Result<Response>> {
        let tx = tx.clone();
        async move {
          let _ = tx.send(response.text());
          Ok(response)
        }
        .boxed()
      },
    );
    let strategy = CacheFirstStrategy::new(BackgroundFetch::Enabled, Some(callback));

    let response = strategy.fetch(&ctx, request.clone()).await.unwrap();
    assert_eq!(response.text(), "net");
    assert_eq!(transport.calls().len(), 1);

    let seen = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
    assert_eq!(seen.as_deref(), Some("net"));

    // Only an existing entry is refreshed; the miss does not create one.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!ctx.services.cache.has_match(&request, false).unwrap());
  }

  #[tokio::test]
  async fn test_cache_first_background_disabled() {
    let transport = ScriptedTransport::replying(vec![Response::new(200, "OK")]);
    let ctx = context_with(transport.clone(), ProxyOptions::default());
    let request = Request::get("/items");
    ctx
      .services
      .cache
      .put(&request, &Response::new(200, "OK").with_body("cached"), None, None)
      .unwrap();

    let strategy = CacheFirstStrategy::new(BackgroundFetch::Disabled, None);
    let response = strategy.fetch(&ctx, request).await.unwrap();
    assert_eq!(response.text(), "cached");

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(transport.calls().is_empty());
  }
}
