//! Default per-method request handlers and the override table.

use color_eyre::Result;
use futures::future::BoxFuture;
use futures::FutureExt;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use super::RequestContext;
use crate::http::codec::response_from_request;
use crate::http::{Method, Request, Response, CACHE_EXPIRATION_HEADER, ETAG_GENERATED_HEADER};

/// Produces the response for one HTTP method.
pub trait RequestHandler: Send + Sync {
  fn handle<'a>(&'a self, ctx: &'a RequestContext, request: Request) -> BoxFuture<'a, Result<Response>>;
}

/// Caller-supplied handlers replacing the defaults for chosen methods.
#[derive(Clone, Default)]
pub struct HandlerOverrides {
  handlers: HashMap<Method, Arc<dyn RequestHandler>>,
}

impl HandlerOverrides {
  pub fn set(&mut self, method: Method, handler: Arc<dyn RequestHandler>) {
    self.handlers.insert(method, handler);
  }

  pub fn is_overridden(&self, method: Method) -> bool {
    self.handlers.contains_key(&method)
  }

  /// The override for `method`, or its default handler.
  pub fn resolve(&self, method: Method) -> Arc<dyn RequestHandler> {
    if let Some(handler) = self.handlers.get(&method) {
      return handler.clone();
    }
    match method {
      Method::Get | Method::Head => Arc::new(FetchStrategyHandler),
      Method::Post | Method::Patch | Method::Options => Arc::new(ErrorIfOfflineHandler),
      Method::Put | Method::Delete => Arc::new(NetworkFirstHandler),
    }
  }
}

/// GET/HEAD: delegate to the configured fetch strategy.
#[derive(Debug, Clone, Copy, Default)]
pub struct FetchStrategyHandler;

impl RequestHandler for FetchStrategyHandler {
  fn handle<'a>(&'a self, ctx: &'a RequestContext, request: Request) -> BoxFuture<'a, Result<Response>> {
    ctx.options.fetch_strategy.fetch(ctx, request)
  }
}

/// POST/PATCH/OPTIONS: the network while online, a 503 while offline.
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorIfOfflineHandler;

impl RequestHandler for ErrorIfOfflineHandler {
  fn handle<'a>(&'a self, ctx: &'a RequestContext, request: Request) -> BoxFuture<'a, Result<Response>> {
    async move {
      if ctx.services.connectivity.is_online() {
        return ctx.services.transport.fetch(request).await;
      }

      let status_text = format!("Must provide {} override for offline", override_name(request.method));
      tracing::info!(method = %request.method, url = %request.url, "offline without a handler override");
      Ok(Response::new(503, status_text).with_url(request.url))
    }
    .boxed()
  }
}

fn override_name(method: Method) -> &'static str {
  match method {
    Method::Get => "handleGet",
    Method::Head => "handleHead",
    Method::Post => "handlePost",
    Method::Put => "handlePut",
    Method::Patch => "handlePatch",
    Method::Delete => "handleDelete",
    Method::Options => "handleOptions",
  }
}

/// PUT/DELETE: the network first; while offline, or when the server answers
/// 5xx, the request itself is echoed back as an accepted local write.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetworkFirstHandler;

impl RequestHandler for NetworkFirstHandler {
  fn handle<'a>(&'a self, ctx: &'a RequestContext, request: Request) -> BoxFuture<'a, Result<Response>> {
    async move {
      if !ctx.services.connectivity.is_online() {
        return synthesize(ctx, &request);
      }

      match ctx.services.transport.fetch(request.clone()).await {
        // 3xx and 4xx are left for the client to correct
        Ok(response) if response.status < 500 => Ok(response),
        Ok(response) => {
          tracing::debug!(url = %request.url, status = response.status, "server error, answering locally");
          synthesize(ctx, &request)
        }
        Err(e) => {
          tracing::debug!(url = %request.url, "network unreachable, answering locally: {}", e);
          synthesize(ctx, &request)
        }
      }
    }
    .boxed()
  }
}

/// Build the optimistic 200 for a write the server has not seen.
fn synthesize(ctx: &RequestContext, request: &Request) -> Result<Response> {
  let mut response = response_from_request(request);
  response.headers.set("content-type", "application/json");
  response.headers.set(CACHE_EXPIRATION_HEADER, "");

  if request.method == Method::Put
    && (request.headers.contains("if-match") || request.headers.contains("if-none-match"))
  {
    let etag = next_etag().to_string();
    tracing::debug!(url = %request.url, %etag, "generated offline etag");
    response.headers.set("etag", etag.clone());
    response.headers.set(ETAG_GENERATED_HEADER, etag);
    response.headers.remove("if-match");
    response.headers.remove("if-none-match");
  }

  if request.method == Method::Delete {
    fill_deleted_row(ctx, request, &mut response)?;
  }
  Ok(response)
}

/// A DELETE carries no payload; answer with the row's last known value.
fn fill_deleted_row(ctx: &RequestContext, request: &Request, response: &mut Response) -> Result<()> {
  let (Some(processor), Some(id)) = (ctx.options.json_processor.as_ref(), request.url_id()) else {
    return Ok(());
  };

  let store = ctx.services.stores.open_store(processor.store_name())?;
  if let Some(row) = store.find_by_key(&processor.url_key(id))? {
    response.set_json_body(&row);
  }
  Ok(())
}

static LAST_ETAG: AtomicI64 = AtomicI64::new(0);

/// Current time in ms plus jitter, strictly increasing within the process.
fn next_etag() -> i64 {
  let candidate = chrono::Utc::now().timestamp_millis() + rand::thread_rng().gen_range(0..1_000_000);
  let previous = LAST_ETAG
    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
      Some(candidate.max(last + 1))
    })
    .unwrap_or_else(|last| last);
  candidate.max(previous + 1)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::proxy::testing::{context_with, ScriptedTransport};
  use crate::proxy::ProxyOptions;
  use crate::shred::{IdAttribute, JsonProcessor};
  use serde_json::json;

  #[test]
  fn test_etags_increase() {
    let first = next_etag();
    let second = next_etag();
    assert!(second > first);
  }

  #[tokio::test]
  async fn test_post_offline_is_503() {
    let ctx = context_with(ScriptedTransport::unreachable(), ProxyOptions::default());
    ctx.services.connectivity.set_online(false);

    let request = Request::new(Method::Post, "/items").with_body("{}");
    let response = ErrorIfOfflineHandler.handle(&ctx, request).await.unwrap();
    assert_eq!(response.status, 503);
    assert_eq!(response.status_text, "Must provide handlePost override for offline");
  }

  #[tokio::test]
  async fn test_put_passes_client_error_through() {
    let transport = ScriptedTransport::replying(vec![Response::new(409, "Conflict")]);
    let ctx = context_with(transport, ProxyOptions::default());

    let request = Request::new(Method::Put, "/items/5").with_body("{}");
    let response = NetworkFirstHandler.handle(&ctx, request).await.unwrap();
    assert_eq!(response.status, 409);
    assert!(!response.is_cached());
  }

  #[tokio::test]
  async fn test_put_server_error_is_answered_locally() {
    let transport = ScriptedTransport::replying(vec![Response::new(503, "Unavailable")]);
    let ctx = context_with(transport, ProxyOptions::default());

    let request = Request::new(Method::Put, "/items/5")
      .with_header("If-None-Match", "*")
      .with_json(&json!({"id": 5}));
    let response = NetworkFirstHandler.handle(&ctx, request).await.unwrap();

    assert_eq!(response.status, 200);
    assert!(response.is_cached());
    assert_eq!(response.headers.get("content-type"), Some("application/json"));
    assert!(!response.headers.contains("if-none-match"));
    assert_eq!(response.headers.get("etag"), response.headers.get(ETAG_GENERATED_HEADER));
  }

  #[tokio::test]
  async fn test_delete_without_processor_has_empty_body() {
    let ctx = context_with(ScriptedTransport::unreachable(), ProxyOptions::default());
    ctx.services.connectivity.set_online(false);

    let response = NetworkFirstHandler
      .handle(&ctx, Request::new(Method::Delete, "/items/5"))
      .await
      .unwrap();
    assert_eq!(response.status, 200);
    assert!(response.body.is_empty());
  }

  #[tokio::test]
  async fn test_offline_delete_finds_composite_row() {
    use crate::cache::traits::{Key, Row};

    let id = IdAttribute::Composite(vec!["region".to_string(), "number".to_string()]);
    let options = ProxyOptions::default().with_json_processor(JsonProcessor::simple("orders", id));
    let ctx = context_with(ScriptedTransport::unreachable(), options);
    ctx
      .services
      .stores
      .open_store("orders")
      .unwrap()
      .upsert_all(&[Row {
        key: Key::Composite(vec![json!("eu"), json!(42)]),
        value: json!({"region": "eu", "number": 42, "total": 9}),
      }])
      .unwrap();
    ctx.services.connectivity.set_online(false);

    let response = NetworkFirstHandler
      .handle(&ctx, Request::new(Method::Delete, "/orders/eu,42"))
      .await
      .unwrap();
    assert_eq!(response.json().unwrap(), json!({"region": "eu", "number": 42, "total": 9}));
  }

  #[tokio::test]
  async fn test_override_wins() {
    struct Teapot;
    impl RequestHandler for Teapot {
      fn handle<'a>(&'a self, _ctx: &'a RequestContext, _request: Request) -> BoxFuture<'a, Result<Response>> {
        async { Ok(Response::new(418, "I'm a teapot")) }.boxed()
      }
    }

    let options = ProxyOptions::default()
      .with_json_processor(JsonProcessor::simple("items", IdAttribute::from("id")))
      .with_handler(Method::Post, Arc::new(Teapot));
    let ctx = context_with(ScriptedTransport::unreachable(), options);

    assert!(ctx.options.handlers.is_overridden(Method::Post));
    let handler = ctx.options.handlers.resolve(Method::Post);
    let response = handler.handle(&ctx, Request::new(Method::Post, "/items")).await.unwrap();
    assert_eq!(response.status, 418);
  }
}
