//! The response proxy: dispatches each request through its method handler,
//! the cache strategy and the shredded store, and enrolls what the server
//! has not seen in the sync queue.

pub mod handlers;
pub mod undo;

use color_eyre::Result;
use std::sync::Arc;

use crate::cache::{ResponseCache, SqliteStorage, StoreAdapter};
use crate::connectivity::Connectivity;
use crate::http::codec::SerializedRequest;
use crate::http::endpoint::{EndpointKey, InFlight};
use crate::http::transport::Transport;
use crate::http::{Method, Request, Response};
use crate::query::QueryHandler;
use crate::shred::JsonProcessor;
use crate::strategy::{CacheIfOfflineStrategy, CacheStrategy, FetchStrategy, HttpCacheHeaderStrategy};
use crate::sync::{SyncQueue, UndoRedoRecord};

pub use handlers::{HandlerOverrides, RequestHandler};

/// Collaborators shared by every request.
#[derive(Clone)]
pub struct Services {
  pub transport: Arc<dyn Transport>,
  pub connectivity: Connectivity,
  pub cache: ResponseCache,
  pub stores: Arc<dyn StoreAdapter>,
  pub sync_queue: Arc<dyn SyncQueue>,
}

impl Services {
  /// Wire every store-backed collaborator to one SQLite database.
  pub fn from_storage(transport: Arc<dyn Transport>, connectivity: Connectivity, storage: SqliteStorage) -> Self {
    let shared = Arc::new(storage);
    Self {
      transport,
      connectivity,
      cache: ResponseCache::new(shared.clone(), shared.clone()),
      stores: shared.clone(),
      sync_queue: shared,
    }
  }
}

/// Strategies and hooks configured for a proxy instance.
#[derive(Clone)]
pub struct ProxyOptions {
  pub fetch_strategy: Arc<dyn FetchStrategy>,
  pub cache_strategy: Arc<dyn CacheStrategy>,
  pub json_processor: Option<JsonProcessor>,
  pub query_handler: Option<Arc<dyn QueryHandler>>,
  pub handlers: HandlerOverrides,
}

impl Default for ProxyOptions {
  fn default() -> Self {
    Self {
      fetch_strategy: Arc::new(CacheIfOfflineStrategy),
      cache_strategy: Arc::new(HttpCacheHeaderStrategy::default()),
      json_processor: None,
      query_handler: None,
      handlers: HandlerOverrides::default(),
    }
  }
}

impl ProxyOptions {
  pub fn with_fetch_strategy(mut self, strategy: Arc<dyn FetchStrategy>) -> Self {
    self.fetch_strategy = strategy;
    self
  }

  pub fn with_cache_strategy(mut self, strategy: Arc<dyn CacheStrategy>) -> Self {
    self.cache_strategy = strategy;
    self
  }

  pub fn with_json_processor(mut self, processor: JsonProcessor) -> Self {
    self.json_processor = Some(processor);
    self
  }

  pub fn with_query_handler(mut self, handler: Arc<dyn QueryHandler>) -> Self {
    self.query_handler = Some(handler);
    self
  }

  pub fn with_handler(mut self, method: Method, handler: Arc<dyn RequestHandler>) -> Self {
    self.handlers.set(method, handler);
    self
  }
}

/// Everything one `process_request` call needs, passed down explicitly and
/// cloned into spawned continuations.
#[derive(Clone)]
pub struct RequestContext {
  pub endpoint_key: EndpointKey,
  pub services: Arc<Services>,
  pub options: Arc<ProxyOptions>,
}

impl RequestContext {
  pub fn new(endpoint_key: EndpointKey, services: Arc<Services>, options: Arc<ProxyOptions>) -> Self {
    Self {
      endpoint_key,
      services,
      options,
    }
  }
}

pub struct ResponseProxy {
  services: Arc<Services>,
  options: Arc<ProxyOptions>,
  in_flight: InFlight,
}

impl ResponseProxy {
  pub fn new(services: Services, options: ProxyOptions) -> Self {
    Self {
      services: Arc::new(services),
      options: Arc::new(options),
      in_flight: InFlight::new(),
    }
  }

  pub fn services(&self) -> &Services {
    &self.services
  }

  pub fn in_flight(&self) -> &InFlight {
    &self.in_flight
  }

  pub fn context(&self, request: &Request) -> RequestContext {
    RequestContext::new(
      EndpointKey::for_request(request),
      self.services.clone(),
      self.options.clone(),
    )
  }

  /// Resolve `request` to a response.
  ///
  /// Expected failures (offline, preconditions, server errors) come back as
  /// responses. `Err` means a handler or storage failed; the request is still
  /// enrolled for replay before the error is returned.
  pub async fn process_request(&self, request: Request) -> Result<Response> {
    let ctx = self.context(&request);
    let _registration = self.in_flight.register(&ctx.endpoint_key);
    let original = request.clone();

    tracing::debug!(endpoint = %ctx.endpoint_key, method = %request.method, url = %request.url, "processing request");
    match run(&ctx, request).await {
      Ok(response) => Ok(response),
      Err(e) => {
        tracing::warn!(endpoint = %ctx.endpoint_key, "Request failed, enrolling for sync: {}", e);
        if let Err(enroll_err) = enroll(&ctx, &original, None) {
          tracing::warn!(endpoint = %ctx.endpoint_key, "Failed to enroll failed request: {}", enroll_err);
        }
        Err(e)
      }
    }
  }
}

async fn run(ctx: &RequestContext, request: Request) -> Result<Response> {
  let handler = ctx.options.handlers.resolve(request.method);
  let response = handler.handle(ctx, request.clone()).await?;
  let synthesized = response.is_cached();

  let mut undo_redo = None;
  let response = if !response.ok() {
    tracing::debug!(endpoint = %ctx.endpoint_key, status = response.status, "response not ok, skipping cache");
    response
  } else if request.method.is_read() {
    ctx.options.cache_strategy.apply(ctx, &request, response).await?
  } else {
    undo_redo = undo::update_shredded_store(ctx, &request, &response)?;
    response
  };

  // Connectivity is read again: it may have changed while the handler ran.
  let offline = !ctx.services.connectivity.is_online();
  if offline || (synthesized && !request.method.is_read()) {
    enroll(ctx, &request, undo_redo.as_deref())?;
  }
  Ok(response)
}

fn enroll(ctx: &RequestContext, request: &Request, undo_redo: Option<&[UndoRedoRecord]>) -> Result<()> {
  tracing::info!(endpoint = %ctx.endpoint_key, method = %request.method, url = %request.url, "enrolling request in sync queue");
  ctx
    .services
    .sync_queue
    .insert_request(&SerializedRequest::from(request), undo_redo)
}

#[cfg(test)]
pub(crate) mod testing {
  use super::*;
  use color_eyre::eyre::eyre;
  use futures::future::BoxFuture;
  use futures::FutureExt;
  use std::collections::VecDeque;
  use std::sync::Mutex;

  /// Transport double: replies from a script in order, then fails as if the
  /// network were down. Every request is recorded.
  #[derive(Default)]
  pub(crate) struct ScriptedTransport {
    replies: Mutex<VecDeque<Response>>,
    calls: Mutex<Vec<Request>>,
  }

  impl ScriptedTransport {
    pub(crate) fn unreachable() -> Arc<Self> {
      Arc::new(Self::default())
    }

    pub(crate) fn replying(replies: Vec<Response>) -> Arc<Self> {
      Arc::new(Self {
        replies: Mutex::new(replies.into()),
        calls: Mutex::new(Vec::new()),
      })
    }

    pub(crate) fn calls(&self) -> Vec<Request> {
      self.calls.lock().unwrap().clone()
    }
  }

  impl Transport for ScriptedTransport {
    fn fetch(&self, request: Request) -> BoxFuture<'_, Result<Response>> {
      let url = request.url.clone();
      self.calls.lock().unwrap().push(request);
      let reply = self.replies.lock().unwrap().pop_front();
      async move { reply.ok_or_else(|| eyre!("Failed to fetch {}: network unreachable", url)) }.boxed()
    }
  }

  pub(crate) fn services_with(transport: Arc<ScriptedTransport>) -> Services {
    let storage = SqliteStorage::open_in_memory().unwrap();
    Services::from_storage(transport, Connectivity::default(), storage)
  }

  pub(crate) fn context_with(transport: Arc<ScriptedTransport>, options: ProxyOptions) -> RequestContext {
    RequestContext::new(
      EndpointKey::new(Method::Get, "/test"),
      Arc::new(services_with(transport)),
      Arc::new(options),
    )
  }

  pub(crate) fn proxy_with(transport: Arc<ScriptedTransport>, options: ProxyOptions) -> ResponseProxy {
    ResponseProxy::new(services_with(transport), options)
  }
}

#[cfg(test)]
mod tests {
  use super::testing::{proxy_with, ScriptedTransport};
  use super::*;
  use crate::cache::traits::{Key, Row};
  use crate::shred::IdAttribute;
  use crate::http::ETAG_GENERATED_HEADER;
  use crate::sync::StoreOperation;
  use color_eyre::eyre::eyre;
  use futures::future::BoxFuture;
  use futures::FutureExt;
  use serde_json::json;

  fn items() -> ProxyOptions {
    ProxyOptions::default().with_json_processor(JsonProcessor::simple("items", IdAttribute::from("id")))
  }

  #[tokio::test]
  async fn test_offline_put_echoes_request() {
    let proxy = proxy_with(ScriptedTransport::unreachable(), items());
    proxy.services().connectivity.set_online(false);

    let put = || {
      Request::new(Method::Put, "/items/5")
        .with_header("If-Match", "v1")
        .with_json(&json!({"id": 5, "name": "x"}))
    };
    let first = proxy.process_request(put()).await.unwrap();
    let second = proxy.process_request(put()).await.unwrap();

    assert_eq!(first.status, 200);
    assert_eq!(first.json().unwrap(), json!({"id": 5, "name": "x"}));
    assert!(first.headers.get("etag").is_some());
    let etag = |r: &Response| r.headers.get("etag").and_then(|e| e.parse::<i64>().ok()).unwrap();
    assert!(etag(&second) > etag(&first));
    assert_eq!(first.headers.get(ETAG_GENERATED_HEADER), first.headers.get("etag"));
    assert!(!first.headers.contains("if-match"));

    let pending = proxy.services().sync_queue.pending().unwrap();
    assert_eq!(pending.len(), 2);
    let records = pending[0].undo_redo_data_array.as_ref().unwrap();
    assert_eq!(records[0].operation, StoreOperation::Upsert);
    assert!(proxy.in_flight().is_empty());
  }

  #[tokio::test]
  async fn test_offline_put_without_precondition_gets_no_etag() {
    let proxy = proxy_with(ScriptedTransport::unreachable(), items());
    proxy.services().connectivity.set_online(false);

    let request = Request::new(Method::Put, "/items/5").with_json(&json!({"id": 5, "name": "x"}));
    let response = proxy.process_request(request).await.unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.json().unwrap(), json!({"id": 5, "name": "x"}));
    assert!(!response.headers.contains("etag"));
    assert!(!response.headers.contains(ETAG_GENERATED_HEADER));
  }

  #[tokio::test]
  async fn test_offline_delete_recovers_row() {
    let proxy = proxy_with(ScriptedTransport::unreachable(), items());
    let store = proxy.services().stores.open_store("items").unwrap();
    store
      .upsert_all(&[Row {
        key: Key::from("5"),
        value: json!({"id": 5, "name": "x"}),
      }])
      .unwrap();
    proxy.services().connectivity.set_online(false);

    let response = proxy
      .process_request(Request::new(Method::Delete, "/items/5"))
      .await
      .unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.json().unwrap(), json!({"id": 5, "name": "x"}));
    assert_eq!(store.find_by_key(&Key::from("5")).unwrap(), None);

    let pending = proxy.services().sync_queue.pending().unwrap();
    let records = pending[0].undo_redo_data_array.as_ref().unwrap();
    assert_eq!(records[0].operation, StoreOperation::Remove);
    assert_eq!(records[0].undo_redo_data[0].undo, Some(json!({"id": 5, "name": "x"})));
  }

  #[tokio::test]
  async fn test_failing_handler_enrolls_original_request() {
    struct Failing;
    impl RequestHandler for Failing {
      fn handle<'a>(&'a self, _ctx: &'a RequestContext, _request: Request) -> BoxFuture<'a, Result<Response>> {
        async { Err(eyre!("handler exploded")) }.boxed()
      }
    }

    let options = items().with_handler(Method::Patch, Arc::new(Failing));
    let proxy = proxy_with(ScriptedTransport::unreachable(), options);
    let request = Request::new(Method::Patch, "/items/5").with_json(&json!({"name": "y"}));

    let err = proxy.process_request(request.clone()).await.unwrap_err();
    assert!(err.to_string().contains("handler exploded"));

    let pending = proxy.services().sync_queue.pending().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].request, SerializedRequest::from(&request));
    assert!(pending[0].undo_redo_data_array.is_none());
    assert!(proxy.in_flight().is_empty());
  }

  #[tokio::test]
  async fn test_get_cached_online_served_offline() {
    let transport = ScriptedTransport::replying(vec![Response::new(200, "OK")
      .with_header("Cache-Control", "max-age=60")
      .with_body(r#"[{"id":1,"name":"a"}]"#)]);
    let proxy = proxy_with(transport, items());

    let online = proxy.process_request(Request::get("/items")).await.unwrap();
    assert!(!online.is_cached());
    assert!(proxy.services().sync_queue.pending().unwrap().is_empty());

    proxy.services().connectivity.set_online(false);
    let offline = proxy.process_request(Request::get("/items")).await.unwrap();
    assert!(offline.is_cached());
    assert_eq!(offline.json().unwrap(), json!([{"id": 1, "name": "a"}]));
  }

  #[tokio::test]
  async fn test_server_error_put_is_enrolled_while_online() {
    let transport = ScriptedTransport::replying(vec![Response::new(500, "Internal Server Error")]);
    let proxy = proxy_with(transport, items());

    let request = Request::new(Method::Put, "/items/7").with_json(&json!({"id": 7}));
    let response = proxy.process_request(request).await.unwrap();
    assert_eq!(response.status, 200);

    assert_eq!(proxy.services().sync_queue.pending().unwrap().len(), 1);
    let store = proxy.services().stores.open_store("items").unwrap();
    assert_eq!(store.find_by_key(&Key::from("7")).unwrap(), Some(json!({"id": 7})));
  }

  #[tokio::test]
  async fn test_online_put_is_not_enrolled() {
    let transport = ScriptedTransport::replying(vec![Response::new(200, "OK").with_body(r#"{"id":3,"v":2}"#)]);
    let proxy = proxy_with(transport, items());

    let request = Request::new(Method::Put, "/items/3").with_json(&json!({"id": 3, "v": 2}));
    proxy.process_request(request).await.unwrap();

    assert!(proxy.services().sync_queue.pending().unwrap().is_empty());
    let store = proxy.services().stores.open_store("items").unwrap();
    assert_eq!(store.find_by_key(&Key::from("3")).unwrap(), Some(json!({"id": 3, "v": 2})));
  }

  #[tokio::test]
  async fn test_post_offline_is_503_and_enrolled() {
    let proxy = proxy_with(ScriptedTransport::unreachable(), items());
    proxy.services().connectivity.set_online(false);

    let response = proxy
      .process_request(Request::new(Method::Post, "/items").with_json(&json!({"name": "n"})))
      .await
      .unwrap();
    assert_eq!(response.status, 503);

    let pending = proxy.services().sync_queue.pending().unwrap();
    assert_eq!(pending.len(), 1);
    assert!(pending[0].undo_redo_data_array.is_none());
  }
}
