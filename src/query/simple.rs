//! Query parameters as field equality: `?name=box` matches rows whose `name` is `box`.

use color_eyre::Result;
use serde_json::Value;

use super::filter::Filter;
use super::{process_query, Paging, QueryHandler};
use crate::http::{Request, Response};
use crate::proxy::RequestContext;

pub struct SimpleQueryHandler {
  store_name: String,
  ignore_params: Vec<String>,
  paging: bool,
}

impl SimpleQueryHandler {
  pub fn new(store_name: &str) -> Self {
    Self {
      store_name: store_name.to_string(),
      ignore_params: Vec::new(),
      paging: false,
    }
  }

  /// Parameters that never become filters (cache busters, expansions, ...).
  pub fn ignore_params<I, S>(mut self, params: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.ignore_params = params.into_iter().map(Into::into).collect();
    self
  }

  /// Treat `offset`/`limit` as paging instead of filters.
  pub fn with_paging(mut self, paging: bool) -> Self {
    self.paging = paging;
    self
  }

  fn filter(&self, params: &[(String, String)]) -> Filter {
    Filter::all_of(
      params
        .iter()
        .filter(|(name, _)| !self.ignore_params.iter().any(|ignored| ignored == name))
        .filter(|(name, _)| !(self.paging && Paging::is_paging_param(name)))
        .map(|(name, value)| Filter::eq(name.as_str(), Value::String(value.clone())))
        .collect(),
    )
  }
}

impl QueryHandler for SimpleQueryHandler {
  fn handle(&self, ctx: &RequestContext, request: &Request) -> Result<Option<Response>> {
    if !request.method.is_read() {
      return Ok(None);
    }

    let params = request.query_pairs();
    let filter = self.filter(&params);
    let paging = if self.paging {
      Paging::from_params(&params)
    } else {
      Paging::default()
    };

    process_query(ctx, request, &self.store_name, &filter, paging)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::http::Method;
  use crate::proxy::testing::{context_with, ScriptedTransport};
  use crate::proxy::ProxyOptions;
  use crate::shred::{IdAttribute, JsonProcessor};
  use serde_json::json;

  fn seeded_context() -> RequestContext {
    let processor = JsonProcessor::simple("items", IdAttribute::from("id"));
    let ctx = context_with(
      ScriptedTransport::unreachable(),
      ProxyOptions::default().with_json_processor(processor.clone()),
    );
    let body = json!([
      {"id": 1, "color": "red", "size": 2},
      {"id": 2, "color": "blue", "size": 2},
      {"id": 3, "color": "red", "size": 5}
    ]);
    ctx
      .services
      .cache
      .put(
        &Request::get("/items"),
        &Response::new(200, "OK").with_body(body.to_string()),
        None,
        Some(&processor),
      )
      .unwrap();
    ctx
  }

  #[tokio::test]
  async fn test_equality_filters_from_params() {
    let ctx = seeded_context();
    let handler = SimpleQueryHandler::new("items").ignore_params(["_"]);

    let response = handler
      .handle(&ctx, &Request::get("/items?color=red&size=5&_=12345"))
      .unwrap()
      .unwrap();
    assert_eq!(response.json().unwrap(), json!([{"id": 3, "color": "red", "size": 5}]));
    assert!(response.is_cached());
  }

  #[tokio::test]
  async fn test_paging_params_are_not_filters() {
    let ctx = seeded_context();
    let handler = SimpleQueryHandler::new("items").with_paging(true);

    let response = handler
      .handle(&ctx, &Request::get("/items?color=red&limit=1"))
      .unwrap()
      .unwrap();
    // A bare array carries no paging metadata.
    assert_eq!(response.json().unwrap(), json!([{"id": 1, "color": "red", "size": 2}]));
  }

  #[tokio::test]
  async fn test_declines_mutations() {
    let ctx = seeded_context();
    let handler = SimpleQueryHandler::new("items");
    let request = Request::new(Method::Put, "/items/1");
    assert!(handler.handle(&ctx, &request).unwrap().is_none());
  }
}
