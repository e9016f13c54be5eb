//! Answering GET requests from shredded rows.
//!
//! A query handler turns a request's query string into a [`Filter`], runs it
//! against the resource's store and renders the rows through the resource's
//! unshredder, using the cached collection response as the template.

pub mod filter;
pub mod oracle_rest;
pub mod simple;

use color_eyre::Result;
use serde_json::Value;

use crate::cache::traits::{Key, Row};
use crate::http::{Request, Response, RESOURCE_TYPE_HEADER};
use crate::proxy::RequestContext;
use crate::shred::{JsonProcessor, ResourceType, ShreddedRecordSet};
use filter::Filter;

pub use oracle_rest::OracleRestQueryHandler;
pub use simple::SimpleQueryHandler;

/// Serves a request from the structured store, or declines with `Ok(None)`
/// so the caller falls through to the response cache and the network.
pub trait QueryHandler: Send + Sync {
  fn handle(&self, ctx: &RequestContext, request: &Request) -> Result<Option<Response>>;
}

/// Offset/limit window over a result set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Paging {
  pub offset: Option<usize>,
  pub limit: Option<usize>,
}

impl Paging {
  /// Read `offset` and `limit` from query parameters; malformed values are ignored.
  pub fn from_params(params: &[(String, String)]) -> Self {
    let read = |name: &str| {
      params
        .iter()
        .find(|(key, _)| key == name)
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
    };
    Self {
      offset: read("offset"),
      limit: read("limit"),
    }
  }

  fn is_paging_param(name: &str) -> bool {
    name == "offset" || name == "limit"
  }
}

/// One page of rows plus what is needed to describe it.
struct Page {
  rows: Vec<Row>,
  total: usize,
  has_more: bool,
}

impl Page {
  fn slice(rows: Vec<Row>, paging: Paging) -> Self {
    let total = rows.len();
    let offset = paging.offset.unwrap_or(0).min(total);
    let rows: Vec<Row> = rows
      .into_iter()
      .skip(offset)
      .take(paging.limit.filter(|l| *l > 0).unwrap_or(usize::MAX))
      .collect();
    let has_more = offset + rows.len() < total;
    Self {
      rows,
      total,
      has_more,
    }
  }
}

/// Shared resolution used by the built-in handlers.
///
/// If the request's URL (query string ignored) has a cached collection, the
/// filter runs over the store; a cached single row is re-rendered as is.
/// Otherwise the trailing path segment is taken as a row id and the row is
/// rendered into the cached collection response one level up.
pub fn process_query(
  ctx: &RequestContext,
  request: &Request,
  store_name: &str,
  filter: &Filter,
  paging: Paging,
) -> Result<Option<Response>> {
  let Some(processor) = ctx.options.json_processor.as_ref() else {
    return Ok(None);
  };
  let cache = &ctx.services.cache;
  let store = ctx.services.stores.open_store(store_name)?;

  if let Some(cached) = cache.match_request(request, true, Some(processor))? {
    let is_single = cached.headers.get(RESOURCE_TYPE_HEADER) == Some(ResourceType::Single.as_str());
    let page = if is_single {
      None
    } else {
      Some(Page::slice(store.find(filter)?, paging))
    };
    tracing::debug!(url = %request.url, store = store_name, single = is_single, "query served from store");
    return render_page(processor, store_name, cached, page, paging).map(Some);
  }

  let Some(id) = request.url_id() else {
    return Ok(None);
  };
  let key = processor.url_key(id);
  let Some(row) = store.find_by_key(&key)? else {
    return Ok(None);
  };
  let Some(collection_url) = request.collection_url() else {
    return Ok(None);
  };

  let collection_request = Request {
    url: collection_url,
    ..request.clone()
  };
  let Some(template) = cache.match_request(&collection_request, true, None)? else {
    tracing::debug!(url = %request.url, "row found but no cached collection to render it");
    return Ok(None);
  };

  tracing::debug!(url = %request.url, store = store_name, id, "single row served from store");
  let set = ShreddedRecordSet {
    name: store_name.to_string(),
    resource_identifier: None,
    keys: vec![key],
    data: vec![row],
    resource_type: ResourceType::Single,
  };
  processor.unshredder.unshred(&[set], template).map(Some)
}

fn render_page(
  processor: &JsonProcessor,
  store_name: &str,
  cached: Response,
  page: Option<Page>,
  paging: Paging,
) -> Result<Response> {
  let shredded = processor.shredder.shred(&cached);
  let resource_type = shredded
    .first()
    .map(|set| set.resource_type)
    .unwrap_or(ResourceType::Collection);

  let (keys, data, total, has_more) = match page {
    Some(page) => {
      let (keys, data): (Vec<Key>, Vec<Value>) =
        page.rows.into_iter().map(|row| (row.key, row.value)).unzip();
      (keys, data, page.total, page.has_more)
    }
    None => {
      let set = shredded.into_iter().next();
      let (keys, data) = set.map(|s| (s.keys, s.data)).unwrap_or_default();
      let total = data.len();
      (keys, data, total, false)
    }
  };

  let set = ShreddedRecordSet {
    name: store_name.to_string(),
    resource_identifier: None,
    keys,
    data,
    resource_type,
  };
  let mut response = processor.unshredder.unshred(&[set], cached)?;

  // Paging metadata only fits payloads that wrap their rows in `items`.
  if let Ok(Value::Object(mut body)) = response.json() {
    if body.contains_key("items") {
      if let Some(limit) = paging.limit {
        body.insert("limit".to_string(), limit.into());
      }
      if let Some(offset) = paging.offset {
        body.insert("offset".to_string(), offset.into());
      }
      body.insert("hasMore".to_string(), has_more.into());
      body.insert("totalResults".to_string(), total.into());
      response.body = Value::Object(body).to_string().into_bytes();
    }
  }
  Ok(response)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::proxy::testing::{context_with, ScriptedTransport};
  use crate::proxy::ProxyOptions;
  use crate::shred::IdAttribute;
  use serde_json::json;

  #[test]
  fn test_paging_window() {
    let rows: Vec<Row> = (0..10)
      .map(|i| Row {
        key: Key::Scalar(json!(i)),
        value: json!({"id": i}),
      })
      .collect();

    let page = Page::slice(
      rows.clone(),
      Paging {
        offset: Some(2),
        limit: Some(3),
      },
    );
    let ids: Vec<_> = page.rows.iter().map(|r| r.value["id"].clone()).collect();
    assert_eq!(ids, vec![json!(2), json!(3), json!(4)]);
    assert!(page.has_more);
    assert_eq!(page.total, 10);

    let tail = Page::slice(
      rows,
      Paging {
        offset: Some(8),
        limit: Some(5),
      },
    );
    assert_eq!(tail.rows.len(), 2);
    assert!(!tail.has_more);
  }

  #[test]
  fn test_paging_params() {
    let params = vec![
      ("limit".to_string(), "3".to_string()),
      ("offset".to_string(), "x".to_string()),
    ];
    assert_eq!(
      Paging::from_params(&params),
      Paging {
        offset: None,
        limit: Some(3)
      }
    );
  }

  #[tokio::test]
  async fn test_single_row_rendered_into_cached_collection() {
    let processor = JsonProcessor::simple("items", IdAttribute::from("id"));
    let ctx = context_with(
      ScriptedTransport::unreachable(),
      ProxyOptions::default().with_json_processor(processor.clone()),
    );

    let collection = Request::get("/items");
    let response = Response::new(200, "OK").with_body(r#"[{"id":1,"name":"a"},{"id":2,"name":"b"}]"#);
    ctx
      .services
      .cache
      .put(&collection, &response, None, Some(&processor))
      .unwrap();

    let rendered = process_query(&ctx, &Request::get("/items/2"), "items", &Filter::All, Paging::default())
      .unwrap()
      .unwrap();
    assert_eq!(rendered.json().unwrap(), json!({"id": 2, "name": "b"}));
    assert!(rendered.is_cached());

    let missing = process_query(&ctx, &Request::get("/items/9"), "items", &Filter::All, Paging::default()).unwrap();
    assert!(missing.is_none());
  }
}
