//! Response cache that keeps shredded payloads in sync with the structured store.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use std::sync::Arc;

use super::traits::{CachedEntry, ResponseStore, ShreddedIndex, StoreAdapter};
use crate::http::codec::{SerializedRequest, SerializedResponse};
use crate::http::endpoint::EndpointKey;
use crate::http::{format_http_date, Request, Response, CACHE_EXPIRATION_HEADER, RESOURCE_TYPE_HEADER};
use crate::shred::{JsonProcessor, ShreddedRecordSet};

/// Cache of GET/HEAD responses keyed by request fingerprint.
///
/// When a `JsonProcessor` is supplied, `put` also shreds the payload into the
/// resource's store and `match_request` rebuilds the body from the store, so
/// local mutations made since the response was cached show up in it.
#[derive(Clone)]
pub struct ResponseCache {
  responses: Arc<dyn ResponseStore>,
  stores: Arc<dyn StoreAdapter>,
}

impl ResponseCache {
  pub fn new(responses: Arc<dyn ResponseStore>, stores: Arc<dyn StoreAdapter>) -> Self {
    Self { responses, stores }
  }

  fn lookup(&self, request: &Request, ignore_search: bool) -> Result<Option<CachedEntry>> {
    if ignore_search {
      self
        .responses
        .find_entry_by_base(request.method, request.url_without_search())
    } else {
      self
        .responses
        .get_entry(EndpointKey::for_request(request).as_str())
    }
  }

  /// The cached response for `request`, marked with the cache header.
  ///
  /// With `ignore_search` the query string is not part of the match and the
  /// most recently cached entry for the same base URL wins.
  pub fn match_request(
    &self,
    request: &Request,
    ignore_search: bool,
    processor: Option<&JsonProcessor>,
  ) -> Result<Option<Response>> {
    let Some(entry) = self.lookup(request, ignore_search)? else {
      tracing::debug!(method = %request.method, url = %request.url, "cache miss");
      return Ok(None);
    };
    tracing::debug!(method = %request.method, url = %request.url, "cache hit");

    let response = entry.response.into_response()?;
    match (processor, entry.shredded) {
      (Some(processor), Some(indexes)) => self.unshred(processor, &indexes, response).map(Some),
      _ => Ok(Some(response)),
    }
  }

  pub fn has_match(&self, request: &Request, ignore_search: bool) -> Result<bool> {
    Ok(self.lookup(request, ignore_search)?.is_some())
  }

  /// Store `response` for `request`, recording `expiration` in the marker header.
  pub fn put(
    &self,
    request: &Request,
    response: &Response,
    expiration: Option<DateTime<Utc>>,
    processor: Option<&JsonProcessor>,
  ) -> Result<()> {
    let mut stored = response.clone();
    let mut shredded = None;

    if let Some(processor) = processor {
      let sets = processor.shredder.shred(response);
      for set in &sets {
        let rows = set.rows();
        if !rows.is_empty() {
          self.stores.open_store(&set.name)?.upsert_all(&rows)?;
        }
      }
      if let Some(first) = sets.first() {
        stored.headers.set(RESOURCE_TYPE_HEADER, first.resource_type.as_str());
      }
      shredded = Some(sets.iter().map(ShreddedRecordSet::index).collect());
    }

    stored.headers.set(
      CACHE_EXPIRATION_HEADER,
      expiration.map(format_http_date).unwrap_or_default(),
    );

    let entry = CachedEntry {
      request: SerializedRequest::from(request),
      response: SerializedResponse::from(&stored),
      shredded,
      cached_at: Utc::now(),
    };

    tracing::debug!(method = %request.method, url = %request.url, ?expiration, "caching response");
    self.responses.put_entry(
      EndpointKey::for_request(request).as_str(),
      request.url_without_search(),
      &entry,
    )
  }

  /// Drop the cached response for `request`; shredded rows are left alone.
  pub fn delete(&self, request: &Request) -> Result<bool> {
    self
      .responses
      .delete_entry(EndpointKey::for_request(request).as_str())
  }

  fn unshred(
    &self,
    processor: &JsonProcessor,
    indexes: &[ShreddedIndex],
    response: Response,
  ) -> Result<Response> {
    // Nothing was shredded (empty or malformed body); serve what was stored.
    if indexes.iter().all(|index| index.keys.is_empty()) {
      return Ok(response);
    }

    let marker = response
      .headers
      .get(CACHE_EXPIRATION_HEADER)
      .unwrap_or_default()
      .to_string();

    let mut sets = Vec::with_capacity(indexes.len());
    for index in indexes {
      let store = self.stores.open_store(&index.name)?;
      let mut keys = Vec::new();
      let mut data = Vec::new();
      for key in &index.keys {
        if let Some(value) = store.find_by_key(key)? {
          keys.push(key.clone());
          data.push(value);
        }
      }
      sets.push(ShreddedRecordSet {
        name: index.name.clone(),
        resource_identifier: index.resource_identifier.clone(),
        keys,
        data,
        resource_type: index.resource_type,
      });
    }

    let mut rebuilt = processor.unshredder.unshred(&sets, response)?;
    rebuilt.headers.set(CACHE_EXPIRATION_HEADER, marker);
    Ok(rebuilt)
  }
}
