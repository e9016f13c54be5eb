//! Cache-Control handling for GET/HEAD responses.
//!
//! A response runs through an ordered list of header stages. Stages may set
//! expiration metadata, revalidate a cached response against the server, or
//! answer with a synthesized 412/504; whatever survives the list is written to
//! the response cache. The order is data: later stages read what earlier ones
//! recorded, and max-age wins over Expires because it runs after it.

use chrono::{DateTime, Duration, Utc};
use color_eyre::Result;
use futures::future::BoxFuture;
use futures::FutureExt;

use crate::http::{format_http_date, parse_http_date, Headers, Request, Response, CACHE_EXPIRATION_HEADER};
use crate::proxy::RequestContext;

/// Post-processes a successful GET/HEAD response.
pub trait CacheStrategy: Send + Sync {
  fn apply<'a>(
    &'a self,
    ctx: &'a RequestContext,
    request: &'a Request,
    response: Response,
  ) -> BoxFuture<'a, Result<Response>>;
}

/// One header handler of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
  Expires,
  MaxAge,
  ConditionalMatch,
  MustRevalidate,
  NoCache,
  NoStore,
}

pub const DEFAULT_STAGES: [Stage; 6] = [
  Stage::Expires,
  Stage::MaxAge,
  Stage::ConditionalMatch,
  Stage::MustRevalidate,
  Stage::NoCache,
  Stage::NoStore,
];

/// Whether the pipeline goes on to the next stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StageOutcome {
  Continue,
  /// Stop here; nothing is persisted.
  Finish,
}

/// Result of running the pipeline over one response.
#[derive(Debug, Clone)]
pub struct CacheEvaluation {
  pub response: Response,
  /// Expiration metadata; mirrored into the marker header of cached responses.
  pub expiration: Option<DateTime<Utc>>,
  /// A server round trip already happened for this evaluation.
  pub revalidated: bool,
  /// The response was written to the response cache.
  pub persisted: bool,
}

impl CacheEvaluation {
  fn new(response: Response) -> Self {
    Self {
      expiration: response.cache_expiration(),
      response,
      revalidated: false,
      persisted: false,
    }
  }

  fn set_expiration(&mut self, expiration: DateTime<Utc>) {
    self.expiration = Some(expiration);
    if self.response.is_cached() {
      self
        .response
        .headers
        .set(CACHE_EXPIRATION_HEADER, format_http_date(expiration));
    }
  }
}

/// HTTP caching header semantics (Expires, max-age, conditionals,
/// must-revalidate, no-cache, no-store).
#[derive(Debug, Clone)]
pub struct HttpCacheHeaderStrategy {
  stages: Vec<Stage>,
}

impl Default for HttpCacheHeaderStrategy {
  fn default() -> Self {
    Self {
      stages: DEFAULT_STAGES.to_vec(),
    }
  }
}

impl HttpCacheHeaderStrategy {
  /// A pipeline with a custom stage list. Persistence always runs last.
  pub fn with_stages(stages: Vec<Stage>) -> Self {
    Self { stages }
  }

  pub fn stages(&self) -> &[Stage] {
    &self.stages
  }

  pub async fn evaluate(
    &self,
    ctx: &RequestContext,
    request: &Request,
    response: Response,
  ) -> Result<CacheEvaluation> {
    let mut eval = CacheEvaluation::new(response);

    for stage in &self.stages {
      let outcome = match stage {
        Stage::Expires => {
          apply_expires(&mut eval);
          StageOutcome::Continue
        }
        Stage::MaxAge => {
          apply_max_age(request, &mut eval);
          StageOutcome::Continue
        }
        Stage::ConditionalMatch => conditional_match(ctx, request, &mut eval).await?,
        Stage::MustRevalidate => must_revalidate(ctx, request, &mut eval).await?,
        Stage::NoCache => no_cache(ctx, request, &mut eval).await?,
        Stage::NoStore => no_store(&mut eval),
      };
      if outcome == StageOutcome::Finish {
        tracing::debug!(url = %request.url, ?stage, status = eval.response.status, "cache pipeline finished early");
        return Ok(eval);
      }
    }

    persist(ctx, request, &mut eval)?;
    Ok(eval)
  }
}

impl CacheStrategy for HttpCacheHeaderStrategy {
  fn apply<'a>(
    &'a self,
    ctx: &'a RequestContext,
    request: &'a Request,
    response: Response,
  ) -> BoxFuture<'a, Result<Response>> {
    async move { Ok(self.evaluate(ctx, request, response).await?.response) }.boxed()
  }
}

/// Value of a Cache-Control directive: `Some("")` for a bare flag.
pub fn cache_control_directive<'a>(headers: &'a Headers, directive: &str) -> Option<&'a str> {
  headers.get("cache-control")?.split(',').find_map(|part| {
    let part = part.trim();
    let (name, value) = match part.split_once('=') {
      Some((name, value)) => (name.trim(), value.trim().trim_matches('"')),
      None => (part, ""),
    };
    name.eq_ignore_ascii_case(directive).then_some(value)
  })
}

/// Expiration a fresh response would get from its own headers.
pub fn header_expiration(request: &Request, response: &Response) -> Option<DateTime<Utc>> {
  max_age_expiration(request, response).or_else(|| response.headers.get("expires").and_then(parse_http_date))
}

/// Largest delta-seconds honored; bigger values are clamped to it (RFC 9111 §1.2.2).
const MAX_DELTA_SECONDS: u64 = 2_147_483_648;

fn max_age_expiration(request: &Request, response: &Response) -> Option<DateTime<Utc>> {
  let seconds = delta_seconds(cache_control_directive(&response.headers, "max-age")?)?;
  let requested_at = request
    .headers
    .get("date")
    .and_then(parse_http_date)
    .unwrap_or_else(Utc::now);
  requested_at.checked_add_signed(Duration::try_seconds(seconds)?)
}

/// Non-negative integer seconds, clamped; anything else is ignored.
fn delta_seconds(value: &str) -> Option<i64> {
  if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
    return None;
  }
  let seconds = value.parse::<u64>().unwrap_or(u64::MAX).min(MAX_DELTA_SECONDS);
  i64::try_from(seconds).ok()
}

fn apply_expires(eval: &mut CacheEvaluation) {
  if eval.expiration.is_some() {
    return;
  }
  if let Some(expires) = eval.response.headers.get("expires").and_then(parse_http_date) {
    eval.set_expiration(expires);
  }
}

fn apply_max_age(request: &Request, eval: &mut CacheEvaluation) {
  if let Some(expiration) = max_age_expiration(request, &eval.response) {
    eval.set_expiration(expiration);
  }
}

async fn conditional_match(
  ctx: &RequestContext,
  request: &Request,
  eval: &mut CacheEvaluation,
) -> Result<StageOutcome> {
  let if_match = request.headers.get("if-match");
  let if_none_match = request.headers.get("if-none-match");
  if (if_match.is_none() && if_none_match.is_none()) || !eval.response.is_cached() {
    return Ok(StageOutcome::Continue);
  }

  if ctx.services.connectivity.is_online() {
    return revalidate(ctx, request, eval, false).await;
  }

  let etag = eval.response.headers.get("etag").unwrap_or_default();
  let failure = match (if_match, if_none_match) {
    (Some(wanted), _) if !etag.contains(wanted) => {
      Some("If-Match failed due to no matching ETag while offline")
    }
    (_, Some(unwanted)) if etag.contains(unwanted) => {
      Some("If-None-Match failed due to matching ETag while offline")
    }
    _ => None,
  };

  match failure {
    Some(reason) => {
      tracing::info!(url = %request.url, etag, "{}", reason);
      eval.response = eval.response.clone().with_status(412, reason);
      Ok(StageOutcome::Finish)
    }
    None => Ok(StageOutcome::Continue),
  }
}

async fn must_revalidate(
  ctx: &RequestContext,
  request: &Request,
  eval: &mut CacheEvaluation,
) -> Result<StageOutcome> {
  if cache_control_directive(&eval.response.headers, "must-revalidate").is_none() {
    return Ok(StageOutcome::Continue);
  }
  match eval.expiration {
    Some(expiration) if Utc::now() > expiration => revalidate(ctx, request, eval, true).await,
    _ => Ok(StageOutcome::Continue),
  }
}

async fn no_cache(
  ctx: &RequestContext,
  request: &Request,
  eval: &mut CacheEvaluation,
) -> Result<StageOutcome> {
  let pragma = request
    .headers
    .get("pragma")
    .is_some_and(|p| p.trim().eq_ignore_ascii_case("no-cache"));
  if cache_control_directive(&eval.response.headers, "no-cache").is_some() || pragma {
    revalidate(ctx, request, eval, false).await
  } else {
    Ok(StageOutcome::Continue)
  }
}

fn no_store(eval: &mut CacheEvaluation) -> StageOutcome {
  if cache_control_directive(&eval.response.headers, "no-store").is_none() {
    return StageOutcome::Continue;
  }
  eval.expiration = None;
  if eval.response.is_cached() {
    eval.response.headers.set(CACHE_EXPIRATION_HEADER, "");
  }
  StageOutcome::Finish
}

/// Check a cached response with the server, at most once per evaluation.
///
/// Offline (or unreachable) the stale response stands, unless `strict`, in
/// which case the answer is a 504.
async fn revalidate(
  ctx: &RequestContext,
  request: &Request,
  eval: &mut CacheEvaluation,
  strict: bool,
) -> Result<StageOutcome> {
  if eval.revalidated || !eval.response.is_cached() {
    return Ok(StageOutcome::Continue);
  }

  let fetched = if ctx.services.connectivity.is_online() {
    match ctx.services.transport.fetch(request.clone()).await {
      Ok(response) => Some(response),
      // An unreachable server counts as offline: stale stands unless strict
      Err(e) => {
        tracing::warn!(url = %request.url, "Revalidation fetch failed: {}", e);
        None
      }
    }
  } else {
    None
  };

  let Some(server_response) = fetched else {
    if strict {
      eval.response = eval.response.clone().with_status(
        504,
        "cache-control: must-revalidate failed due to application being offline",
      );
      return Ok(StageOutcome::Finish);
    }
    tracing::debug!(url = %request.url, "serving stale response, cannot revalidate");
    return Ok(StageOutcome::Continue);
  };

  eval.revalidated = true;
  if server_response.status == 304 {
    tracing::debug!(url = %request.url, "revalidated: not modified");
    return Ok(StageOutcome::Continue);
  }

  tracing::debug!(url = %request.url, status = server_response.status, "revalidated: replacing cached response");
  ctx.services.cache.delete(request)?;
  eval.expiration = header_expiration(request, &server_response);
  eval.response = server_response;
  Ok(StageOutcome::Continue)
}

/// Write the response to the cache; cached responses are never written back.
fn persist(ctx: &RequestContext, request: &Request, eval: &mut CacheEvaluation) -> Result<()> {
  if !eval.response.ok() || eval.response.is_cached() || !request.method.is_read() {
    return Ok(());
  }
  ctx.services.cache.put(
    request,
    &eval.response,
    eval.expiration,
    ctx.options.json_processor.as_ref(),
  )?;
  eval.persisted = true;
  Ok(())
}
