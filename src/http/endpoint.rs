//! Endpoint fingerprints and the in-flight registration table.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{Method, Request};

/// Deterministic fingerprint of a request's method and normalized URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointKey(String);

impl EndpointKey {
  pub fn for_request(request: &Request) -> Self {
    Self::new(request.method, &request.url)
  }

  pub fn new(method: Method, url: &str) -> Self {
    let input = format!("{}:{}", method.as_str(), normalize_url(url));

    // SHA256 hash for stable, fixed-length keys
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    Self(hex::encode(hasher.finalize()))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for EndpointKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Absolute URLs go through the `url` parser (lowercased host, default port
/// dropped, fragment removed); relative ones are only trimmed.
fn normalize_url(raw: &str) -> String {
  let raw = raw.trim();
  match url::Url::parse(raw) {
    Ok(mut parsed) => {
      parsed.set_fragment(None);
      parsed.to_string()
    }
    Err(_) => raw.split('#').next().unwrap_or_default().to_string(),
  }
}

/// Table of endpoint keys with a `process_request` call in progress.
///
/// Per-call options travel in the request context, so two concurrent calls
/// for one fingerprint no longer interfere; overlaps are still logged because
/// sync replay assumes per-endpoint ordering.
#[derive(Debug, Clone, Default)]
pub struct InFlight {
  entries: Arc<Mutex<HashMap<EndpointKey, usize>>>,
}

impl InFlight {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a call; the registration is released when the guard drops.
  pub fn register(&self, key: &EndpointKey) -> InFlightGuard {
    let mut entries = self.lock();
    let count = entries.entry(key.clone()).or_insert(0);
    if *count > 0 {
      tracing::warn!(
        endpoint = %key,
        in_flight = *count,
        "concurrent request for an endpoint that is already in flight"
      );
    }
    *count += 1;

    InFlightGuard {
      registry: self.clone(),
      key: key.clone(),
    }
  }

  /// Number of calls currently registered for `key`.
  pub fn count(&self, key: &EndpointKey) -> usize {
    self.lock().get(key).copied().unwrap_or(0)
  }

  pub fn is_empty(&self) -> bool {
    self.lock().is_empty()
  }

  fn release(&self, key: &EndpointKey) {
    let mut entries = self.lock();
    if let Some(count) = entries.get_mut(key) {
      *count -= 1;
      if *count == 0 {
        entries.remove(key);
      }
    }
  }

  fn lock(&self) -> MutexGuard<'_, HashMap<EndpointKey, usize>> {
    // Counts stay consistent even if a holder panicked.
    self.entries.lock().unwrap_or_else(|e| e.into_inner())
  }
}

/// Releases an endpoint registration on every exit path.
#[derive(Debug)]
pub struct InFlightGuard {
  registry: InFlight,
  key: EndpointKey,
}

impl Drop for InFlightGuard {
  fn drop(&mut self) {
    self.registry.release(&self.key);
  }
}
