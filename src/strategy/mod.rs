//! Pluggable policies applied by the proxy to GET/HEAD traffic.

pub mod cache;
pub mod fetch;

pub use cache::{CacheEvaluation, CacheStrategy, HttpCacheHeaderStrategy, Stage};
pub use fetch::{
  BackgroundFetch, CacheFirstStrategy, CacheIfOfflineStrategy, FetchStrategy, ServerResponseCallback,
};
