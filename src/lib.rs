//! Offline-capable HTTP response caching.
//!
//! [`proxy::ResponseProxy`] sits between an application and the network. GET
//! and HEAD responses are cached and shredded into local stores so they can
//! be served (and queried) while offline; mutations are answered locally
//! when the server cannot be reached and recorded in a sync queue for replay.

pub mod cache;
pub mod config;
pub mod connectivity;
pub mod http;
pub mod logging;
pub mod proxy;
pub mod query;
pub mod refresh;
pub mod shred;
pub mod strategy;
pub mod sync;
