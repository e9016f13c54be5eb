//! Local persistence for offline support.
//!
//! - Named structured stores holding shredded rows, one per REST resource
//! - The response cache, keyed by request fingerprint
//! - The sync log of requests awaiting replay

mod layer;
pub mod storage;
pub mod traits;

pub use layer::ResponseCache;
pub use storage::SqliteStorage;
pub use traits::{Key, Row, Store, StoreAdapter};
