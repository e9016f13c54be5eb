//! Sync queue: pending mutations recorded for later replay.
//!
//! Entries are appended when a request completes while offline, when a
//! locally synthesized mutation stands in for the server, or when the handler
//! chain fails. Replaying them is left to an external sync manager, which must
//! keep FIFO order per endpoint.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::traits::Key;
use crate::http::codec::SerializedRequest;
use crate::http::endpoint::EndpointKey;

/// What a mutation did to a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreOperation {
  Upsert,
  Remove,
}

/// Pre/post snapshot of one row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UndoRedoEntry {
  pub key: Key,
  /// Value before the mutation, `None` if the row did not exist.
  pub undo: Option<Value>,
  /// Value after the mutation, `None` for removals.
  pub redo: Option<Value>,
}

/// Undo/redo data for one store touched by a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UndoRedoRecord {
  pub store_name: String,
  pub operation: StoreOperation,
  pub undo_redo_data: Vec<UndoRedoEntry>,
}

/// A queued request.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncQueueEntry {
  pub id: i64,
  pub endpoint_key: String,
  pub request: SerializedRequest,
  pub undo_redo_data_array: Option<Vec<UndoRedoRecord>>,
  pub enqueued_at: DateTime<Utc>,
}

/// Durable, append-only log of pending requests.
pub trait SyncQueue: Send + Sync {
  fn insert_request(
    &self,
    request: &SerializedRequest,
    undo_redo: Option<&[UndoRedoRecord]>,
  ) -> Result<()>;

  /// All entries, oldest first.
  fn pending(&self) -> Result<Vec<SyncQueueEntry>>;

  /// Entries for one endpoint, oldest first.
  fn pending_for(&self, endpoint_key: &EndpointKey) -> Result<Vec<SyncQueueEntry>>;

  /// Acknowledge a replayed entry.
  fn remove(&self, id: i64) -> Result<()>;
}
