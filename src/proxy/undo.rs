//! Mirroring mutation responses into the structured store.

use color_eyre::Result;

use super::RequestContext;
use crate::cache::traits::{Key, Store};
use crate::http::{Method, Request, Response};
use crate::shred::{JsonProcessor, ShreddedRecordSet};
use crate::sync::{StoreOperation, UndoRedoEntry, UndoRedoRecord};

/// Shred a non-GET response and apply it to the store: DELETE removes the
/// rows, anything else upserts them. Returns the undo/redo data, computed
/// from the rows as they were before the change, or `None` when nothing
/// changed or no `JsonProcessor` is configured.
pub fn update_shredded_store(
  ctx: &RequestContext,
  request: &Request,
  response: &Response,
) -> Result<Option<Vec<UndoRedoRecord>>> {
  let Some(processor) = ctx.options.json_processor.as_ref() else {
    return Ok(None);
  };

  let mut records = Vec::new();
  for set in processor.shredder.shred(response) {
    let store = ctx.services.stores.open_store(&set.name)?;
    let record = if request.method == Method::Delete {
      remove_rows(store.as_ref(), processor, request, &set)?
    } else {
      upsert_rows(store.as_ref(), &set)?
    };
    records.extend(record);
  }

  tracing::debug!(
    endpoint = %ctx.endpoint_key,
    method = %request.method,
    stores = records.len(),
    "shredded store updated"
  );
  Ok((!records.is_empty()).then_some(records))
}

fn upsert_rows(store: &dyn Store, set: &ShreddedRecordSet) -> Result<Option<UndoRedoRecord>> {
  let rows = set.rows();
  let mut entries = Vec::with_capacity(rows.len());
  for row in &rows {
    entries.push(UndoRedoEntry {
      key: row.key.clone(),
      undo: store.find_by_key(&row.key)?,
      redo: Some(row.value.clone()),
    });
  }
  store.upsert_all(&rows)?;

  Ok(record(store, StoreOperation::Upsert, entries))
}

/// A DELETE response often has no body; the URL id names the row then.
fn remove_rows(
  store: &dyn Store,
  processor: &JsonProcessor,
  request: &Request,
  set: &ShreddedRecordSet,
) -> Result<Option<UndoRedoRecord>> {
  let mut keys: Vec<Key> = set.rows().into_iter().map(|row| row.key).collect();
  if keys.is_empty() {
    keys.extend(request.url_id().map(|id| processor.url_key(id)));
  }

  let mut entries = Vec::with_capacity(keys.len());
  for key in keys {
    let undo = store.find_by_key(&key)?;
    store.remove_by_key(&key)?;
    entries.push(UndoRedoEntry {
      key,
      undo,
      redo: None,
    });
  }

  Ok(record(store, StoreOperation::Remove, entries))
}

fn record(
  store: &dyn Store,
  operation: StoreOperation,
  entries: Vec<UndoRedoEntry>,
) -> Option<UndoRedoRecord> {
  (!entries.is_empty()).then(|| UndoRedoRecord {
    store_name: store.name().to_string(),
    operation,
    undo_redo_data: entries,
  })
}
