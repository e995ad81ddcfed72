//! Server-side message table: the state behind the durable write endpoint.
//!
//! Rows are kept in insertion order with an id index. Soft-deleted rows stay
//! in the table (so a retried create cannot resurrect them) but are hidden
//! from snapshots. With a [`MessageStore`] attached, every mutation is
//! persisted before it is applied in memory.

use chrono::{DateTime, Utc};
use palaver_core::{validate_payload, ChangeEvent, CollectionFilter, ItemId, TimelineItem, UserId};
use rustc_hash::FxHashMap;

use crate::protocol::WriteRequest;
use crate::storage::{MessageStore, StoreConfig, StoreError};
use crate::writer::WriteError;

/// Result of an accepted write.
#[derive(Debug, Clone)]
pub struct WriteOutcome {
    /// Canonical stored row.
    pub row: TimelineItem,
    /// Change to publish; `None` when the write was an idempotent replay.
    pub event: Option<ChangeEvent>,
}

#[derive(Default)]
pub struct MessageTable {
    rows: Vec<TimelineItem>,
    index: FxHashMap<ItemId, usize>,
    store: Option<MessageStore>,
}

impl MessageTable {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Open a RocksDB-backed table, loading the stored rows.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let (store, restored) = MessageStore::open(config)?;
        let mut table = Self::default();
        for row in restored.rows {
            table.upsert(row);
        }
        table.store = Some(store);
        Ok(table)
    }

    /// Number of rows, including soft-deleted ones.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, id: &ItemId) -> Option<&TimelineItem> {
        self.index.get(id).map(|&pos| &self.rows[pos])
    }

    /// Live rows matching `filter`, in insertion order.
    pub fn snapshot(&self, filter: &CollectionFilter) -> Vec<TimelineItem> {
        self.rows
            .iter()
            .filter(|row| !row.is_deleted() && filter.matches(row))
            .cloned()
            .collect()
    }

    pub fn apply(&mut self, request: WriteRequest, now: DateTime<Utc>) -> Result<WriteOutcome, WriteError> {
        match request {
            WriteRequest::Create {
                id,
                payload,
                channel_id,
                author_id,
            } => {
                let payload = validate_payload(&payload).map_err(|e| WriteError::Rejected(e.to_string()))?;
                let id = id.unwrap_or_default();
                if let Some(existing) = self.get(&id) {
                    if existing.author_id != author_id || existing.channel_id != channel_id {
                        return Err(WriteError::Rejected(format!("id {id} is already in use")));
                    }
                    log::debug!("Create for existing id {id}; returning stored row");
                    return Ok(WriteOutcome {
                        row: existing.clone(),
                        event: None,
                    });
                }
                let row = TimelineItem::new(id, payload, channel_id, author_id, now);
                self.commit(row.clone())?;
                Ok(WriteOutcome {
                    event: Some(ChangeEvent::insert(row.clone())),
                    row,
                })
            }
            WriteRequest::Update {
                id,
                author_id,
                payload,
            } => {
                let payload = validate_payload(&payload).map_err(|e| WriteError::Rejected(e.to_string()))?;
                let mut row = self.owned_live_row(&id, &author_id)?;
                row.payload = payload;
                row.updated_at = now;
                self.commit(row.clone())?;
                Ok(WriteOutcome {
                    event: Some(ChangeEvent::update(row.clone())),
                    row,
                })
            }
            WriteRequest::Delete { id, author_id } => {
                let mut row = self.owned_live_row(&id, &author_id)?;
                row.deleted_at = Some(now);
                row.updated_at = now;
                self.commit(row.clone())?;
                Ok(WriteOutcome {
                    event: Some(ChangeEvent::delete(row.clone())),
                    row,
                })
            }
        }
    }

    fn owned_live_row(&self, id: &ItemId, author: &UserId) -> Result<TimelineItem, WriteError> {
        let row = self
            .get(id)
            .filter(|row| !row.is_deleted())
            .ok_or(WriteError::NotFound(*id))?;
        if !row.is_authored_by(author) {
            return Err(WriteError::PermissionDenied);
        }
        Ok(row.clone())
    }

    /// Persist, then apply in memory.
    fn commit(&mut self, row: TimelineItem) -> Result<(), WriteError> {
        if let Some(store) = self.store.as_mut() {
            let persisted = if self.index.contains_key(&row.id) {
                store.update(&row)
            } else {
                store.insert(&row).map(|_| ())
            };
            persisted.map_err(|e| {
                log::error!("Persisting {} failed: {e}", row.id);
                WriteError::Rejected("storage unavailable".into())
            })?;
        }
        self.upsert(row);
        Ok(())
    }

    fn upsert(&mut self, row: TimelineItem) {
        match self.index.get(&row.id) {
            Some(&pos) => self.rows[pos] = row,
            None => {
                self.index.insert(row.id, self.rows.len());
                self.rows.push(row);
            }
        }
    }
}
