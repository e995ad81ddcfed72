//! Ordered, identity-indexed materialization of a change stream.
//!
//! Positions are arrival order. Updates replace in place, deletes remove,
//! and nothing ever reorders surviving entries. The `index` map gives O(1)
//! identity lookups; it is rebuilt after removals.

use rustc_hash::FxHashMap;

use crate::event::{ChangeEvent, ChangeKind};
use crate::item::{ItemId, TimelineItem};

/// Effect of applying one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// Appended at the tail.
    Inserted,
    /// Replaced an existing entry in place.
    Replaced,
    /// Removed an existing entry.
    Removed,
    /// No change (e.g. delete of an unknown id).
    Ignored,
}

impl Applied {
    pub fn changed(self) -> bool {
        self != Applied::Ignored
    }
}

#[derive(Debug, Clone, Default)]
pub struct MaterializedView {
    items: Vec<TimelineItem>,
    index: FxHashMap<ItemId, usize>,
}

impl MaterializedView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from an initial snapshot (duplicates and deleted rows skipped).
    pub fn from_rows(rows: Vec<TimelineItem>) -> Self {
        let mut view = Self::new();
        view.apply_snapshot(rows);
        view
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[TimelineItem] {
        &self.items
    }

    pub fn to_vec(&self) -> Vec<TimelineItem> {
        self.items.clone()
    }

    pub fn contains(&self, id: &ItemId) -> bool {
        self.index.contains_key(id)
    }

    pub fn get(&self, id: &ItemId) -> Option<&TimelineItem> {
        self.index.get(id).map(|&pos| &self.items[pos])
    }

    pub fn position(&self, id: &ItemId) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Apply one change event.
    ///
    /// Inserts of a known id and updates of a known id replace in place, so
    /// re-delivery is idempotent. An update for an unknown id is treated as
    /// an insert. A row carrying `deleted_at` is applied as a delete whatever
    /// its kind.
    pub fn apply(&mut self, event: &ChangeEvent) -> Applied {
        if event.kind == ChangeKind::Delete || event.row.is_deleted() {
            return self.remove(&event.row.id);
        }

        match self.index.get(&event.row.id) {
            Some(&pos) => {
                self.items[pos] = event.row.clone();
                Applied::Replaced
            }
            None => {
                if event.kind == ChangeKind::Update {
                    log::debug!("Update for unknown row {}; appending", event.row.id);
                }
                self.push(event.row.clone());
                Applied::Inserted
            }
        }
    }

    /// Reconcile against a fresh full snapshot.
    ///
    /// Entries present in both keep their position and take the snapshot's
    /// state. Entries missing from the snapshot are removed. Rows new to the
    /// view are appended in snapshot order. Returns the events describing
    /// the difference, in the order they were applied.
    pub fn apply_snapshot(&mut self, rows: Vec<TimelineItem>) -> Vec<ChangeEvent> {
        let mut incoming: FxHashMap<ItemId, TimelineItem> = FxHashMap::default();
        let mut order: Vec<ItemId> = Vec::with_capacity(rows.len());
        for row in rows {
            if row.is_deleted() || incoming.contains_key(&row.id) {
                continue;
            }
            order.push(row.id);
            incoming.insert(row.id, row);
        }

        let mut events = Vec::new();
        let mut kept = Vec::with_capacity(order.len().max(self.items.len()));
        for existing in self.items.drain(..) {
            match incoming.remove(&existing.id) {
                Some(fresh) => {
                    if fresh != existing {
                        events.push(ChangeEvent::update(fresh.clone()));
                    }
                    kept.push(fresh);
                }
                None => events.push(ChangeEvent::delete(existing)),
            }
        }

        for id in order {
            // Rows matched above were already taken out of `incoming`.
            if let Some(row) = incoming.remove(&id) {
                events.push(ChangeEvent::insert(row.clone()));
                kept.push(row);
            }
        }

        self.items = kept;
        self.reindex();
        events
    }

    fn push(&mut self, row: TimelineItem) {
        self.index.insert(row.id, self.items.len());
        self.items.push(row);
    }

    fn remove(&mut self, id: &ItemId) -> Applied {
        match self.index.remove(id) {
            Some(pos) => {
                self.items.remove(pos);
                for slot in self.index.values_mut() {
                    if *slot > pos {
                        *slot -= 1;
                    }
                }
                Applied::Removed
            }
            None => Applied::Ignored,
        }
    }

    fn reindex(&mut self) {
        self.index.clear();
        for (pos, item) in self.items.iter().enumerate() {
            self.index.insert(item.id, pos);
        }
    }
}
