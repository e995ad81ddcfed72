//! Measured item sizes with lazily maintained prefix offsets.
//!
//! Every item starts at the estimate. Once the renderer measures an item the
//! real size replaces the estimate for that item's key, so measurements
//! survive removals and re-keying. Offsets are recomputed only from the
//! first dirty index onward; appending to the tail touches only the new
//! items.

use std::hash::Hash;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::range::VisibleRange;

/// Used in place of an estimate that is not a positive, finite size.
pub const MIN_ESTIMATE: f64 = 1.0;

pub struct SizeCache<K> {
    estimate: f64,
    keys: Vec<K>,
    measured: FxHashMap<K, f64>,
    /// `offsets[i]` is the start of item `i`; `offsets[len]` is the extent.
    offsets: Vec<f64>,
    dirty_from: Option<usize>,
}

impl<K: Copy + Eq + Hash> SizeCache<K> {
    /// Create an empty cache. An `estimate` that is zero, negative or not
    /// finite is replaced by [`MIN_ESTIMATE`].
    pub fn new(estimate: f64) -> Self {
        let estimate = if estimate.is_finite() && estimate > 0.0 {
            estimate
        } else {
            log::warn!("Invalid estimated item size {estimate}; using {MIN_ESTIMATE}");
            MIN_ESTIMATE
        };
        Self {
            estimate,
            keys: Vec::new(),
            measured: FxHashMap::default(),
            offsets: vec![0.0],
            dirty_from: None,
        }
    }

    pub fn estimate(&self) -> f64 {
        self.estimate
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Replace the ordered key sequence.
    ///
    /// Offsets stay valid for the common prefix of old and new sequences.
    /// Measurements for keys no longer present are dropped. Returns how many
    /// keys were not in the previous sequence.
    pub fn set_keys(&mut self, keys: Vec<K>) -> usize {
        let common = self
            .keys
            .iter()
            .zip(keys.iter())
            .take_while(|(old, new)| old == new)
            .count();

        let added = if common == self.keys.len() {
            keys.len() - common
        } else {
            let previous: FxHashSet<K> = self.keys.iter().copied().collect();
            keys[common..].iter().filter(|key| !previous.contains(key)).count()
        };

        if common < self.keys.len() {
            let live: FxHashSet<K> = keys.iter().copied().collect();
            self.measured.retain(|key, _| live.contains(key));
        }

        if common != self.keys.len() || common != keys.len() {
            self.mark_dirty(common);
        }
        self.keys = keys;
        added
    }

    /// Record the rendered size of the item at `index`.
    ///
    /// Returns `true` if the size changed.
    pub fn measure(&mut self, index: usize, size: f64) -> bool {
        let Some(&key) = self.keys.get(index) else {
            log::trace!("Ignoring measurement for index {index} beyond {}", self.keys.len());
            return false;
        };
        let size = size.max(0.0);
        if self.size_at(index) == size {
            return false;
        }
        self.measured.insert(key, size);
        self.mark_dirty(index);
        true
    }

    pub fn is_measured(&self, index: usize) -> bool {
        self.keys
            .get(index)
            .is_some_and(|key| self.measured.contains_key(key))
    }

    /// Size of the item at `index` (measured, else estimated).
    pub fn size_at(&self, index: usize) -> f64 {
        self.keys
            .get(index)
            .and_then(|key| self.measured.get(key))
            .copied()
            .unwrap_or(self.estimate)
    }

    /// Start offset of the item at `index` (`index == len` gives the extent).
    pub fn offset_of(&mut self, index: usize) -> f64 {
        self.refresh();
        let last = self.offsets.len() - 1;
        self.offsets[index.min(last)]
    }

    /// Total scrollable extent.
    pub fn total_extent(&mut self) -> f64 {
        self.refresh();
        self.offsets[self.keys.len()]
    }

    /// Index of the item covering `offset`, clamped to the list.
    pub fn index_at(&mut self, offset: f64) -> usize {
        self.refresh();
        if self.keys.is_empty() {
            return 0;
        }
        let items = &self.offsets[..self.keys.len()];
        items.partition_point(|&start| start <= offset).saturating_sub(1)
    }

    /// Range intersecting `[scroll_offset, scroll_offset + viewport]`, using
    /// measured sizes where known, widened by `overscan` on each side.
    pub fn range(&mut self, scroll_offset: f64, viewport: f64, overscan: usize) -> VisibleRange {
        let total_extent = self.total_extent();
        let len = self.keys.len();
        if len == 0 {
            return VisibleRange::EMPTY;
        }

        let top = scroll_offset.max(0.0);
        let bottom = (top + viewport.max(0.0)).min(total_extent);
        let first = self.index_at(top);
        let last = self.offsets[..len]
            .partition_point(|&start| start < bottom)
            .clamp(first + 1, len);

        VisibleRange {
            start: first.saturating_sub(overscan),
            end: (last + overscan).min(len),
            total_extent,
        }
    }

    fn mark_dirty(&mut self, from: usize) {
        self.dirty_from = Some(self.dirty_from.map_or(from, |d| d.min(from)));
    }

    fn refresh(&mut self) {
        let Some(from) = self.dirty_from.take() else {
            return;
        };
        let from = from.min(self.offsets.len() - 1);
        self.offsets.truncate(from + 1);
        for index in from..self.keys.len() {
            let next = self.offsets[index] + self.size_at(index);
            self.offsets.push(next);
        }
    }
}
