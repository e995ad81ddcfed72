//! Scroll state for a growing timeline: visible window, auto-follow, and
//! deferred scroll-to-tail.
//!
//! Frame protocol:
//!
//! ```text
//!  set_items(keys)          new overlay arrived (may schedule a follow)
//!       │
//!       ▼
//!  visible_range()          which rows to render
//!       │
//!       ▼
//!  measure(i, size) × N     sizes of the rows just rendered
//!       │
//!       ▼
//!  finish_measurement()     releases Some(ScrollCommand) if following
//! ```
//!
//! The scroll command is only released after measurement so that the target
//! offset is computed from real sizes, not stale estimates.

use std::hash::Hash;

use crate::range::{should_auto_follow, VisibleRange, DEFAULT_OVERSCAN};
use crate::sizes::SizeCache;

#[derive(Debug, Clone)]
pub struct VirtualizerConfig {
    /// Size assumed for rows not yet measured.
    pub estimated_item_size: f64,
    /// Rows rendered beyond each viewport edge.
    pub overscan: usize,
    /// Distance from the tail still considered "at the bottom".
    pub follow_threshold: f64,
}

impl Default for VirtualizerConfig {
    fn default() -> Self {
        Self {
            estimated_item_size: 64.0,
            overscan: DEFAULT_OVERSCAN,
            follow_threshold: 32.0,
        }
    }
}

/// Instruction for the host view to scroll.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrollCommand {
    /// Row to bring into view (aligned to the viewport bottom).
    pub index: usize,
    /// Scroll offset that achieves it.
    pub offset: f64,
}

pub struct Virtualizer<K> {
    config: VirtualizerConfig,
    sizes: SizeCache<K>,
    scroll_offset: f64,
    viewport: f64,
    following: bool,
    follow_pending: bool,
}

impl<K: Copy + Eq + Hash> Virtualizer<K> {
    /// A fresh virtualizer starts following: an empty list is at its tail.
    pub fn new(config: VirtualizerConfig, viewport: f64) -> Self {
        Self {
            sizes: SizeCache::new(config.estimated_item_size),
            config,
            scroll_offset: 0.0,
            viewport: viewport.max(0.0),
            following: true,
            follow_pending: false,
        }
    }

    pub fn with_defaults(viewport: f64) -> Self {
        Self::new(VirtualizerConfig::default(), viewport)
    }

    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }

    pub fn scroll_offset(&self) -> f64 {
        self.scroll_offset
    }

    pub fn viewport(&self) -> f64 {
        self.viewport
    }

    pub fn is_following(&self) -> bool {
        self.following
    }

    /// Whether a scroll-to-tail is waiting for the next measurement pass.
    pub fn has_pending_follow(&self) -> bool {
        self.follow_pending
    }

    pub fn total_extent(&mut self) -> f64 {
        self.sizes.total_extent()
    }

    /// Replace the rendered sequence (one key per row, in order).
    ///
    /// If rows were added while following, a scroll to the last row is
    /// scheduled for the next [`finish_measurement`](Self::finish_measurement).
    /// Removals alone never schedule one. The scroll offset itself never
    /// changes here.
    pub fn set_items(&mut self, keys: Vec<K>) {
        let added = self.sizes.set_keys(keys);
        if added > 0 && self.following {
            self.follow_pending = true;
        }
    }

    /// Viewport resized; keeps the tail pinned while following.
    pub fn set_viewport(&mut self, viewport: f64) {
        self.viewport = viewport.max(0.0);
        if self.following && !self.sizes.is_empty() {
            self.follow_pending = true;
        }
    }

    /// Rows to render for the current scroll position.
    pub fn visible_range(&mut self) -> VisibleRange {
        self.sizes
            .range(self.scroll_offset, self.viewport, self.config.overscan)
    }

    /// Record the rendered size of row `index`.
    pub fn measure(&mut self, index: usize, size: f64) {
        self.sizes.measure(index, size);
    }

    /// End of the measurement pass. Returns the deferred scroll-to-tail, if
    /// one is pending, computed from the refreshed sizes.
    pub fn finish_measurement(&mut self) -> Option<ScrollCommand> {
        if !self.follow_pending {
            return None;
        }
        self.follow_pending = false;

        let len = self.sizes.len();
        if len == 0 {
            return None;
        }
        let offset = (self.sizes.total_extent() - self.viewport).max(0.0);
        self.scroll_offset = offset;
        log::trace!("Following tail: scroll to row {} at {offset}", len - 1);
        Some(ScrollCommand {
            index: len - 1,
            offset,
        })
    }

    /// The user (or host) scrolled. Re-evaluates whether to follow the tail.
    pub fn on_scroll(&mut self, offset: f64) {
        self.scroll_offset = offset.max(0.0);
        let total = self.sizes.total_extent();
        self.following = should_auto_follow(
            self.scroll_offset,
            self.viewport,
            total,
            self.config.follow_threshold,
        );
        if !self.following {
            self.follow_pending = false;
        }
    }

    /// "Jump to latest": resume following and scroll on the next pass.
    pub fn scroll_to_end(&mut self) {
        self.following = true;
        self.follow_pending = !self.sizes.is_empty();
    }
}

impl Virtualizer<usize> {
    /// Index-keyed rows: `0..n`.
    pub fn set_len(&mut self, n: usize) {
        self.set_items((0..n).collect());
    }
}
