//! Visible-range arithmetic for a uniformly estimated list.

/// Items rendered beyond each edge of the viewport.
pub const DEFAULT_OVERSCAN: usize = 5;

/// Contiguous index range `[start, end)` to render, plus the scrollable
/// extent used to size the scroll bar.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VisibleRange {
    pub start: usize,
    pub end: usize,
    pub total_extent: f64,
}

impl VisibleRange {
    pub const EMPTY: Self = Self {
        start: 0,
        end: 0,
        total_extent: 0.0,
    };

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, index: usize) -> bool {
        index >= self.start && index < self.end
    }
}

/// Indices intersecting `[scroll_offset, scroll_offset + viewport]`, widened
/// by [`DEFAULT_OVERSCAN`] on each side, assuming every item is
/// `estimated_item_size` tall.
pub fn compute_visible_range(
    len: usize,
    scroll_offset: f64,
    viewport: f64,
    estimated_item_size: f64,
) -> VisibleRange {
    compute_visible_range_with_overscan(
        len,
        scroll_offset,
        viewport,
        estimated_item_size,
        DEFAULT_OVERSCAN,
    )
}

/// [`compute_visible_range`] with an explicit overscan.
pub fn compute_visible_range_with_overscan(
    len: usize,
    scroll_offset: f64,
    viewport: f64,
    estimated_item_size: f64,
    overscan: usize,
) -> VisibleRange {
    if len == 0 || estimated_item_size <= 0.0 {
        return VisibleRange::EMPTY;
    }

    let total_extent = len as f64 * estimated_item_size;
    let top = scroll_offset.max(0.0);
    let bottom = (top + viewport.max(0.0)).min(total_extent);

    let first = ((top / estimated_item_size).floor() as usize).min(len - 1);
    let last = ((bottom / estimated_item_size).ceil() as usize).clamp(first + 1, len);

    VisibleRange {
        start: first.saturating_sub(overscan),
        end: (last + overscan).min(len),
        total_extent,
    }
}

/// Whether the viewport is close enough to the tail that new arrivals should
/// scroll it.
pub fn should_auto_follow(scroll_offset: f64, viewport: f64, total_extent: f64, threshold: f64) -> bool {
    scroll_offset + viewport >= total_extent - threshold
}
