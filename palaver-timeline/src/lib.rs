//! # palaver-timeline: Windowed rendering for unbounded timelines
//!
//! Renders only the rows near the viewport of an append-mostly list and
//! decides when new arrivals should pull the viewport to the tail.
//!
//! - [`range`]: pure visible-range and auto-follow arithmetic
//! - [`sizes`]: per-row measured sizes with prefix offsets
//! - [`virtualizer`]: scroll state machine with measure-then-scroll ordering

pub mod range;
pub mod sizes;
pub mod virtualizer;

pub use range::{
    compute_visible_range, compute_visible_range_with_overscan, should_auto_follow,
    VisibleRange, DEFAULT_OVERSCAN,
};
pub use sizes::{SizeCache, MIN_ESTIMATE};
pub use virtualizer::{ScrollCommand, Virtualizer, VirtualizerConfig};
