//! # palaver-core: Data model for Palaver timelines
//!
//! Shared by the sync layer and the windowed renderer:
//!
//! - [`item`]: `TimelineItem`, ULID item ids, channel/user ids
//! - [`filter`]: typed subscription scopes (collection + equality predicate)
//! - [`event`]: row-level change events and kind sets
//! - [`view`]: ordered materialized view with identity de-duplication
//! - [`validate`]: payload rules checked before submission

pub mod event;
pub mod filter;
pub mod item;
pub mod validate;
pub mod view;

pub use event::{ChangeEvent, ChangeKind, EventKinds};
pub use filter::{Collection, CollectionFilter, Field, FieldEq};
pub use item::{now_millis, ChannelId, IdGenerator, ItemId, TimelineItem, UserId};
pub use validate::{validate_payload, ValidationError, MAX_PAYLOAD_CHARS};
pub use view::{Applied, MaterializedView};
