//! Timeline items and the identifiers that scope them.
//!
//! Item ids are ULIDs: 48 bits of millisecond timestamp followed by 80 bits
//! of randomness, so they sort lexicographically in creation order and can be
//! minted on the client before the server has seen the row.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Wall-clock time truncated to milliseconds (the wire precision).
pub fn now_millis() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// Unique, sortable identity of a timeline item.
///
/// Stable across the optimistic → confirmed transition: the client mints it,
/// sends it with the write, and the server echoes it back on the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(Ulid);

impl ItemId {
    /// Fresh random id (not monotonic; prefer [`IdGenerator`] for bursts).
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    pub fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    pub fn as_ulid(&self) -> Ulid {
        self.0
    }

    /// Big-endian bytes; byte order matches id order.
    pub fn to_bytes(&self) -> [u8; 16] {
        self.0.to_bytes()
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Ulid::from_bytes(bytes))
    }
}

impl Default for ItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ItemId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(s).map(Self)
    }
}

/// Monotonic id source.
///
/// Two ids generated within the same millisecond still compare in
/// generation order, so a rapid burst of submissions never collides.
pub struct IdGenerator {
    inner: ulid::Generator,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self {
            inner: ulid::Generator::new(),
        }
    }

    /// Next id in the sequence.
    ///
    /// The random component only overflows after 2^80 ids in one
    /// millisecond; in that case a fresh random ULID is returned instead.
    pub fn next_id(&mut self) -> ItemId {
        match self.inner.generate() {
            Ok(ulid) => ItemId(ulid),
            Err(e) => {
                log::warn!("Monotonic id generator overflowed ({e}); falling back to random id");
                ItemId::new()
            }
        }
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Identity of the parent collection (a channel).
    ChannelId
);

string_id!(
    /// Identity of an author. Opaque; issued by the auth layer.
    UserId
);

/// A single entry of a timeline (a chat message).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineItem {
    pub id: ItemId,
    /// Text content.
    pub payload: String,
    pub channel_id: ChannelId,
    pub author_id: UserId,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
    /// Soft-delete marker.
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl TimelineItem {
    /// Build a live (not deleted) item stamped with `at` for both timestamps.
    pub fn new(
        id: ItemId,
        payload: impl Into<String>,
        channel_id: ChannelId,
        author_id: UserId,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            payload: payload.into(),
            channel_id,
            author_id,
            created_at: at,
            updated_at: at,
            deleted_at: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn is_authored_by(&self, user: &UserId) -> bool {
        &self.author_id == user
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_bytes_sort_like_ids() {
        let mut ids = IdGenerator::new();
        let (a, b) = (ids.next_id(), ids.next_id());
        assert!(a.to_bytes() < b.to_bytes());
        assert_eq!(ItemId::from_bytes(b.to_bytes()), b);
    }

    #[test]
    fn test_generator_is_monotonic() {
        let mut ids = IdGenerator::new();
        let mut previous = ids.next_id();
        for _ in 0..10_000 {
            let next = ids.next_id();
            assert!(next > previous, "{next} should sort after {previous}");
            previous = next;
        }
    }

    #[test]
    fn test_item_id_parse_display() {
        let id = ItemId::new();
        let parsed: ItemId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-ulid".parse::<ItemId>().is_err());
    }

    #[test]
    fn test_string_ids() {
        let channel = ChannelId::from("C1");
        assert_eq!(channel.as_str(), "C1");
        assert_eq!(channel.to_string(), "C1");
        assert_eq!(UserId::new(String::from("u")), UserId::from("u"));
    }

    #[test]
    fn test_now_millis_has_no_sub_millisecond_part() {
        let now = now_millis();
        assert_eq!(now.timestamp_subsec_nanos() % 1_000_000, 0);
    }

    #[test]
    fn test_new_item_is_live() {
        let at = now_millis();
        let item = TimelineItem::new(ItemId::new(), "hi", "C1".into(), "u1".into(), at);
        assert!(!item.is_deleted());
        assert_eq!(item.created_at, item.updated_at);
        assert!(item.is_authored_by(&UserId::from("u1")));
        assert!(!item.is_authored_by(&UserId::from("u2")));
    }
}
