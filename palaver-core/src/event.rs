//! Row-level change events.

use std::ops::BitOr;

use serde::{Deserialize, Serialize};

use crate::item::{ItemId, TimelineItem};

/// What happened to a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ChangeKind {
    Insert = 1,
    Update = 2,
    Delete = 3,
}

impl ChangeKind {
    fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

/// A change to one row, carrying the row's full current state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub row: TimelineItem,
}

impl ChangeEvent {
    pub fn insert(row: TimelineItem) -> Self {
        Self { kind: ChangeKind::Insert, row }
    }

    pub fn update(row: TimelineItem) -> Self {
        Self { kind: ChangeKind::Update, row }
    }

    pub fn delete(row: TimelineItem) -> Self {
        Self { kind: ChangeKind::Delete, row }
    }

    pub fn id(&self) -> ItemId {
        self.row.id
    }
}

/// Set of [`ChangeKind`]s, used to narrow event waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventKinds(u8);

impl EventKinds {
    pub const INSERT: Self = Self(1 << ChangeKind::Insert as u8);
    pub const UPDATE: Self = Self(1 << ChangeKind::Update as u8);
    pub const DELETE: Self = Self(1 << ChangeKind::Delete as u8);
    pub const ALL: Self = Self(Self::INSERT.0 | Self::UPDATE.0 | Self::DELETE.0);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn contains(self, kind: ChangeKind) -> bool {
        self.0 & kind.bit() != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl From<ChangeKind> for EventKinds {
    fn from(kind: ChangeKind) -> Self {
        Self(kind.bit())
    }
}

impl BitOr for EventKinds {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl FromIterator<ChangeKind> for EventKinds {
    fn from_iter<I: IntoIterator<Item = ChangeKind>>(iter: I) -> Self {
        iter.into_iter()
            .fold(Self::empty(), |acc, kind| acc | Self::from(kind))
    }
}
