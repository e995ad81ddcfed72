//! Typed subscription scopes.
//!
//! A scope is a collection plus at most one equality predicate on a single
//! field. Filters travel over the wire as data and are evaluated with
//! [`CollectionFilter::matches`]; nothing is ever spliced into a query string.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::item::{ChannelId, TimelineItem, UserId};

/// Logical table a subscription observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Collection {
    Messages,
}

/// Field an equality predicate can test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Field {
    ChannelId,
    AuthorId,
}

/// `field = value`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldEq {
    pub field: Field,
    pub value: String,
}

/// Collection + optional equality predicate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CollectionFilter {
    pub collection: Collection,
    pub predicate: Option<FieldEq>,
}

impl CollectionFilter {
    /// Every message.
    pub fn messages() -> Self {
        Self {
            collection: Collection::Messages,
            predicate: None,
        }
    }

    /// Messages of one channel.
    pub fn channel_messages(channel: &ChannelId) -> Self {
        Self {
            collection: Collection::Messages,
            predicate: Some(FieldEq {
                field: Field::ChannelId,
                value: channel.as_str().to_string(),
            }),
        }
    }

    /// Messages written by one author.
    pub fn authored_by(author: &UserId) -> Self {
        Self {
            collection: Collection::Messages,
            predicate: Some(FieldEq {
                field: Field::AuthorId,
                value: author.as_str().to_string(),
            }),
        }
    }

    /// Whether `item` belongs to this scope.
    pub fn matches(&self, item: &TimelineItem) -> bool {
        match &self.predicate {
            None => true,
            Some(FieldEq { field: Field::ChannelId, value }) => item.channel_id.as_str() == value,
            Some(FieldEq { field: Field::AuthorId, value }) => item.author_id.as_str() == value,
        }
    }

    /// The channel this scope is pinned to, if any.
    pub fn channel_scope(&self) -> Option<ChannelId> {
        match &self.predicate {
            Some(FieldEq { field: Field::ChannelId, value }) => Some(ChannelId::new(value.clone())),
            _ => None,
        }
    }
}

impl fmt::Display for CollectionFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let collection = match self.collection {
            Collection::Messages => "messages",
        };
        match &self.predicate {
            None => f.write_str(collection),
            Some(FieldEq { field, value }) => {
                let field = match field {
                    Field::ChannelId => "channel_id",
                    Field::AuthorId => "author_id",
                };
                write!(f, "{collection}[{field}={value:?}]")
            }
        }
    }
}
