//! Binary wire protocol between feed clients and the feed server.
//!
//! Every WebSocket binary message carries exactly one bincode-encoded frame
//! (standard config, serde mode):
//!
//! ```text
//! client ──► server                     server ──► client
//! ─────────────────                     ─────────────────
//! Subscribe { filter }                  Snapshot { rows }
//! Write { request_id, request }         Change(ChangeEvent)
//! Ping                                  WriteOk { request_id, row }
//!                                       WriteFailed { request_id, error }
//!                                       Pong
//! ```
//!
//! A subscription always starts with a `Snapshot` of every live matching
//! row, followed by `Change` frames in commit order. The server may send a
//! fresh `Snapshot` at any time (e.g. after the subscriber lagged); clients
//! reconcile it by identity.

use palaver_core::{ChangeEvent, ChannelId, CollectionFilter, ItemId, TimelineItem, UserId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::writer::WriteError;

/// Mutation sent to the durable write endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteRequest {
    /// Persist a new row. A client-supplied `id` makes retries idempotent.
    Create {
        id: Option<ItemId>,
        payload: String,
        channel_id: ChannelId,
        author_id: UserId,
    },
    /// Replace the text of a row written by `author_id`.
    Update {
        id: ItemId,
        author_id: UserId,
        payload: String,
    },
    /// Soft-delete a row written by `author_id`.
    Delete { id: ItemId, author_id: UserId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientFrame {
    /// Start (or replace) this connection's subscription.
    Subscribe { filter: CollectionFilter },
    Write {
        request_id: Uuid,
        request: WriteRequest,
    },
    Ping,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerFrame {
    Snapshot { rows: Vec<TimelineItem> },
    Change(ChangeEvent),
    WriteOk { request_id: Uuid, row: TimelineItem },
    WriteFailed { request_id: Uuid, error: WriteError },
    Pong,
}

impl ClientFrame {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

impl ServerFrame {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(value)
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
}
