//! # palaver-sync: Real-time timeline sync for Palaver
//!
//! Live, filtered subscriptions over WebSocket, plus optimistic writes that
//! reconcile against them.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────┐   Subscribe / Snapshot   ┌──────────────┐
//! │ ChangeStreamClient   │ ◄──────── Change ──────── │ FeedServer   │
//! │  └─ LiveView         │                           │  ├─ Message- │
//! └──────────┬───────────┘                           │  │  Table    │
//!            │ base view                             │  ├─ Message- │
//!            │                                       │  │  Store    │
//!            ▼                                       │  └─ Feed-    │
//! ┌──────────────────────┐   Write / WriteOk         │     Router   │
//! │ OptimisticReconciler │ ────── RemoteWriter ────► │              │
//! │  └─ pending ledger   │                           └──────────────┘
//! └──────────────────────┘
//!            │ materialized_overlay()
//!            ▼
//!      palaver-timeline
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: bincode-encoded client/server frames
//! - [`live`]: client-side materialized view, event watches, status
//! - [`client`]: subscription task with reconnect and re-snapshot
//! - [`writer`]: `WriteEndpoint` seam and the WebSocket write client
//! - [`reconciler`]: pending ledger and optimistic overlay
//! - [`broadcast`]: per-channel change fan-out on the server
//! - [`store`]: server message table (author-scoped, soft delete)
//! - [`storage`]: RocksDB persistence for the message table
//! - [`server`]: WebSocket feed server

pub mod broadcast;
pub mod client;
pub mod live;
pub mod protocol;
pub mod reconciler;
pub mod server;
pub mod storage;
pub mod store;
pub mod writer;

pub use broadcast::{BroadcastGroup, BroadcastStats, FeedRouter};
pub use client::{ChangeStreamClient, ClientConfig, SubscriptionHandle};
pub use live::{match_id, ConnectionState, EventWatch, LiveView, StreamError};
pub use protocol::{ClientFrame, ProtocolError, ServerFrame, WriteRequest};
pub use reconciler::{
    EntryState, Notice, OptimisticReconciler, PendingEntry, ReconcileError, ReconcilerConfig,
};
pub use server::{FeedServer, ServerConfig, ServerStats};
pub use storage::{MessageStore, Restored, StoreConfig, StoreError};
pub use store::{MessageTable, WriteOutcome};
pub use writer::{RemoteWriter, WriteEndpoint, WriteError};
