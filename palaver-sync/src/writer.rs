//! Durable write endpoint: the trait seam and its WebSocket client.
//!
//! `RemoteWriter` multiplexes concurrent requests over one connection,
//! correlating replies by request id:
//!
//! ```text
//!   write() ──► pending[request_id] = oneshot ──► outgoing mpsc ──► writer task ──► ws
//!                        ▲                                                          │
//!                        └──────────── reader task (WriteOk / WriteFailed) ◄────────┘
//! ```
//!
//! A request that outlives `request_timeout` resolves with
//! [`WriteError::Timeout`]; a late reply for it is discarded.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use palaver_core::{ItemId, TimelineItem};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use uuid::Uuid;

use crate::protocol::{ClientFrame, ServerFrame, WriteRequest};

/// Why a durable write did not take effect.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteError {
    #[error("write rejected: {0}")]
    Rejected(String),
    #[error("permission denied")]
    PermissionDenied,
    #[error("item {0} not found")]
    NotFound(ItemId),
    #[error("write timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
}

/// The collaborator that persists mutations.
///
/// `Ok` carries the canonical stored row.
#[async_trait]
pub trait WriteEndpoint: Send + Sync {
    async fn write(&self, request: WriteRequest) -> Result<TimelineItem, WriteError>;
}

type PendingReplies = Arc<Mutex<HashMap<Uuid, oneshot::Sender<Result<TimelineItem, WriteError>>>>>;

pub struct RemoteWriter {
    outgoing: mpsc::Sender<Vec<u8>>,
    pending: PendingReplies,
    request_timeout: Duration,
}

impl RemoteWriter {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

    /// Connect to the feed server's write endpoint.
    pub async fn connect(server_url: &str, request_timeout: Duration) -> Result<Self, WriteError> {
        let (ws_stream, _) = connect_async(server_url)
            .await
            .map_err(|e| WriteError::Transport(e.to_string()))?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("Write client connected to {server_url}");

        let (outgoing, mut outgoing_rx) = mpsc::channel::<Vec<u8>>(256);
        let pending: PendingReplies = Arc::new(Mutex::new(HashMap::new()));

        tokio::spawn(async move {
            while let Some(data) = outgoing_rx.recv().await {
                if ws_sender.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_sender.close().await;
        });

        let replies = pending.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_receiver.next().await {
                let data = match msg {
                    Ok(Message::Binary(data)) => data,
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                let (request_id, result) = match ServerFrame::decode(&data) {
                    Ok(ServerFrame::WriteOk { request_id, row }) => (request_id, Ok(row)),
                    Ok(ServerFrame::WriteFailed { request_id, error }) => (request_id, Err(error)),
                    Ok(_) => continue,
                    Err(e) => {
                        log::warn!("Dropping malformed reply: {e}");
                        continue;
                    }
                };
                match replies.lock().await.remove(&request_id) {
                    Some(reply) => {
                        let _ = reply.send(result);
                    }
                    None => log::debug!("Reply for unknown or expired request {request_id}"),
                }
            }

            // Connection gone: fail whatever is still in flight.
            let mut replies = replies.lock().await;
            for (_, reply) in replies.drain() {
                let _ = reply.send(Err(WriteError::Transport("connection closed".into())));
            }
            log::info!("Write client disconnected");
        });

        Ok(Self {
            outgoing,
            pending,
            request_timeout,
        })
    }

    pub async fn in_flight(&self) -> usize {
        self.pending.lock().await.len()
    }
}

#[async_trait]
impl WriteEndpoint for RemoteWriter {
    async fn write(&self, request: WriteRequest) -> Result<TimelineItem, WriteError> {
        let request_id = Uuid::new_v4();
        let frame = ClientFrame::Write {
            request_id,
            request,
        };
        let data = frame
            .encode()
            .map_err(|e| WriteError::Transport(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id, tx);

        if self.outgoing.send(data).await.is_err() {
            self.pending.lock().await.remove(&request_id);
            return Err(WriteError::Transport("connection closed".into()));
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(WriteError::Transport("connection closed".into())),
            Err(_) => {
                self.pending.lock().await.remove(&request_id);
                log::warn!("Write request {request_id} timed out after {:?}", self.request_timeout);
                Err(WriteError::Timeout)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(WriteError::PermissionDenied.to_string(), "permission denied");
        assert_eq!(
            WriteError::Rejected("payload is empty".into()).to_string(),
            "write rejected: payload is empty"
        );
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Port 1 on loopback is never listening in the test environment.
        let result = RemoteWriter::connect("ws://127.0.0.1:1", RemoteWriter::DEFAULT_TIMEOUT).await;
        assert!(matches!(result, Err(WriteError::Transport(_))));
    }
}
