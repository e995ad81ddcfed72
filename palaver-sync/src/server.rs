//! WebSocket feed server: change subscriptions plus the durable write
//! endpoint, over one connection type.
//!
//! Architecture:
//! ```text
//! Client A ──┐                        ┌── MessageStore (RocksDB)
//!             ├── handle_connection ──┤
//! Client B ──┘        │               └── MessageTable (RwLock)
//!                     │                        │ publish under write lock
//!                     ▼                        ▼
//!              Subscribe{filter}        FeedRouter ── channel groups / firehose
//!                     │                        │
//!                     └──── Snapshot ──► Change, Change, ... ──► Client
//! ```
//!
//! Ordering: writes publish their change while still holding the table
//! write lock, and a subscription registers its receiver and takes its
//! snapshot under the read lock. Every change is therefore either in the
//! snapshot or in the tail, never both and never neither.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use palaver_core::{now_millis, ChangeEvent, CollectionFilter, TimelineItem};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, FeedRouter};
use crate::protocol::{ClientFrame, ServerFrame, WriteRequest};
use crate::storage::{StoreConfig, StoreError};
use crate::store::MessageTable;
use crate::writer::{WriteEndpoint, WriteError};

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Events a subscriber may fall behind before it is re-snapshotted.
    pub broadcast_capacity: usize,
    /// RocksDB directory (None = in-memory only).
    pub data_dir: Option<PathBuf>,
    /// fsync every persisted write.
    pub sync_writes: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            data_dir: None,
            sync_writes: true,
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `PALAVER_BIND`, `PALAVER_DATA_DIR` and
    /// `PALAVER_BROADCAST_CAPACITY`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(bind) = std::env::var("PALAVER_BIND") {
            config.bind_addr = bind;
        }
        if let Ok(path) = std::env::var("PALAVER_DATA_DIR") {
            if !path.is_empty() {
                config.data_dir = Some(PathBuf::from(path));
            }
        }
        if let Ok(capacity) = std::env::var("PALAVER_BROADCAST_CAPACITY") {
            match capacity.parse::<usize>() {
                Ok(n) if n > 0 => config.broadcast_capacity = n,
                _ => log::warn!(
                    "Ignoring invalid PALAVER_BROADCAST_CAPACITY={capacity:?}; using {}",
                    config.broadcast_capacity
                ),
            }
        }
        config
    }
}

#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub active_subscriptions: usize,
    pub writes_accepted: u64,
    pub writes_rejected: u64,
    /// Snapshots re-sent because a subscriber lagged.
    pub resnapshots: u64,
}

/// State shared by the accept loop and every connection task.
#[derive(Clone)]
struct Shared {
    table: Arc<RwLock<MessageTable>>,
    router: Arc<FeedRouter>,
    stats: Arc<RwLock<ServerStats>>,
    /// Bumped to drop every open connection (listener stays up).
    disconnect: Arc<watch::Sender<u64>>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Shared {
    async fn write(&self, request: WriteRequest) -> Result<TimelineItem, WriteError> {
        let result = {
            let mut table = self.table.write().await;
            match table.apply(request, now_millis()) {
                Ok(outcome) => {
                    if let Some(event) = outcome.event {
                        self.router.publish(Arc::new(event)).await;
                    }
                    Ok(outcome.row)
                }
                Err(e) => Err(e),
            }
        };

        let mut stats = self.stats.write().await;
        match &result {
            Ok(_) => stats.writes_accepted += 1,
            Err(_) => stats.writes_rejected += 1,
        }
        result
    }
}

pub struct FeedServer {
    config: ServerConfig,
    shared: Shared,
}

impl FeedServer {
    /// Create a server, loading stored messages if a data dir is configured.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let table = match &config.data_dir {
            Some(path) => {
                let store_config = StoreConfig {
                    sync_writes: config.sync_writes,
                    ..StoreConfig::new(path)
                };
                MessageTable::open(store_config)?
            }
            None => MessageTable::in_memory(),
        };
        Ok(Self::with_table(config, table))
    }

    /// In-memory server; `data_dir` is ignored.
    pub fn in_memory(config: ServerConfig) -> Self {
        Self::with_table(config, MessageTable::in_memory())
    }

    fn with_table(config: ServerConfig, table: MessageTable) -> Self {
        let (disconnect, _) = watch::channel(0);
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Shared {
                table: Arc::new(RwLock::new(table)),
                router: Arc::new(FeedRouter::new(config.broadcast_capacity)),
                stats: Arc::new(RwLock::new(ServerStats::default())),
                disconnect: Arc::new(disconnect),
                shutdown: Arc::new(shutdown),
            },
            config,
        }
    }

    /// Bind `config.bind_addr` and serve until [`shutdown`](Self::shutdown).
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        log::info!("Feed server listening on {}", listener.local_addr()?);
        let mut shutdown_rx = self.shared.shutdown.subscribe();
        if *shutdown_rx.borrow_and_update() {
            return Ok(());
        }

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    log::debug!("New TCP connection from {addr}");
                    let shared = self.shared.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, addr, shared).await {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        log::info!("Feed server shutting down");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Stop accepting and close every connection.
    pub fn shutdown(&self) {
        self.shared.shutdown.send_replace(true);
    }

    /// Close every open connection but keep accepting new ones.
    pub fn disconnect_all(&self) {
        self.shared.disconnect.send_modify(|generation| *generation += 1);
    }

    /// Apply a write in-process, publishing its change to subscribers.
    pub async fn write(&self, request: WriteRequest) -> Result<TimelineItem, WriteError> {
        self.shared.write(request).await
    }

    /// Live rows matching `filter`.
    pub async fn snapshot(&self, filter: &CollectionFilter) -> Vec<TimelineItem> {
        self.shared.table.read().await.snapshot(filter)
    }

    pub async fn stats(&self) -> ServerStats {
        self.shared.stats.read().await.clone()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

#[async_trait]
impl WriteEndpoint for FeedServer {
    async fn write(&self, request: WriteRequest) -> Result<TimelineItem, WriteError> {
        self.shared.write(request).await
    }
}

struct Subscription {
    filter: CollectionFilter,
    group: Arc<BroadcastGroup>,
    rx: broadcast::Receiver<Arc<ChangeEvent>>,
}

/// Register a receiver and snapshot under the table read lock.
async fn subscribe(shared: &Shared, connection_id: Uuid, filter: CollectionFilter) -> (Subscription, Vec<TimelineItem>) {
    let group = shared.router.group_for(&filter).await;
    let table = shared.table.read().await;
    let rx = group.add_subscriber(connection_id, filter.clone()).await;
    let rows = table.snapshot(&filter);
    drop(table);
    (Subscription { filter, group, rx }, rows)
}

async fn unsubscribe(shared: &Shared, connection_id: &Uuid, subscription: Subscription) {
    subscription.group.remove_subscriber(connection_id).await;
    if let Some(channel) = subscription.filter.channel_scope() {
        if shared.router.remove_if_empty(&channel).await {
            log::debug!("Channel group {channel} removed (empty)");
        }
    }
    shared.stats.write().await.active_subscriptions -= 1;
}

async fn send_frame(ws_sender: &mut WsSink, frame: &ServerFrame) -> Result<(), BoxError> {
    let encoded = frame.encode()?;
    ws_sender.send(Message::Binary(encoded.into())).await?;
    Ok(())
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, shared: Shared) -> Result<(), BoxError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let connection_id = Uuid::new_v4();
    log::info!("WebSocket connection {connection_id} established from {addr}");

    {
        let mut s = shared.stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    let mut disconnect_rx = shared.disconnect.subscribe();
    let mut shutdown_rx = shared.shutdown.subscribe();
    let mut subscription: Option<Subscription> = None;

    let result: Result<(), BoxError> = async {
        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            {
                                let mut s = shared.stats.write().await;
                                s.total_frames += 1;
                                s.total_bytes += data.len() as u64;
                            }
                            let frame = match ClientFrame::decode(&data) {
                                Ok(frame) => frame,
                                Err(e) => {
                                    log::warn!("Failed to decode frame from {addr}: {e}");
                                    continue;
                                }
                            };
                            match frame {
                                ClientFrame::Subscribe { filter } => {
                                    if let Some(previous) = subscription.take() {
                                        unsubscribe(&shared, &connection_id, previous).await;
                                    }
                                    log::debug!("Connection {connection_id} subscribed to {filter}");
                                    let (fresh, rows) = subscribe(&shared, connection_id, filter).await;
                                    shared.stats.write().await.active_subscriptions += 1;
                                    subscription = Some(fresh);
                                    send_frame(&mut ws_sender, &ServerFrame::Snapshot { rows }).await?;
                                }
                                ClientFrame::Write { request_id, request } => {
                                    let reply = match shared.write(request).await {
                                        Ok(row) => ServerFrame::WriteOk { request_id, row },
                                        Err(error) => {
                                            log::debug!("Write {request_id} from {addr} failed: {error}");
                                            ServerFrame::WriteFailed { request_id, error }
                                        }
                                    };
                                    send_frame(&mut ws_sender, &reply).await?;
                                }
                                ClientFrame::Ping => {
                                    send_frame(&mut ws_sender, &ServerFrame::Pong).await?;
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            return Ok(());
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            return Ok(());
                        }
                        _ => {}
                    }
                }

                event = async {
                    match subscription.as_mut() {
                        Some(sub) => sub.rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    match event {
                        Ok(event) => {
                            let wanted = subscription
                                .as_ref()
                                .is_some_and(|sub| sub.filter.matches(&event.row));
                            if wanted {
                                send_frame(&mut ws_sender, &ServerFrame::Change((*event).clone())).await?;
                            }
                        }
                        Err(RecvError::Lagged(n)) => {
                            // The tail has a gap; replace it with a fresh snapshot.
                            log::warn!("Connection {connection_id} lagged by {n} events; re-snapshotting");
                            if let Some(previous) = subscription.take() {
                                previous.group.record_lag(n);
                                let filter = previous.filter.clone();
                                unsubscribe(&shared, &connection_id, previous).await;
                                let (fresh, rows) = subscribe(&shared, connection_id, filter).await;
                                {
                                    let mut s = shared.stats.write().await;
                                    s.active_subscriptions += 1;
                                    s.resnapshots += 1;
                                }
                                subscription = Some(fresh);
                                send_frame(&mut ws_sender, &ServerFrame::Snapshot { rows }).await?;
                            }
                        }
                        Err(RecvError::Closed) => return Ok(()),
                    }
                }

                _ = disconnect_rx.changed() => {
                    log::info!("Dropping connection {connection_id} from {addr}");
                    let _ = ws_sender.send(Message::Close(None)).await;
                    return Ok(());
                }

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        let _ = ws_sender.send(Message::Close(None)).await;
                        return Ok(());
                    }
                }
            }
        }
    }
    .await;

    if let Some(sub) = subscription.take() {
        unsubscribe(&shared, &connection_id, sub).await;
    }
    shared.stats.write().await.active_connections -= 1;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use palaver_core::ItemId;

    fn create(text: &str, channel: &str, author: &str) -> WriteRequest {
        WriteRequest::Create {
            id: Some(ItemId::new()),
            payload: text.into(),
            channel_id: channel.into(),
            author_id: author.into(),
        }
    }

    #[test]
    fn test_config_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.broadcast_capacity, 256);
        assert!(config.data_dir.is_none());
        assert!(config.sync_writes);
    }

    #[tokio::test]
    async fn test_in_process_write_publishes() {
        let server = FeedServer::in_memory(ServerConfig::default());
        let group = server
            .shared
            .router
            .group_for(&CollectionFilter::channel_messages(&"C1".into()))
            .await;
        let mut rx = group
            .add_subscriber(Uuid::new_v4(), CollectionFilter::channel_messages(&"C1".into()))
            .await;

        let row = server.write(create("hello", "C1", "u1")).await.unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.row, row);

        let stats = server.stats().await;
        assert_eq!(stats.writes_accepted, 1);
        assert_eq!(stats.writes_rejected, 0);
    }

    #[tokio::test]
    async fn test_rejected_write_is_counted() {
        let server = FeedServer::in_memory(ServerConfig::default());
        let err = server.write(create("  ", "C1", "u1")).await.unwrap_err();
        assert!(matches!(err, WriteError::Rejected(_)));
        assert_eq!(server.stats().await.writes_rejected, 1);
    }

    #[tokio::test]
    async fn test_snapshot_then_tail_has_no_gap() {
        let server = Arc::new(FeedServer::in_memory(ServerConfig::default()));
        let filter = CollectionFilter::channel_messages(&"C1".into());

        let writer = {
            let server = server.clone();
            tokio::spawn(async move {
                for i in 0..200 {
                    server.write(create(&format!("m{i}"), "C1", "u1")).await.unwrap();
                }
            })
        };

        tokio::task::yield_now().await;
        let (mut sub, rows) = subscribe(&server.shared, Uuid::new_v4(), filter).await;
        writer.await.unwrap();

        let mut seen: Vec<_> = rows.into_iter().map(|r| r.id).collect();
        while let Ok(event) = sub.rx.try_recv() {
            assert!(!seen.contains(&event.row.id), "change duplicated snapshot row");
            seen.push(event.row.id);
        }
        assert_eq!(seen.len(), 200);
    }
}
