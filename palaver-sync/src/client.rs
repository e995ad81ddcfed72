//! Change stream client: a live, filtered subscription to the feed server.
//!
//! ```text
//!  subscribe(filter)
//!      │ connect, Subscribe{filter}, wait for Snapshot, apply
//!      ▼
//!  SubscriptionHandle ──► LiveView (materialized view, events, status)
//!      │                        ▲
//!      │  background task ──────┘ Change → apply_event
//!      │      │                   Snapshot → apply_snapshot
//!      │      └─ on drop: Reconnecting → backoff → resubscribe → re-snapshot
//!      ▼
//!  close(): status = Closed, task exits, socket closed
//! ```
//!
//! A re-snapshot is reconciled by identity against the current view, so
//! rows that survived the outage are neither duplicated nor reordered.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use palaver_core::{ChangeEvent, CollectionFilter, EventKinds, TimelineItem};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::live::{ConnectionState, EventWatch, LiveView, StreamError};
use crate::protocol::{ClientFrame, ServerFrame};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_url: String,
    /// Bound on connecting and on waiting for the first snapshot.
    pub connect_timeout: Duration,
    /// Interval between application-level pings.
    pub heartbeat_interval: Duration,
    /// First reconnect delay; doubled on every failed attempt.
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    /// Consecutive failed reconnects before the subscription fails.
    pub max_reconnect_attempts: u32,
    /// Applied events buffered per watcher before it lags.
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9090".to_string(),
            connect_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(15),
            reconnect_base_delay: Duration::from_millis(250),
            reconnect_max_delay: Duration::from_secs(10),
            max_reconnect_attempts: 10,
            event_capacity: 1024,
        }
    }
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Self::default()
        }
    }

    /// Delay before reconnect `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.reconnect_base_delay
            .saturating_mul(factor)
            .min(self.reconnect_max_delay)
    }
}

pub struct ChangeStreamClient {
    config: ClientConfig,
}

impl ChangeStreamClient {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Open a subscription. Resolves once the initial snapshot is applied.
    pub async fn subscribe(&self, filter: CollectionFilter) -> Result<SubscriptionHandle, StreamError> {
        let live = Arc::new(LiveView::new(filter, self.config.event_capacity));
        let (socket, rows) = open_feed(&self.config, live.filter()).await?;

        let count = live.apply_snapshot(rows).await;
        live.set_status(ConnectionState::Connected);
        log::info!(
            "Subscribed to {} at {} ({count} rows)",
            live.filter(),
            self.config.server_url
        );

        let task = tokio::spawn(run_subscription(self.config.clone(), live.clone(), socket));
        Ok(SubscriptionHandle {
            live,
            task: Some(task),
        })
    }
}

/// Owner of one live subscription. Dropping it closes the subscription.
pub struct SubscriptionHandle {
    live: Arc<LiveView>,
    task: Option<JoinHandle<()>>,
}

impl SubscriptionHandle {
    pub fn filter(&self) -> &CollectionFilter {
        self.live.filter()
    }

    /// Snapshot of the materialized view.
    pub async fn current_state(&self) -> Vec<TimelineItem> {
        self.live.current_state().await
    }

    /// Register a wait for a future event; see [`LiveView::watch`].
    pub fn watch(
        &self,
        kinds: EventKinds,
        predicate: impl Fn(&TimelineItem) -> bool + Send + Sync + 'static,
    ) -> EventWatch {
        self.live.watch(kinds, predicate)
    }

    pub async fn await_event(
        &self,
        kinds: EventKinds,
        predicate: impl Fn(&TimelineItem) -> bool + Send + Sync + 'static,
    ) -> Result<ChangeEvent, StreamError> {
        self.live.await_event(kinds, predicate).await
    }

    pub fn status(&self) -> ConnectionState {
        self.live.status()
    }

    /// Shared read side of the view (e.g. for a reconciler).
    pub fn live(&self) -> Arc<LiveView> {
        self.live.clone()
    }

    /// Stop applying events, resolve outstanding watches with `Closed`, and
    /// wait for the connection to be released.
    pub async fn close(mut self) {
        self.live.close();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::warn!("Subscription task for {} ended abnormally: {e}", self.live.filter());
            }
        }
        log::info!("Subscription to {} closed", self.live.filter());
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.live.close();
    }
}

enum Pump {
    /// Closed by the owner.
    Closed,
    /// Connection lost.
    Dropped,
}

/// Connect, subscribe and wait for the snapshot.
async fn open_feed(config: &ClientConfig, filter: &CollectionFilter) -> Result<(Socket, Vec<TimelineItem>), StreamError> {
    let (mut socket, _) = tokio::time::timeout(config.connect_timeout, connect_async(config.server_url.as_str()))
        .await
        .map_err(|_| StreamError::Connect("connect timed out".into()))?
        .map_err(|e| StreamError::Connect(e.to_string()))?;

    let subscribe = ClientFrame::Subscribe {
        filter: filter.clone(),
    }
    .encode()?;
    socket
        .send(Message::Binary(subscribe.into()))
        .await
        .map_err(|e| StreamError::Connect(e.to_string()))?;

    let rows = tokio::time::timeout(config.connect_timeout, await_snapshot(&mut socket))
        .await
        .map_err(|_| StreamError::Connect("no snapshot received".into()))??;
    Ok((socket, rows))
}

async fn await_snapshot(socket: &mut Socket) -> Result<Vec<TimelineItem>, StreamError> {
    while let Some(msg) = socket.next().await {
        match msg {
            Ok(Message::Binary(data)) => match ServerFrame::decode(&data) {
                Ok(ServerFrame::Snapshot { rows }) => return Ok(rows),
                Ok(_) => log::debug!("Ignoring frame received before snapshot"),
                Err(e) => log::warn!("Dropping malformed frame: {e}"),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => return Err(StreamError::Connect(e.to_string())),
        }
    }
    Err(StreamError::Connect("connection closed before snapshot".into()))
}

async fn run_subscription(config: ClientConfig, live: Arc<LiveView>, mut socket: Socket) {
    let mut status = live.status_receiver();
    loop {
        match pump(&config, &live, &mut socket, &mut status).await {
            Pump::Closed => {
                let _ = socket.close(None).await;
                return;
            }
            Pump::Dropped => {
                log::warn!("Feed connection for {} dropped", live.filter());
            }
        }

        live.set_status(ConnectionState::Reconnecting);
        status.borrow_and_update();
        match reconnect(&config, &live, &mut status).await {
            Some(fresh) => socket = fresh,
            None => return,
        }
    }
}

/// Apply frames until the connection drops or the owner closes.
async fn pump(
    config: &ClientConfig,
    live: &LiveView,
    socket: &mut Socket,
    status: &mut watch::Receiver<ConnectionState>,
) -> Pump {
    let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
    heartbeat.tick().await;

    loop {
        if live.status().is_terminal() {
            return Pump::Closed;
        }

        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    return Pump::Closed;
                }
            }

            msg = socket.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => match ServerFrame::decode(&data) {
                        Ok(ServerFrame::Change(event)) => {
                            let applied = live.apply_event(event).await;
                            log::trace!("Applied change to {}: {applied:?}", live.filter());
                        }
                        Ok(ServerFrame::Snapshot { rows }) => {
                            let changes = live.apply_snapshot(rows).await;
                            log::debug!("Server re-snapshot of {} reconciled {changes} changes", live.filter());
                        }
                        Ok(ServerFrame::Pong) => log::trace!("Pong"),
                        Ok(_) => log::debug!("Ignoring write reply on feed connection"),
                        Err(e) => log::warn!("Dropping malformed frame: {e}"),
                    },
                    Some(Ok(Message::Close(_))) | None => return Pump::Dropped,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::warn!("Feed connection error: {e}");
                        return Pump::Dropped;
                    }
                }
            }

            _ = heartbeat.tick() => {
                match ClientFrame::Ping.encode() {
                    Ok(ping) => {
                        if socket.send(Message::Binary(ping.into())).await.is_err() {
                            return Pump::Dropped;
                        }
                    }
                    Err(e) => log::warn!("Failed to encode ping: {e}"),
                }
            }
        }
    }
}

/// Resubscribe with exponential backoff. `None` if closed or out of attempts.
async fn reconnect(
    config: &ClientConfig,
    live: &LiveView,
    status: &mut watch::Receiver<ConnectionState>,
) -> Option<Socket> {
    for attempt in 1..=config.max_reconnect_attempts {
        let delay = config.backoff(attempt);
        log::info!(
            "Reconnecting {} in {delay:?} (attempt {attempt}/{})",
            live.filter(),
            config.max_reconnect_attempts
        );
        if closed_during(delay, live, status).await {
            return None;
        }

        match open_feed(config, live.filter()).await {
            Ok((socket, rows)) => {
                let changes = live.apply_snapshot(rows).await;
                live.set_status(ConnectionState::Connected);
                log::info!(
                    "Resubscribed to {} after {attempt} attempt(s); re-snapshot reconciled {changes} changes",
                    live.filter()
                );
                return Some(socket);
            }
            Err(e) => log::warn!("Reconnect attempt {attempt} for {} failed: {e}", live.filter()),
        }
    }

    log::error!(
        "Giving up on {} after {} reconnect attempts",
        live.filter(),
        config.max_reconnect_attempts
    );
    live.set_status(ConnectionState::Failed);
    None
}

/// Sleep for `delay` unless the subscription is closed first.
async fn closed_during(delay: Duration, live: &LiveView, status: &mut watch::Receiver<ConnectionState>) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return live.status().is_terminal(),
            changed = status.changed() => {
                if changed.is_err() || live.status().is_terminal() {
                    return true;
                }
            }
        }
    }
}
