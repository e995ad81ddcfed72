//! Client-side materialized view of one subscription.
//!
//! Only the subscription task mutates the view (`apply_event`,
//! `apply_snapshot` are crate-private). Readers take the `RwLock` read side.
//! Every applied change is re-published on a broadcast channel so callers
//! can wait for a specific event with [`LiveView::watch`]. Changes are sent
//! while the write lock is still held, so a reader holding the read lock
//! can find every change already applied to the view in its receiver.
//!
//! The connection status doubles as the cancellation token: once it reaches
//! `Closed` or `Failed` nothing else is applied and every outstanding watch
//! resolves with an error.

use palaver_core::{
    Applied, ChangeEvent, CollectionFilter, EventKinds, ItemId, MaterializedView, TimelineItem,
};
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch, RwLock, RwLockReadGuard};

use crate::protocol::ProtocolError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("subscription dropped: reconnect attempts exhausted")]
    SubscriptionDropped,
    #[error("subscription closed")]
    Closed,
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("connect failed: {0}")]
    Connect(String),
    /// The watch fell behind the event channel; the awaited event may have
    /// been among the skipped ones.
    #[error("event watch fell behind by {0} events")]
    Lagged(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Reconnecting,
    /// Closed by the owner.
    Closed,
    /// Gave up reconnecting.
    Failed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }

    fn terminal_error(self) -> Option<StreamError> {
        match self {
            Self::Closed => Some(StreamError::Closed),
            Self::Failed => Some(StreamError::SubscriptionDropped),
            _ => None,
        }
    }
}

type Predicate = Box<dyn Fn(&TimelineItem) -> bool + Send + Sync>;

/// Predicate matching one row id.
pub fn match_id(id: ItemId) -> impl Fn(&TimelineItem) -> bool + Send + Sync + 'static {
    move |row| row.id == id
}

pub struct LiveView {
    filter: CollectionFilter,
    view: RwLock<MaterializedView>,
    events: broadcast::Sender<ChangeEvent>,
    status: watch::Sender<ConnectionState>,
}

impl LiveView {
    pub(crate) fn new(filter: CollectionFilter, event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity);
        let (status, _) = watch::channel(ConnectionState::Connecting);
        Self {
            filter,
            view: RwLock::new(MaterializedView::new()),
            events,
            status,
        }
    }

    pub fn filter(&self) -> &CollectionFilter {
        &self.filter
    }

    pub async fn current_state(&self) -> Vec<TimelineItem> {
        self.view.read().await.to_vec()
    }

    /// Read access to the view for callers that combine it with other state.
    pub async fn read(&self) -> RwLockReadGuard<'_, MaterializedView> {
        self.view.read().await
    }

    pub async fn contains(&self, id: &ItemId) -> bool {
        self.view.read().await.contains(id)
    }

    pub async fn len(&self) -> usize {
        self.view.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.view.read().await.is_empty()
    }

    pub fn status(&self) -> ConnectionState {
        *self.status.borrow()
    }

    pub fn status_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.status.subscribe()
    }

    /// Register interest in the next applied event of one of `kinds` whose
    /// row satisfies `predicate`.
    ///
    /// Registration happens here, not when the returned watch is awaited, so
    /// an event applied in between is not missed.
    pub fn watch(
        &self,
        kinds: EventKinds,
        predicate: impl Fn(&TimelineItem) -> bool + Send + Sync + 'static,
    ) -> EventWatch {
        EventWatch {
            rx: self.events.subscribe(),
            status: self.status.subscribe(),
            kinds,
            predicate: Box::new(predicate),
        }
    }

    /// [`watch`](Self::watch) and wait. No timeout.
    pub async fn await_event(
        &self,
        kinds: EventKinds,
        predicate: impl Fn(&TimelineItem) -> bool + Send + Sync + 'static,
    ) -> Result<ChangeEvent, StreamError> {
        self.watch(kinds, predicate).next_match().await
    }

    /// Raw receiver for every change applied from now on.
    pub(crate) fn subscribe_events(&self) -> broadcast::Receiver<ChangeEvent> {
        self.events.subscribe()
    }

    pub(crate) fn set_status(&self, state: ConnectionState) {
        self.status.send_if_modified(|current| {
            // Terminal states are final.
            if current.is_terminal() || *current == state {
                return false;
            }
            log::debug!("Subscription {} status {:?} -> {state:?}", self.filter, *current);
            *current = state;
            true
        });
    }

    pub(crate) fn close(&self) {
        self.set_status(ConnectionState::Closed);
    }

    pub(crate) async fn apply_event(&self, event: ChangeEvent) -> Applied {
        let mut view = self.view.write().await;
        // Checked under the lock so close() cannot interleave with an apply.
        if self.status().is_terminal() {
            return Applied::Ignored;
        }
        let applied = view.apply(&event);
        if applied.changed() {
            let _ = self.events.send(event);
        }
        applied
    }

    /// Reconcile a (re-)snapshot by identity. Returns the number of changes.
    pub(crate) async fn apply_snapshot(&self, rows: Vec<TimelineItem>) -> usize {
        let mut view = self.view.write().await;
        if self.status().is_terminal() {
            return 0;
        }
        let events = view.apply_snapshot(rows);
        let changes = events.len();
        for event in events {
            let _ = self.events.send(event);
        }
        changes
    }
}

/// A registered wait for one matching event.
pub struct EventWatch {
    rx: broadcast::Receiver<ChangeEvent>,
    status: watch::Receiver<ConnectionState>,
    kinds: EventKinds,
    predicate: Predicate,
}

impl EventWatch {
    /// Resolve with the first matching event applied after registration.
    ///
    /// Fails with `Closed` if the subscription is closed first, with
    /// `SubscriptionDropped` if it fails permanently, or with `Lagged` if
    /// events were skipped before a match was seen.
    pub async fn next_match(mut self) -> Result<ChangeEvent, StreamError> {
        loop {
            let state = *self.status.borrow_and_update();
            if let Some(err) = state.terminal_error() {
                // Deliver events applied before the close, then stop.
                return self.drain_buffered().ok_or(err);
            }

            tokio::select! {
                biased;
                received = self.rx.recv() => match received {
                    Ok(event) => {
                        if self.is_match(&event) {
                            return Ok(event);
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        log::warn!("Event watch lagged by {n} events");
                        return Err(StreamError::Lagged(n));
                    }
                    Err(RecvError::Closed) => return Err(StreamError::Closed),
                },
                changed = self.status.changed() => {
                    if changed.is_err() {
                        return Err(StreamError::Closed);
                    }
                }
            }
        }
    }

    fn is_match(&self, event: &ChangeEvent) -> bool {
        self.kinds.contains(event.kind) && (self.predicate)(&event.row)
    }

    fn drain_buffered(&mut self) -> Option<ChangeEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) if self.is_match(&event) => return Some(event),
                Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}
