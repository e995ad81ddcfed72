//! Optimistic reconciler: provisional entries overlaid on the live view.
//!
//! Per-entry state machine:
//!
//! ```text
//!   submit ──► Pending ──write ok──► Confirmed ──stream change for id──► (settled)
//!                 │
//!                 └──write failed──► Failed ──► retracted + Notice::SendFailed
//! ```
//!
//! The entry is in the ledger before `submit` returns, and it carries the
//! same id as the durable write, so the authoritative insert from the change
//! stream replaces it rather than duplicating it. The write reply drives the
//! state machine; the stream insert is only watched for (bounded by
//! `confirm_timeout`) and logged.
//!
//! The ledger settles against every change the base view applies, not just
//! against the view's current contents. An entry whose row was inserted and
//! then deleted again before anyone looked is therefore gone too.

use std::sync::Arc;
use std::time::{Duration, Instant};

use palaver_core::{
    now_millis, validate_payload, ChangeEvent, ChannelId, EventKinds, IdGenerator, ItemId,
    MaterializedView, TimelineItem, UserId, ValidationError,
};
use thiserror::Error;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::sync::{mpsc, Mutex, MutexGuard, RwLockReadGuard};
use tokio::task::JoinSet;

use crate::live::{match_id, EventWatch, LiveView, StreamError};
use crate::protocol::WriteRequest;
use crate::writer::{WriteEndpoint, WriteError};

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// How long to watch the stream for a confirmed insert before logging
    /// that it never arrived.
    pub confirm_timeout: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            confirm_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Write in flight.
    Pending,
    /// Write acknowledged; waiting for the base view to contain the id.
    Confirmed,
    /// Write failed; about to be retracted.
    Failed,
}

#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub item: TimelineItem,
    pub state: EntryState,
    pub submitted_at: Instant,
}

/// User-facing outcome of a failed mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    SendFailed {
        id: ItemId,
        payload: String,
        error: WriteError,
    },
    EditFailed {
        id: ItemId,
        error: WriteError,
    },
    DeleteFailed {
        id: ItemId,
        error: WriteError,
    },
    PermissionDenied {
        id: ItemId,
    },
}

impl Notice {
    pub fn message(&self) -> &'static str {
        match self {
            Notice::SendFailed { .. } => "Failed to send message. Please try again.",
            Notice::EditFailed { .. } => "Failed to edit message.",
            Notice::DeleteFailed { .. } => "Failed to delete message.",
            Notice::PermissionDenied { .. } => "You can only change your own messages.",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Write(#[from] WriteError),
}

/// Provisional entries in submission order, at most one per id.
struct Ledger {
    entries: Vec<PendingEntry>,
    /// Every change applied to the base view since the ledger was created.
    changes: broadcast::Receiver<ChangeEvent>,
}

impl Ledger {
    fn new(changes: broadcast::Receiver<ChangeEvent>) -> Self {
        Self {
            entries: Vec::new(),
            changes,
        }
    }

    fn contains(&self, id: &ItemId) -> bool {
        self.entries.iter().any(|e| e.item.id == *id)
    }

    fn get(&self, id: &ItemId) -> Option<&PendingEntry> {
        self.entries.iter().find(|e| e.item.id == *id)
    }

    fn push(&mut self, item: TimelineItem) {
        self.entries.push(PendingEntry {
            item,
            state: EntryState::Pending,
            submitted_at: Instant::now(),
        });
    }

    /// Replace the provisional row with the canonical one.
    fn confirm(&mut self, row: TimelineItem) -> bool {
        match self.entries.iter_mut().find(|e| e.item.id == row.id) {
            Some(entry) => {
                entry.item = row;
                entry.state = EntryState::Confirmed;
                true
            }
            None => false,
        }
    }

    fn retract(&mut self, id: &ItemId) -> Option<PendingEntry> {
        let pos = self.entries.iter().position(|e| e.item.id == *id)?;
        let mut entry = self.entries.remove(pos);
        entry.state = EntryState::Failed;
        Some(entry)
    }

    fn discard(&mut self, id: &ItemId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.item.id != *id);
        before != self.entries.len()
    }

    /// Drop entries the stream has taken over. Must run while the base
    /// view's read lock is held, so no applied change is still in flight.
    fn settle(&mut self, base: &MaterializedView) -> usize {
        let mut settled = 0;
        loop {
            match self.changes.try_recv() {
                // Any change for the id means the stream owns it now.
                Ok(event) => {
                    if self.discard(&event.row.id) {
                        settled += 1;
                    }
                }
                Err(TryRecvError::Lagged(n)) => {
                    log::warn!("Ledger missed {n} changes; settling against the base view only");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }

        let before = self.entries.len();
        self.entries.retain(|e| !base.contains(&e.item.id));
        settled + before - self.entries.len()
    }
}

/// Result of watching the change stream for an acknowledged insert.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Confirmation {
    /// The insert arrived on the stream.
    Streamed,
    /// The watch fell behind, but the base view already holds the row.
    InView,
    /// The subscription ended first.
    Stopped(StreamError),
    TimedOut,
}

pub struct OptimisticReconciler {
    channel_id: ChannelId,
    author_id: UserId,
    live: Arc<LiveView>,
    writer: Arc<dyn WriteEndpoint>,
    config: ReconcilerConfig,
    ledger: Arc<Mutex<Ledger>>,
    ids: Mutex<IdGenerator>,
    in_flight: Mutex<JoinSet<()>>,
    notices_tx: mpsc::UnboundedSender<Notice>,
    notices_rx: Option<mpsc::UnboundedReceiver<Notice>>,
}

impl OptimisticReconciler {
    /// Reconcile writes by `author_id` to `channel_id` against `live`.
    pub fn new(
        channel_id: ChannelId,
        author_id: UserId,
        live: Arc<LiveView>,
        writer: Arc<dyn WriteEndpoint>,
        config: ReconcilerConfig,
    ) -> Self {
        let (notices_tx, notices_rx) = mpsc::unbounded_channel();
        let ledger = Ledger::new(live.subscribe_events());
        Self {
            channel_id,
            author_id,
            live,
            writer,
            config,
            ledger: Arc::new(Mutex::new(ledger)),
            ids: Mutex::new(IdGenerator::new()),
            in_flight: Mutex::new(JoinSet::new()),
            notices_tx,
            notices_rx: Some(notices_rx),
        }
    }

    /// Take the notice receiver (can only be called once).
    pub fn take_notices(&mut self) -> Option<mpsc::UnboundedReceiver<Notice>> {
        self.notices_rx.take()
    }

    /// Add a provisional entry and dispatch its durable write.
    ///
    /// The entry is visible in [`materialized_overlay`](Self::materialized_overlay)
    /// as soon as this returns.
    pub async fn submit(&self, payload: &str) -> Result<ItemId, ReconcileError> {
        let payload = validate_payload(payload)?;
        let id = self.fresh_id().await;
        let item = TimelineItem::new(
            id,
            payload.clone(),
            self.channel_id.clone(),
            self.author_id.clone(),
            now_millis(),
        );
        self.ledger.lock().await.push(item);

        // Registered before the write so the insert cannot slip past.
        let confirmation = self.live.watch(EventKinds::INSERT, match_id(id));
        let request = WriteRequest::Create {
            id: Some(id),
            payload: payload.clone(),
            channel_id: self.channel_id.clone(),
            author_id: self.author_id.clone(),
        };

        let writer = self.writer.clone();
        let live = self.live.clone();
        let ledger = self.ledger.clone();
        let notices = self.notices_tx.clone();
        let confirm_timeout = self.config.confirm_timeout;

        let mut in_flight = self.in_flight.lock().await;
        while in_flight.try_join_next().is_some() {}
        in_flight.spawn(async move {
            match writer.write(request).await {
                Ok(row) => {
                    if ledger.lock().await.confirm(row) {
                        log::debug!("Write {id} acknowledged");
                    }
                    tokio::spawn(async move {
                        match watch_confirmation(&live, id, confirmation, confirm_timeout).await {
                            Confirmation::Streamed => log::debug!("Insert {id} observed on the change stream"),
                            Confirmation::InView => log::debug!("Insert {id} found in the view after a lag"),
                            Confirmation::Stopped(e) => log::debug!("Stopped watching for {id}: {e}"),
                            Confirmation::TimedOut => log::warn!(
                                "Insert {id} acknowledged but not seen on the stream within {confirm_timeout:?}"
                            ),
                        }
                    });
                }
                Err(error) => {
                    ledger.lock().await.retract(&id);
                    log::warn!("Write {id} failed, retracting: {error}");
                    let _ = notices.send(Notice::SendFailed { id, payload, error });
                }
            }
        });
        Ok(id)
    }

    /// Base view followed by provisional entries not yet in it.
    pub async fn materialized_overlay(&self) -> Vec<TimelineItem> {
        let (base, ledger) = self.settled().await;
        let mut overlay = Vec::with_capacity(base.len() + ledger.entries.len());
        overlay.extend_from_slice(base.items());
        overlay.extend(ledger.entries.iter().map(|e| e.item.clone()));
        overlay
    }

    /// Replace the text of one of the current author's items.
    pub async fn edit(&self, id: ItemId, payload: &str) -> Result<TimelineItem, ReconcileError> {
        let payload = validate_payload(payload)?;
        let request = WriteRequest::Update {
            id,
            author_id: self.author_id.clone(),
            payload,
        };
        self.writer.write(request).await.map_err(|error| {
            log::warn!("Edit of {id} failed: {error}");
            self.notify_failure(id, error.clone(), |id, error| Notice::EditFailed { id, error });
            error.into()
        })
    }

    /// Soft-delete one of the current author's items.
    pub async fn remove(&self, id: ItemId) -> Result<TimelineItem, ReconcileError> {
        let request = WriteRequest::Delete {
            id,
            author_id: self.author_id.clone(),
        };
        match self.writer.write(request).await {
            Ok(row) => {
                // The stream delete settles it too; this covers a lagged ledger.
                if self.ledger.lock().await.discard(&id) {
                    log::debug!("Discarded local entry for deleted {id}");
                }
                Ok(row)
            }
            Err(error) => {
                log::warn!("Delete of {id} failed: {error}");
                self.notify_failure(id, error.clone(), |id, error| Notice::DeleteFailed { id, error });
                Err(error.into())
            }
        }
    }

    /// Base view and ledger, settled against each other. Locks the view
    /// before the ledger.
    async fn settled(&self) -> (RwLockReadGuard<'_, MaterializedView>, MutexGuard<'_, Ledger>) {
        let base = self.live.read().await;
        let mut ledger = self.ledger.lock().await;
        let settled = ledger.settle(&base);
        if settled > 0 {
            log::trace!("Settled {settled} provisional entries");
        }
        (base, ledger)
    }

    fn notify_failure(
        &self,
        id: ItemId,
        error: WriteError,
        notice: impl FnOnce(ItemId, WriteError) -> Notice,
    ) {
        let notice = match error {
            WriteError::PermissionDenied => Notice::PermissionDenied { id },
            error => notice(id, error),
        };
        let _ = self.notices_tx.send(notice);
    }

    /// Wait until every dispatched write has resolved.
    pub async fn flush(&self) {
        let mut in_flight = self.in_flight.lock().await;
        while let Some(result) = in_flight.join_next().await {
            if let Err(e) = result {
                log::error!("Write dispatch task failed: {e}");
            }
        }
    }

    pub async fn pending(&self) -> Vec<PendingEntry> {
        self.settled().await.1.entries.clone()
    }

    pub async fn pending_count(&self) -> usize {
        self.settled().await.1.entries.len()
    }

    pub async fn entry_state(&self, id: &ItemId) -> Option<EntryState> {
        self.settled().await.1.get(id).map(|e| e.state)
    }

    pub fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    pub fn author_id(&self) -> &UserId {
        &self.author_id
    }

    /// Next id not already used by the ledger or the view.
    async fn fresh_id(&self) -> ItemId {
        let mut ids = self.ids.lock().await;
        loop {
            let id = ids.next_id();
            let in_ledger = self.ledger.lock().await.contains(&id);
            if !in_ledger && !self.live.contains(&id).await {
                return id;
            }
            log::warn!("Generated id {id} already in use; regenerating");
        }
    }
}

/// Wait for the insert of `id`. After a lag the watch is re-registered and
/// the view checked, so an insert among the skipped events still counts.
async fn watch_confirmation(
    live: &LiveView,
    id: ItemId,
    mut confirmation: EventWatch,
    confirm_timeout: Duration,
) -> Confirmation {
    let deadline = tokio::time::Instant::now() + confirm_timeout;
    loop {
        match tokio::time::timeout_at(deadline, confirmation.next_match()).await {
            Ok(Ok(_)) => return Confirmation::Streamed,
            Ok(Err(StreamError::Lagged(n))) => {
                log::debug!("Confirmation watch for {id} skipped {n} events; rechecking");
                confirmation = live.watch(EventKinds::INSERT, match_id(id));
                if live.contains(&id).await {
                    return Confirmation::InView;
                }
            }
            Ok(Err(e)) => return Confirmation::Stopped(e),
            Err(_) => return Confirmation::TimedOut,
        }
    }
}
