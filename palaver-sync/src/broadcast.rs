//! Change fan-out from the write path to subscribed connections.
//!
//! Each channel gets its own tokio broadcast group, so a subscriber pinned to
//! one channel never wakes up for traffic in another. Subscriptions that are
//! not channel-scoped (all messages, or by author) listen on the firehose,
//! which sees every change. Events are shared as `Arc<ChangeEvent>`; each
//! connection applies its own filter before encoding.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use palaver_core::{ChangeEvent, ChannelId, CollectionFilter};
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub events_sent: u64,
    pub events_lagged: u64,
    pub active_subscribers: usize,
}

/// Counters updated on the publish path without taking a lock.
struct AtomicBroadcastStats {
    events_sent: AtomicU64,
    events_lagged: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            events_sent: AtomicU64::new(0),
            events_lagged: AtomicU64::new(0),
        }
    }
}

/// Subscribers sharing one broadcast channel.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<ChangeEvent>>,
    /// Connection id → the filter it subscribed with.
    subscribers: RwLock<HashMap<Uuid, CollectionFilter>>,
    atomic_stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// `capacity` is how many events a slow subscriber may fall behind
    /// before it lags.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            subscribers: RwLock::new(HashMap::new()),
            atomic_stats: AtomicBroadcastStats::new(),
        }
    }

    pub async fn add_subscriber(
        &self,
        connection_id: Uuid,
        filter: CollectionFilter,
    ) -> broadcast::Receiver<Arc<ChangeEvent>> {
        let mut subscribers = self.subscribers.write().await;
        subscribers.insert(connection_id, filter);
        self.sender.subscribe()
    }

    pub async fn remove_subscriber(&self, connection_id: &Uuid) -> Option<CollectionFilter> {
        self.subscribers.write().await.remove(connection_id)
    }

    /// Returns the number of receivers the event was queued for.
    pub fn publish(&self, event: Arc<ChangeEvent>) -> usize {
        let count = self.sender.send(event).unwrap_or(0);
        self.atomic_stats.events_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// A subscriber reported `skipped` missed events.
    pub fn record_lag(&self, skipped: u64) {
        self.atomic_stats
            .events_lagged
            .fetch_add(skipped, Ordering::Relaxed);
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            events_sent: self.atomic_stats.events_sent.load(Ordering::Relaxed),
            events_lagged: self.atomic_stats.events_lagged.load(Ordering::Relaxed),
            active_subscribers: self.subscribers.read().await.len(),
        }
    }
}

/// Routes subscriptions and published changes to broadcast groups.
pub struct FeedRouter {
    channels: RwLock<HashMap<ChannelId, Arc<BroadcastGroup>>>,
    firehose: Arc<BroadcastGroup>,
    default_capacity: usize,
}

impl FeedRouter {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            firehose: Arc::new(BroadcastGroup::new(default_capacity)),
            default_capacity,
        }
    }

    /// Group that carries every change a subscription with `filter` can see.
    pub async fn group_for(&self, filter: &CollectionFilter) -> Arc<BroadcastGroup> {
        match filter.channel_scope() {
            Some(channel) => self.get_or_create(channel).await,
            None => self.firehose.clone(),
        }
    }

    pub async fn get_or_create(&self, channel: ChannelId) -> Arc<BroadcastGroup> {
        {
            let channels = self.channels.read().await;
            if let Some(group) = channels.get(&channel) {
                return group.clone();
            }
        }

        let mut channels = self.channels.write().await;
        // Double-check after acquiring the write lock.
        if let Some(group) = channels.get(&channel) {
            return group.clone();
        }
        let group = Arc::new(BroadcastGroup::new(self.default_capacity));
        channels.insert(channel, group.clone());
        group
    }

    /// Deliver a change to the firehose and to its channel's group, if any
    /// connection ever subscribed to that channel.
    pub async fn publish(&self, event: Arc<ChangeEvent>) -> usize {
        let mut delivered = self.firehose.publish(event.clone());
        let channels = self.channels.read().await;
        if let Some(group) = channels.get(&event.row.channel_id) {
            delivered += group.publish(event);
        }
        delivered
    }

    /// Drop a channel group that has no subscribers left.
    pub async fn remove_if_empty(&self, channel: &ChannelId) -> bool {
        let mut channels = self.channels.write().await;
        if let Some(group) = channels.get(channel) {
            if group.subscriber_count().await == 0 {
                channels.remove(channel);
                return true;
            }
        }
        false
    }

    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }
}
