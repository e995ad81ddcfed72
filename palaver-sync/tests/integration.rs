//! Integration tests for end-to-end timeline sync.
//!
//! These tests start a real feed server and connect real clients,
//! verifying subscription, reconnect and optimistic write pipelines.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use palaver_core::{
    now_millis, ChangeEvent, ChangeKind, CollectionFilter, EventKinds, ItemId, TimelineItem,
};
use palaver_sync::{
    match_id, ChangeStreamClient, ClientConfig, ClientFrame, ConnectionState, FeedServer,
    OptimisticReconciler, ReconcileError, ReconcilerConfig, RemoteWriter, ServerConfig,
    ServerFrame, StreamError, WriteEndpoint, WriteError, WriteRequest,
};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn test_config(port: u16) -> ServerConfig {
    ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        broadcast_capacity: 64,
        data_dir: None,
        sync_writes: false,
    }
}

async fn start_server(config: ServerConfig) -> Arc<FeedServer> {
    let server = Arc::new(FeedServer::new(config).unwrap());
    let runner = server.clone();
    tokio::spawn(async move {
        runner.run().await.unwrap();
    });
    // Give server time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
    server
}

/// Start a server on a free port, return it with its URL.
async fn start_test_server() -> (Arc<FeedServer>, String) {
    let port = free_port().await;
    let server = start_server(test_config(port)).await;
    (server, format!("ws://127.0.0.1:{port}"))
}

fn client_config(url: &str) -> ClientConfig {
    ClientConfig {
        connect_timeout: Duration::from_secs(2),
        reconnect_base_delay: Duration::from_millis(20),
        reconnect_max_delay: Duration::from_millis(200),
        max_reconnect_attempts: 20,
        ..ClientConfig::new(url)
    }
}

fn create(text: &str, channel: &str, author: &str) -> WriteRequest {
    WriteRequest::Create {
        id: Some(ItemId::new()),
        payload: text.into(),
        channel_id: channel.into(),
        author_id: author.into(),
    }
}

async fn seed(server: &FeedServer, text: &str, channel: &str, author: &str) -> TimelineItem {
    server.write(create(text, channel, author)).await.unwrap()
}

fn ids(rows: &[TimelineItem]) -> Vec<ItemId> {
    rows.iter().map(|r| r.id).collect()
}

#[tokio::test]
async fn test_subscribe_receives_filtered_snapshot() {
    let (server, url) = start_test_server().await;
    let a = seed(&server, "a", "C1", "u1").await;
    seed(&server, "elsewhere", "C2", "u1").await;
    let b = seed(&server, "b", "C1", "u2").await;

    let client = ChangeStreamClient::new(client_config(&url));
    let handle = client
        .subscribe(CollectionFilter::channel_messages(&"C1".into()))
        .await
        .unwrap();

    assert_eq!(handle.status(), ConnectionState::Connected);
    assert_eq!(ids(&handle.current_state().await), vec![a.id, b.id]);
    handle.close().await;
}

#[tokio::test]
async fn test_author_filter_spans_channels() {
    let (server, url) = start_test_server().await;
    let a = seed(&server, "a", "C1", "u1").await;
    seed(&server, "b", "C1", "u2").await;
    let c = seed(&server, "c", "C2", "u1").await;

    let client = ChangeStreamClient::new(client_config(&url));
    let handle = client
        .subscribe(CollectionFilter::authored_by(&"u1".into()))
        .await
        .unwrap();
    assert_eq!(ids(&handle.current_state().await), vec![a.id, c.id]);

    let pending = handle.watch(EventKinds::INSERT, |_| true);
    seed(&server, "not mine", "C3", "u2").await;
    let mine = seed(&server, "mine", "C3", "u1").await;
    let event = timeout(Duration::from_secs(2), pending.next_match())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.row.id, mine.id);
}

#[tokio::test]
async fn test_live_changes_are_applied_in_order() {
    let (server, url) = start_test_server().await;
    let client = ChangeStreamClient::new(client_config(&url));
    let handle = client
        .subscribe(CollectionFilter::channel_messages(&"C1".into()))
        .await
        .unwrap();
    assert!(handle.current_state().await.is_empty());

    let last = handle.watch(EventKinds::INSERT, |row| row.payload == "m19");
    let mut written = Vec::new();
    for i in 0..20 {
        written.push(seed(&server, &format!("m{i}"), "C1", "u1").await);
    }
    timeout(Duration::from_secs(2), last.next_match())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ids(&handle.current_state().await), ids(&written));
}

#[tokio::test]
async fn test_submit_end_to_end() {
    let (_server, url) = start_test_server().await;
    let client = ChangeStreamClient::new(client_config(&url));
    let handle = client
        .subscribe(CollectionFilter::channel_messages(&"C1".into()))
        .await
        .unwrap();
    let writer = RemoteWriter::connect(&url, Duration::from_secs(2)).await.unwrap();
    let reconciler = OptimisticReconciler::new(
        "C1".into(),
        "u1".into(),
        handle.live(),
        Arc::new(writer),
        ReconcilerConfig::default(),
    );

    let inserted = handle.watch(EventKinds::INSERT, |row| row.payload == "hello");
    let id = reconciler.submit("hello").await.unwrap();

    // Provisional entry is visible immediately.
    let overlay = reconciler.materialized_overlay().await;
    let mine: Vec<_> = overlay.iter().filter(|i| i.id == id).collect();
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].payload, "hello");
    assert_eq!(mine[0].channel_id.as_str(), "C1");
    assert_eq!(mine[0].author_id.as_str(), "u1");

    // Authoritative insert carries the same id.
    let event = timeout(Duration::from_secs(2), inserted.next_match())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.kind, ChangeKind::Insert);
    assert_eq!(event.row.id, id);

    let overlay = reconciler.materialized_overlay().await;
    assert_eq!(overlay.iter().filter(|i| i.id == id).count(), 1);
    assert_eq!(reconciler.pending_count().await, 0);
}

#[tokio::test]
async fn test_reconnect_reconciles_resnapshot() {
    let (server, url) = start_test_server().await;
    let a = seed(&server, "A", "C1", "u1").await;
    let b = seed(&server, "B", "C1", "u1").await;

    let client = ChangeStreamClient::new(client_config(&url));
    let handle = client
        .subscribe(CollectionFilter::channel_messages(&"C1".into()))
        .await
        .unwrap();
    assert_eq!(ids(&handle.current_state().await), vec![a.id, b.id]);

    server.disconnect_all();
    let c = seed(&server, "C", "C1", "u1").await;

    let expected = vec![a.id, b.id, c.id];
    let converged = timeout(Duration::from_secs(5), async {
        loop {
            let reconnected = server.stats().await.total_connections >= 2;
            if reconnected
                && handle.status() == ConnectionState::Connected
                && ids(&handle.current_state().await) == expected
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(converged.is_ok(), "view did not converge after reconnect");
    assert_eq!(ids(&handle.current_state().await), expected);
}

#[tokio::test]
async fn test_subscription_fails_when_server_is_gone() {
    let (server, url) = start_test_server().await;
    let config = ClientConfig {
        max_reconnect_attempts: 2,
        connect_timeout: Duration::from_millis(500),
        ..client_config(&url)
    };
    let handle = ChangeStreamClient::new(config)
        .subscribe(CollectionFilter::messages())
        .await
        .unwrap();
    let pending = handle.watch(EventKinds::ALL, |_| true);

    server.shutdown();
    let result = timeout(Duration::from_secs(5), pending.next_match()).await.unwrap();
    assert_eq!(result.unwrap_err(), StreamError::SubscriptionDropped);
    assert_eq!(handle.status(), ConnectionState::Failed);
}

#[tokio::test]
async fn test_close_resolves_waiters() {
    let (server, url) = start_test_server().await;
    let handle = ChangeStreamClient::new(client_config(&url))
        .subscribe(CollectionFilter::messages())
        .await
        .unwrap();
    let live = handle.live();
    let pending = handle.watch(EventKinds::ALL, |_| true);

    handle.close().await;
    let result = timeout(Duration::from_secs(2), pending.next_match()).await.unwrap();
    assert_eq!(result.unwrap_err(), StreamError::Closed);

    // Nothing is applied after close.
    seed(&server, "late", "C1", "u1").await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(live.is_empty().await);
    assert_eq!(live.status(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_create_is_idempotent_over_the_wire() {
    let (server, url) = start_test_server().await;
    let handle = ChangeStreamClient::new(client_config(&url))
        .subscribe(CollectionFilter::channel_messages(&"C1".into()))
        .await
        .unwrap();
    let writer = RemoteWriter::connect(&url, Duration::from_secs(2)).await.unwrap();

    let request = create("hello", "C1", "u1");
    let first_insert = handle.watch(EventKinds::INSERT, |_| true);
    let first = writer.write(request.clone()).await.unwrap();
    timeout(Duration::from_secs(2), first_insert.next_match())
        .await
        .unwrap()
        .unwrap();

    let second_insert = handle.watch(EventKinds::ALL, |_| true);
    let retry = writer.write(request).await.unwrap();
    assert_eq!(retry, first);
    assert!(
        timeout(Duration::from_millis(200), second_insert.next_match())
            .await
            .is_err(),
        "retry must not emit a second change"
    );

    assert_eq!(server.snapshot(&CollectionFilter::messages()).await.len(), 1);
    assert_eq!(handle.current_state().await.len(), 1);
}

#[tokio::test]
async fn test_non_author_cannot_edit_or_delete() {
    let (server, url) = start_test_server().await;
    let row = seed(&server, "hands off", "C1", "u1").await;

    let handle = ChangeStreamClient::new(client_config(&url))
        .subscribe(CollectionFilter::channel_messages(&"C1".into()))
        .await
        .unwrap();
    let writer = RemoteWriter::connect(&url, Duration::from_secs(2)).await.unwrap();
    let mut intruder = OptimisticReconciler::new(
        "C1".into(),
        "u2".into(),
        handle.live(),
        Arc::new(writer),
        ReconcilerConfig::default(),
    );
    let mut notices = intruder.take_notices().unwrap();

    let err = intruder.edit(row.id, "defaced").await.unwrap_err();
    assert_eq!(err, ReconcileError::Write(WriteError::PermissionDenied));
    let err = intruder.remove(row.id).await.unwrap_err();
    assert_eq!(err, ReconcileError::Write(WriteError::PermissionDenied));
    assert_eq!(notices.recv().await.unwrap().message(), "You can only change your own messages.");

    assert_eq!(handle.current_state().await, vec![row.clone()]);
    assert_eq!(server.snapshot(&CollectionFilter::messages()).await, vec![row]);
}

#[tokio::test]
async fn test_edit_and_remove_propagate() {
    let (_server, url) = start_test_server().await;
    let handle = ChangeStreamClient::new(client_config(&url))
        .subscribe(CollectionFilter::channel_messages(&"C1".into()))
        .await
        .unwrap();
    let writer = RemoteWriter::connect(&url, Duration::from_secs(2)).await.unwrap();
    let reconciler = OptimisticReconciler::new(
        "C1".into(),
        "u1".into(),
        handle.live(),
        Arc::new(writer),
        ReconcilerConfig::default(),
    );

    let inserted = handle.watch(EventKinds::INSERT, |_| true);
    let id = reconciler.submit("first draft").await.unwrap();
    timeout(Duration::from_secs(2), inserted.next_match())
        .await
        .unwrap()
        .unwrap();

    let updated = handle.watch(EventKinds::UPDATE, match_id(id));
    let edited = reconciler.edit(id, "final").await.unwrap();
    assert_eq!(edited.payload, "final");
    let event = timeout(Duration::from_secs(2), updated.next_match())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.row.payload, "final");
    assert_eq!(handle.current_state().await[0].payload, "final");

    let deleted = handle.watch(EventKinds::DELETE, match_id(id));
    let removed = reconciler.remove(id).await.unwrap();
    assert!(removed.deleted_at.is_some());
    timeout(Duration::from_secs(2), deleted.next_match())
        .await
        .unwrap()
        .unwrap();
    assert!(handle.current_state().await.is_empty());
    assert!(reconciler.materialized_overlay().await.is_empty());
}

#[tokio::test]
async fn test_storage_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port().await;
    let config = ServerConfig {
        data_dir: Some(dir.path().join("messages")),
        ..test_config(port)
    };

    let (kept, removed) = {
        let server = FeedServer::new(config.clone()).unwrap();
        let kept = seed(&server, "keep", "C1", "u1").await;
        let removed = seed(&server, "drop", "C1", "u1").await;
        server
            .write(WriteRequest::Update {
                id: kept.id,
                author_id: "u1".into(),
                payload: "kept".into(),
            })
            .await
            .unwrap();
        server
            .write(WriteRequest::Delete {
                id: removed.id,
                author_id: "u1".into(),
            })
            .await
            .unwrap();
        (kept, removed)
    };

    let server = start_server(config).await;
    let handle = ChangeStreamClient::new(client_config(&format!("ws://127.0.0.1:{port}")))
        .subscribe(CollectionFilter::channel_messages(&"C1".into()))
        .await
        .unwrap();
    let state = handle.current_state().await;
    assert_eq!(ids(&state), vec![kept.id]);
    assert_eq!(state[0].payload, "kept");

    // The soft-deleted id is still reserved.
    let err = server
        .write(WriteRequest::Update {
            id: removed.id,
            author_id: "u1".into(),
            payload: "back".into(),
        })
        .await
        .unwrap_err();
    assert_eq!(err, WriteError::NotFound(removed.id));

    // New writes continue after the restored ones.
    let fresh = TimelineItem::new(ItemId::new(), "new", "C1".into(), "u1".into(), now_millis());
    let stored = server
        .write(WriteRequest::Create {
            id: Some(fresh.id),
            payload: fresh.payload.clone(),
            channel_id: fresh.channel_id.clone(),
            author_id: fresh.author_id.clone(),
        })
        .await
        .unwrap();
    assert_eq!(stored.id, fresh.id);
}

#[tokio::test]
async fn test_malformed_frame_keeps_subscription_live() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let row = TimelineItem::new(ItemId::new(), "after garbage", "C1".into(), "u1".into(), now_millis());
    let (send_tail, tail_requested) = tokio::sync::oneshot::channel::<()>();

    // Hand-driven feed: snapshot, then a garbage frame, then a valid change.
    let streamed = row.clone();
    let feed = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        while let Some(Ok(msg)) = ws.next().await {
            if let Message::Binary(data) = msg {
                if matches!(ClientFrame::decode(&data), Ok(ClientFrame::Subscribe { .. })) {
                    break;
                }
            }
        }
        let snapshot = ServerFrame::Snapshot { rows: Vec::new() }.encode().unwrap();
        ws.send(Message::Binary(snapshot.into())).await.unwrap();

        tail_requested.await.unwrap();
        ws.send(Message::Binary(vec![0xde_u8, 0xad, 0xbe, 0xef].into()))
            .await
            .unwrap();
        let change = ServerFrame::Change(ChangeEvent::insert(streamed)).encode().unwrap();
        ws.send(Message::Binary(change.into())).await.unwrap();

        while let Some(Ok(msg)) = ws.next().await {
            if msg.is_close() {
                break;
            }
        }
    });

    let handle = ChangeStreamClient::new(client_config(&url))
        .subscribe(CollectionFilter::channel_messages(&"C1".into()))
        .await
        .unwrap();
    let inserted = handle.watch(EventKinds::INSERT, match_id(row.id));
    send_tail.send(()).unwrap();

    let event = timeout(Duration::from_secs(2), inserted.next_match())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.row.id, row.id);
    assert_eq!(handle.status(), ConnectionState::Connected);
    assert_eq!(ids(&handle.current_state().await), vec![row.id]);

    handle.close().await;
    feed.abort();
}
