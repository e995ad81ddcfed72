use criterion::{black_box, criterion_group, criterion_main, Criterion};
use palaver_core::{
    now_millis, ChangeEvent, CollectionFilter, ItemId, MaterializedView, TimelineItem,
};
use palaver_sync::broadcast::{BroadcastGroup, FeedRouter};
use palaver_sync::protocol::{ClientFrame, ServerFrame, WriteRequest};
use palaver_sync::store::MessageTable;
use std::sync::Arc;
use uuid::Uuid;

fn rows(n: usize, channel: &str) -> Vec<TimelineItem> {
    (0..n)
        .map(|i| {
            TimelineItem::new(
                ItemId::new(),
                format!("message number {i}"),
                channel.into(),
                "u1".into(),
                now_millis(),
            )
        })
        .collect()
}

fn bench_change_encode(c: &mut Criterion) {
    let frame = ServerFrame::Change(ChangeEvent::insert(rows(1, "C1").remove(0)));

    c.bench_function("change_encode", |b| {
        b.iter(|| black_box(black_box(&frame).encode().unwrap()))
    });
}

fn bench_change_decode(c: &mut Criterion) {
    let frame = ServerFrame::Change(ChangeEvent::insert(rows(1, "C1").remove(0)));
    let encoded = frame.encode().unwrap();

    c.bench_function("change_decode", |b| {
        b.iter(|| black_box(ServerFrame::decode(black_box(&encoded)).unwrap()))
    });
}

fn bench_snapshot_roundtrip(c: &mut Criterion) {
    let frame = ServerFrame::Snapshot { rows: rows(1_000, "C1") };

    c.bench_function("snapshot_roundtrip_1K", |b| {
        b.iter(|| {
            let encoded = frame.encode().unwrap();
            black_box(ServerFrame::decode(&encoded).unwrap());
        })
    });
}

fn bench_write_frame_encode(c: &mut Criterion) {
    let frame = ClientFrame::Write {
        request_id: Uuid::new_v4(),
        request: WriteRequest::Create {
            id: Some(ItemId::new()),
            payload: "hello there".into(),
            channel_id: "C1".into(),
            author_id: "u1".into(),
        },
    };

    c.bench_function("write_frame_encode", |b| {
        b.iter(|| black_box(black_box(&frame).encode().unwrap()))
    });
}

fn bench_view_apply_inserts(c: &mut Criterion) {
    let events: Vec<_> = rows(1_000, "C1").into_iter().map(ChangeEvent::insert).collect();

    c.bench_function("view_apply_1K_inserts", |b| {
        b.iter(|| {
            let mut view = MaterializedView::new();
            for event in &events {
                view.apply(black_box(event));
            }
            black_box(view.len());
        })
    });
}

fn bench_view_resnapshot(c: &mut Criterion) {
    let base = rows(1_000, "C1");
    let mut fresh = base.clone();
    fresh.extend(rows(10, "C1"));

    c.bench_function("view_resnapshot_1K_plus_10", |b| {
        b.iter(|| {
            let mut view = MaterializedView::from_rows(base.clone());
            black_box(view.apply_snapshot(black_box(fresh.clone())));
        })
    });
}

fn bench_store_snapshot(c: &mut Criterion) {
    let mut table = MessageTable::in_memory();
    for (i, channel) in ["C1", "C2", "C3", "C4"].iter().cycle().take(4_000).enumerate() {
        table
            .apply(
                WriteRequest::Create {
                    id: None,
                    payload: format!("m{i}"),
                    channel_id: (*channel).into(),
                    author_id: "u1".into(),
                },
                now_millis(),
            )
            .unwrap();
    }
    let filter = CollectionFilter::channel_messages(&"C2".into());

    c.bench_function("store_snapshot_1K_of_4K", |b| {
        b.iter(|| black_box(table.snapshot(black_box(&filter))))
    });
}

fn bench_broadcast_100_subscribers(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let events: Vec<_> = rows(1_000, "C1")
        .into_iter()
        .map(|row| Arc::new(ChangeEvent::insert(row)))
        .collect();

    c.bench_function("broadcast_1000_events_100_subscribers", |b| {
        b.iter(|| {
            rt.block_on(async {
                let group = BroadcastGroup::new(2048);
                let filter = CollectionFilter::channel_messages(&"C1".into());

                let mut receivers = Vec::new();
                for _ in 0..100 {
                    receivers.push(group.add_subscriber(Uuid::new_v4(), filter.clone()).await);
                }

                for event in &events {
                    group.publish(Arc::clone(event));
                }

                let mut received = 0usize;
                for rx in &mut receivers {
                    while rx.try_recv().is_ok() {
                        received += 1;
                    }
                }
                black_box(received);
            })
        })
    });
}

fn bench_router_publish(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let router = FeedRouter::new(1024);
    let channels: Vec<String> = (0..50).map(|i| format!("C{i}")).collect();
    rt.block_on(async {
        for channel in &channels {
            router.get_or_create(channel.as_str().into()).await;
        }
    });
    let event = Arc::new(ChangeEvent::insert(rows(1, "C7").remove(0)));

    c.bench_function("router_publish_50_channels", |b| {
        b.iter(|| rt.block_on(async { black_box(router.publish(Arc::clone(&event)).await) }))
    });
}

criterion_group!(
    benches,
    bench_change_encode,
    bench_change_decode,
    bench_snapshot_roundtrip,
    bench_write_frame_encode,
    bench_view_apply_inserts,
    bench_view_resnapshot,
    bench_store_snapshot,
    bench_broadcast_100_subscribers,
    bench_router_publish,
);
criterion_main!(benches);
