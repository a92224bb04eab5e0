use criterion::{criterion_group, criterion_main, Criterion};
use retro_collab::broadcast::{BroadcastGroup, ConnectionId, Fanout, Frame};
use retro_collab::protocol::{ClientMessage, RoomId, ServerMessage};
use retro_collab::storage::{RocksStore, RoomStore, StoreConfig};
use retro_core::{ClusterId, Feeling, Room, RoomSnapshot, TopicMatching};
use std::hint::black_box;
use tokio::sync::mpsc;
use uuid::Uuid;

/// A voting-phase room: 12 people, 60 topics in 15 clusters, 3 votes each.
fn populated_room() -> Room {
    let mut room = Room::new();
    for i in 0..12 {
        room.add_person(&format!("Person{i}"));
    }
    for i in 0..60 {
        room.add_topic(format!("topic number {i}"), Feeling::ALL[i % 3]);
    }
    let groupings: Vec<Vec<String>> = (0..15)
        .map(|c| (0..4).map(|t| format!("topic number {}", c * 4 + t)).collect())
        .collect();
    room.partition_into_clusters(&groupings, TopicMatching::FirstMatch).unwrap();
    for (i, person) in room.people.iter_mut().enumerate() {
        person.votes = (0..3).map(|v| ClusterId(((i + v) % 15) as u32)).collect();
    }
    room
}

fn bench_client_decode(c: &mut Criterion) {
    let frame = r#"{"type":"moveTopic","text":"topic number 7","x":512.4,"y":300}"#;

    c.bench_function("client_decode_move", |b| {
        b.iter(|| {
            black_box(ClientMessage::decode(black_box(frame)).unwrap());
        })
    });
}

fn bench_init_encode(c: &mut Criterion) {
    let msg = ServerMessage::Init(RoomSnapshot::of(&populated_room()));

    c.bench_function("init_encode_60_topics", |b| {
        b.iter(|| {
            black_box(black_box(&msg).encode().unwrap());
        })
    });
}

fn bench_tally(c: &mut Criterion) {
    let mut room = populated_room();

    c.bench_function("tally_12_people_15_clusters", |b| {
        b.iter(|| {
            room.tally();
            black_box(&room);
        })
    });
}

fn bench_publish_100_members(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let frame: Frame = Frame::from(r#"{"type":"moveTopic","text":"t","x":1,"y":2}"#);

    c.bench_function("publish_100_members", |b| {
        b.iter(|| {
            rt.block_on(async {
                let mut group = BroadcastGroup::new();
                let mut receivers = Vec::new();
                for i in 0..100 {
                    let (tx, rx) = mpsc::channel(16);
                    group.register(ConnectionId(i), tx);
                    receivers.push(rx);
                }

                let report = group.publish(black_box(frame.clone()));
                black_box(report);
            });
        })
    });
}

fn bench_publish_1000_frames(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let frame: Frame = Frame::from(r#"{"type":"moveTopic","text":"t","x":1,"y":2}"#);

    c.bench_function("publish_1000_frames_20_members", |b| {
        b.iter(|| {
            rt.block_on(async {
                let mut group = BroadcastGroup::new();
                let mut receivers = Vec::new();
                for i in 0..20 {
                    let (tx, rx) = mpsc::channel(1024);
                    group.register(ConnectionId(i), tx);
                    receivers.push(rx);
                }

                for _ in 0..1000 {
                    group.publish(frame.clone());
                }
                black_box(group.stats());
            });
        })
    });
}

fn bench_store_save(c: &mut Criterion) {
    let dir = std::env::temp_dir().join(format!("retro_bench_save_{}", Uuid::new_v4()));
    let store = RocksStore::open(StoreConfig {
        path: dir.clone(),
        ..StoreConfig::default()
    })
    .unwrap();
    let id = RoomId::parse("bench-room").unwrap();
    let room = populated_room();

    c.bench_function("store_save_room", |b| {
        b.iter(|| {
            store.save(black_box(&id), black_box(&room)).unwrap();
        })
    });

    let _ = std::fs::remove_dir_all(&dir);
}

fn bench_store_load(c: &mut Criterion) {
    let dir = std::env::temp_dir().join(format!("retro_bench_load_{}", Uuid::new_v4()));
    let store = RocksStore::open(StoreConfig {
        path: dir.clone(),
        ..StoreConfig::default()
    })
    .unwrap();
    let id = RoomId::parse("bench-room").unwrap();
    store.save(&id, &populated_room()).unwrap();

    c.bench_function("store_load_room", |b| {
        b.iter(|| {
            black_box(store.load(black_box(&id)).unwrap());
        })
    });

    let _ = std::fs::remove_dir_all(&dir);
}

criterion_group!(
    benches,
    bench_client_decode,
    bench_init_encode,
    bench_tally,
    bench_publish_100_members,
    bench_publish_1000_frames,
    bench_store_save,
    bench_store_load,
);
criterion_main!(benches);
