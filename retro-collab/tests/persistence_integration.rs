//! Persistence integration tests.
//!
//! Verifies:
//! - Room state survives a restart through the full registry stack
//! - Room records gate connections when auto-create is off
//! - Eviction saves rooms and reloads them on next use
//! - Topic drags are not written individually

use std::sync::Arc;
use std::time::Duration;

use retro_collab::broadcast::Frame;
use retro_collab::manager::{ConnectionHandle, ConnectionManager};
use retro_collab::protocol::RoomId;
use retro_collab::registry::{IdleTimeout, RegistryConfig, SessionRegistry};
use retro_collab::session::SessionError;
use retro_collab::storage::{RocksStore, RoomStore, StoreConfig};
use retro_core::{Action, ClusterId, Feeling, Phase, Position};
use tempfile::tempdir;
use tokio::sync::mpsc;

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn open_store(path: &std::path::Path) -> Arc<RocksStore> {
    Arc::new(RocksStore::open(StoreConfig::for_testing(path)).unwrap())
}

fn manager(store: Arc<RocksStore>, auto_create: bool) -> ConnectionManager {
    let config = RegistryConfig {
        auto_create_rooms: auto_create,
        ..RegistryConfig::default()
    };
    ConnectionManager::new(Arc::new(SessionRegistry::new(config, store)))
}

async fn open(m: &ConnectionManager, room: &RoomId) -> (ConnectionHandle, mpsc::Receiver<Frame>) {
    let (tx, rx) = mpsc::channel(256);
    (m.open(room, tx).await.unwrap(), rx)
}

async fn act(m: &ConnectionManager, handle: &ConnectionHandle, action: Action) {
    m.dispatch(handle, action).await.unwrap();
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_room_survives_restart() {
    let dir = tempdir().unwrap();
    let room = RoomId::parse("durable-retro").unwrap();

    {
        let store = open_store(dir.path());
        let m = manager(store.clone(), true);
        let (al, _rx) = open(&m, &room).await;
        act(&m, &al, Action::Join { name: "Al".into() }).await;
        act(&m, &al, Action::Start).await;
        act(&m, &al, Action::AddTopic { text: "deploys".into(), feeling: Feeling::Confused }).await;
        act(&m, &al, Action::GoToGrouping).await;
        act(&m, &al, Action::GoToVoting { groupings: vec![vec!["deploys".into()]] }).await;
        act(&m, &al, Action::SetVotes { votes: vec![ClusterId(0), ClusterId(0)] }).await;
        m.close(al).await;
        store.sync().unwrap();
    }

    let store = open_store(dir.path());
    let registry = SessionRegistry::new(RegistryConfig::default(), store);
    assert_eq!(registry.recover().await.unwrap(), 1);

    let session = registry.get(&room).await.unwrap();
    let restored = session.room().await;
    assert_eq!(restored.phase, Phase::Voting);
    assert_eq!(restored.people[0].name, "Al");
    assert_eq!(restored.people[0].votes, vec![ClusterId(0), ClusterId(0)]);
    assert_eq!(restored.topics[0].feeling, Feeling::Confused);
    assert_eq!(restored.topics[0].cluster, Some(ClusterId(0)));
    assert_eq!(restored.clusters.len(), 1);
}

#[tokio::test]
async fn test_restored_room_continues_phase_walk() {
    let dir = tempdir().unwrap();
    let room = RoomId::parse("continue").unwrap();

    {
        let m = manager(open_store(dir.path()), true);
        let (al, _rx) = open(&m, &room).await;
        act(&m, &al, Action::Start).await;
        act(&m, &al, Action::AddTopic { text: "a".into(), feeling: Feeling::Happy }).await;
        m.close(al).await;
    }

    let m = manager(open_store(dir.path()), false);
    let (al, _rx) = open(&m, &room).await;
    act(&m, &al, Action::AddTopic { text: "b".into(), feeling: Feeling::Sad }).await;
    act(&m, &al, Action::GoToGrouping).await;

    let room = al.session().room().await;
    assert_eq!(room.phase, Phase::Grouping);
    let ids: Vec<u32> = room.topics.iter().map(|t| t.id.0).collect();
    assert_eq!(ids, vec![0, 1]);
}

#[tokio::test]
async fn test_records_gate_connections() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    let m = manager(store.clone(), false);

    let err = m
        .open(&RoomId::parse("unknown").unwrap(), mpsc::channel(4).0)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, SessionError::UnknownRoom(_)));

    let created = m.registry().create_room().await.unwrap();
    assert!(store.exists(&created).unwrap());
    let meta = store.load_metadata(&created).unwrap().unwrap();
    assert_eq!(meta.phase, Phase::Joining);
    assert_eq!(meta.room_id, created.as_str());

    let (handle, _rx) = open(&m, &created).await;
    assert_eq!(handle.room(), &created);
}

#[tokio::test]
async fn test_moves_are_not_written_individually() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    let m = manager(store.clone(), true);
    let room = RoomId::parse("drags").unwrap();

    let (al, _rx) = open(&m, &room).await;
    act(&m, &al, Action::Start).await;
    act(&m, &al, Action::AddTopic { text: "t".into(), feeling: Feeling::Happy }).await;
    act(&m, &al, Action::GoToGrouping).await;
    let before = store.load_metadata(&room).unwrap().unwrap().revision;

    for i in 0..10 {
        act(&m, &al, Action::MoveTopic { text: "t".into(), x: i, y: i }).await;
    }
    assert_eq!(store.load_metadata(&room).unwrap().unwrap().revision, before);

    // Leaving the room writes the final position
    m.close(al).await;
    let meta = store.load_metadata(&room).unwrap().unwrap();
    assert_eq!(meta.revision, before + 1);
    let saved = store.load(&room).unwrap().unwrap();
    assert_eq!(saved.topics[0].position, Position::new(9, 9));
}

#[tokio::test]
async fn test_eviction_saves_and_reloads() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    let registry = Arc::new(
        SessionRegistry::new(RegistryConfig::default(), store.clone())
            .with_eviction(Arc::new(IdleTimeout(Duration::ZERO))),
    );
    let m = ConnectionManager::new(registry.clone());
    let room = RoomId::parse("idle").unwrap();

    let (al, _rx) = open(&m, &room).await;
    act(&m, &al, Action::Join { name: "Al".into() }).await;

    // Connected rooms are never evicted
    assert!(registry.evict_idle().await.is_empty());

    m.close(al).await;
    assert_eq!(registry.evict_idle().await, vec![room.clone()]);
    assert_eq!(registry.room_count().await, 0);

    let (again, _rx) = open(&m, &room).await;
    assert_eq!(again.session().room().await.people[0].name, "Al");
    assert_eq!(registry.room_count().await, 1);
}
