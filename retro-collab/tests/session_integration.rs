//! Session integration tests.
//!
//! Drives whole retros through the ConnectionManager with channel outboxes
//! in place of sockets:
//! - Full phase walk with clustering and tally
//! - Vote rules (identity, cap, unknown clusters)
//! - Duplicate topic texts under both matching modes
//! - Per-room serialisation under concurrent senders
//! - Room independence

use std::sync::Arc;

use retro_collab::broadcast::Frame;
use retro_collab::manager::{ConnectionHandle, ConnectionManager};
use retro_collab::protocol::{RoomId, ServerMessage};
use retro_collab::registry::{RegistryConfig, SessionRegistry};
use retro_collab::session::{Dispatched, SessionError};
use retro_collab::storage::MemoryStore;
use retro_core::{
    Action, ClusterId, Feeling, Phase, PersonSummary, RetroRules, RoomSnapshot, TopicMatching,
};
use tokio::sync::mpsc;

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn manager_with(rules: RetroRules) -> Arc<ConnectionManager> {
    let config = RegistryConfig {
        rules,
        ..RegistryConfig::default()
    };
    let registry = SessionRegistry::new(config, Arc::new(MemoryStore::new()));
    Arc::new(ConnectionManager::new(Arc::new(registry)))
}

fn manager() -> Arc<ConnectionManager> {
    manager_with(RetroRules::default())
}

struct Participant {
    handle: ConnectionHandle,
    rx: mpsc::Receiver<Frame>,
}

impl Participant {
    async fn open(manager: &ConnectionManager, room: &RoomId) -> Self {
        let (tx, rx) = mpsc::channel(512);
        let handle = manager.open(room, tx).await.unwrap();
        let mut p = Self { handle, rx };
        assert!(matches!(p.next(), ServerMessage::Init(_)));
        p
    }

    fn next(&mut self) -> ServerMessage {
        let frame = self.rx.try_recv().expect("expected a queued frame");
        ServerMessage::decode(&frame).unwrap()
    }

    fn next_init(&mut self) -> RoomSnapshot {
        match self.next() {
            ServerMessage::Init(snapshot) => snapshot,
            other => panic!("Expected init, got {other:?}"),
        }
    }

    fn drain(&mut self) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(frame) = self.rx.try_recv() {
            out.push(ServerMessage::decode(&frame).unwrap());
        }
        out
    }

    fn is_quiet(&mut self) -> bool {
        self.rx.try_recv().is_err()
    }
}

async fn act(manager: &ConnectionManager, p: &Participant, action: Action) -> Dispatched {
    manager.dispatch(&p.handle, action).await.unwrap()
}

fn topic(text: &str) -> Action {
    Action::AddTopic { text: text.into(), feeling: Feeling::Happy }
}

fn groups(gs: &[&[&str]]) -> Vec<Vec<String>> {
    gs.iter()
        .map(|g| g.iter().map(|t| t.to_string()).collect())
        .collect()
}

/// Al and Bea joined; topics a, b, c; room in grouping.
async fn grouping_room(manager: &ConnectionManager) -> (Participant, Participant) {
    let room = RoomId::generate();
    let mut al = Participant::open(manager, &room).await;
    let mut bea = Participant::open(manager, &room).await;
    act(manager, &al, Action::Join { name: "Al".into() }).await;
    act(manager, &bea, Action::Join { name: "Bea".into() }).await;
    act(manager, &al, Action::Start).await;
    for t in ["a", "b", "c"] {
        act(manager, &al, topic(t)).await;
    }
    act(manager, &al, Action::GoToGrouping).await;
    al.drain();
    bea.drain();
    (al, bea)
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_full_retro_walkthrough() {
    let m = manager();
    let (mut al, mut bea) = grouping_room(&m).await;

    let snapshot = al.handle.session().snapshot().await;
    assert_eq!(snapshot.phase, Phase::Grouping);
    for t in &snapshot.topics {
        assert!((0..=1400).contains(&t.x) && (0..=800).contains(&t.y));
    }

    act(&m, &al, Action::GoToVoting { groupings: groups(&[&["a", "b"], &["c"]]) }).await;
    let voting = bea.next_init();
    assert_eq!(voting.phase, Phase::Voting);
    assert_eq!(voting.clusters.len(), 2);
    assert_eq!(voting.clusters[0].id, ClusterId(0));
    assert_eq!(voting.clusters[0].topics, vec!["a", "b"]);
    assert_eq!(voting.clusters[1].topics, vec!["c"]);
    al.drain();

    act(&m, &al, Action::SetVotes { votes: vec![ClusterId(0), ClusterId(1)] }).await;
    act(&m, &bea, Action::SetVotes { votes: vec![ClusterId(0)] }).await;
    let updates = al.drain();
    assert_eq!(
        updates.last(),
        Some(&ServerMessage::UpdateVotes {
            people: vec![
                PersonSummary { name: "Al".into(), num_votes: 2 },
                PersonSummary { name: "Bea".into(), num_votes: 1 },
            ],
        })
    );
    bea.drain();

    act(&m, &bea, Action::GoToDiscussion).await;
    let discussion = al.next_init();
    assert_eq!(discussion.phase, Phase::Discussion);
    assert_eq!(discussion.clusters[0].votes, 2);
    assert_eq!(discussion.clusters[1].votes, 1);
    bea.drain();

    act(&m, &al, Action::AddActionItem { text: "stabilise CI".into() }).await;
    for p in [&mut al, &mut bea] {
        assert_eq!(p.next_init().actions, vec!["stabilise CI"]);
    }
}

#[tokio::test]
async fn test_unknown_topic_in_grouping_rejected_to_origin() {
    let m = manager();
    let (mut al, mut bea) = grouping_room(&m).await;

    let err = m
        .dispatch(&al.handle, Action::GoToVoting { groupings: groups(&[&["a", "ghost"]]) })
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Rejected(_)));
    match al.next() {
        ServerMessage::Error { code, .. } => assert_eq!(code, "unknownTopicReference"),
        other => panic!("Expected error, got {other:?}"),
    }
    assert!(bea.is_quiet());
    assert_eq!(al.handle.session().snapshot().await.phase, Phase::Grouping);
}

#[tokio::test]
async fn test_vote_rules() {
    let m = manager_with(RetroRules { max_votes: Some(3), ..RetroRules::default() });
    let (mut al, mut bea) = grouping_room(&m).await;
    let room = al.handle.room().clone();
    act(&m, &al, Action::GoToVoting { groupings: groups(&[&["a"], &["b", "c"]]) }).await;
    al.drain();
    bea.drain();

    // A connection that never joined cannot vote
    let mut lurker = Participant::open(&m, &room).await;
    let err = m
        .dispatch(&lurker.handle, Action::SetVotes { votes: vec![ClusterId(0)] })
        .await
        .unwrap_err();
    assert_eq!(err.code(), "unauthorizedAction");
    assert!(matches!(lurker.next(), ServerMessage::Error { .. }));
    assert!(al.is_quiet());

    let err = m
        .dispatch(&al.handle, Action::SetVotes { votes: vec![ClusterId(7)] })
        .await
        .unwrap_err();
    assert_eq!(err.code(), "unknownClusterReference");

    let err = m
        .dispatch(&al.handle, Action::SetVotes { votes: vec![ClusterId(0); 4] })
        .await
        .unwrap_err();
    assert_eq!(err.code(), "voteLimitExceeded");
    al.drain();

    // The same cluster may take several votes
    act(&m, &al, Action::SetVotes { votes: vec![ClusterId(1); 3] }).await;
    act(&m, &al, Action::GoToDiscussion).await;
    let snapshot = al.handle.session().snapshot().await;
    assert_eq!(snapshot.clusters[0].votes, 0);
    assert_eq!(snapshot.clusters[1].votes, 3);
    assert_eq!(m.rejected_count(), 3);
}

#[tokio::test]
async fn test_duplicate_texts_first_match() {
    let m = manager();
    let room = RoomId::generate();
    let al = Participant::open(&m, &room).await;
    act(&m, &al, Action::Start).await;
    act(&m, &al, topic("same")).await;
    act(&m, &al, topic("same")).await;
    act(&m, &al, Action::GoToGrouping).await;

    // Both references resolve to the first topic, so the second is rejected
    let err = m
        .dispatch(&al.handle, Action::GoToVoting { groupings: groups(&[&["same"], &["same"]]) })
        .await
        .unwrap_err();
    assert_eq!(err.code(), "unknownTopicReference");
}

#[tokio::test]
async fn test_duplicate_texts_first_unclaimed() {
    let m = manager_with(RetroRules {
        topic_matching: TopicMatching::FirstUnclaimed,
        ..RetroRules::default()
    });
    let room = RoomId::generate();
    let al = Participant::open(&m, &room).await;
    act(&m, &al, Action::Start).await;
    act(&m, &al, topic("same")).await;
    act(&m, &al, topic("same")).await;
    act(&m, &al, Action::GoToGrouping).await;

    act(&m, &al, Action::GoToVoting { groupings: groups(&[&["same"], &["same"]]) }).await;
    let room = al.handle.session().room().await;
    assert_eq!(room.clusters.len(), 2);
    assert_ne!(room.clusters[0].topics, room.clusters[1].topics);
    assert!(room.topics.iter().all(|t| t.cluster.is_some()));
}

#[tokio::test]
async fn test_concurrent_senders_are_serialised() {
    let m = manager();
    let room = RoomId::generate();
    let mut watcher = Participant::open(&m, &room).await;
    let first = Participant::open(&m, &room).await;
    act(&m, &first, Action::Start).await;
    watcher.drain();

    let mut senders = Vec::new();
    for _ in 0..8 {
        senders.push(Participant::open(&m, &room).await);
    }

    let mut tasks = Vec::new();
    for (i, p) in senders.into_iter().enumerate() {
        let m = m.clone();
        tasks.push(tokio::spawn(async move {
            for n in 0..10 {
                m.dispatch(&p.handle, topic(&format!("{i}-{n}"))).await.unwrap();
            }
            p
        }));
    }
    let mut senders = Vec::new();
    for t in tasks {
        senders.push(t.await.unwrap());
    }

    let observed = watcher.drain();
    assert_eq!(observed.len(), 80);
    let room_topics: Vec<String> = watcher
        .handle
        .session()
        .snapshot()
        .await
        .topics
        .into_iter()
        .map(|t| t.text)
        .collect();
    let broadcast_topics: Vec<String> = observed
        .into_iter()
        .map(|msg| match msg {
            ServerMessage::AddTopic { text, .. } => text,
            other => panic!("Expected addTopic, got {other:?}"),
        })
        .collect();
    // Every connection saw the same total order the room applied
    assert_eq!(broadcast_topics, room_topics);
    for p in &mut senders {
        let texts: Vec<String> = p
            .drain()
            .into_iter()
            .map(|msg| match msg {
                ServerMessage::AddTopic { text, .. } => text,
                other => panic!("Expected addTopic, got {other:?}"),
            })
            .collect();
        assert_eq!(texts, broadcast_topics);
    }
}

#[tokio::test]
async fn test_rooms_progress_independently() {
    let m = manager();
    let one = Participant::open(&m, &RoomId::parse("one").unwrap()).await;
    let mut two = Participant::open(&m, &RoomId::parse("two").unwrap()).await;

    act(&m, &one, Action::Start).await;
    assert!(two.is_quiet());
    assert_eq!(two.handle.session().snapshot().await.phase, Phase::Joining);
    assert_eq!(m.registry().room_count().await, 2);
}

#[tokio::test]
async fn test_closed_connection_leaves_contributions() {
    let m = manager();
    let room = RoomId::generate();
    let al = Participant::open(&m, &room).await;
    let mut bea = Participant::open(&m, &room).await;
    act(&m, &al, Action::Join { name: "Al".into() }).await;
    act(&m, &al, Action::Start).await;
    act(&m, &al, topic("kept")).await;
    bea.drain();

    let session = al.handle.session().clone();
    m.close(al.handle).await;
    assert_eq!(session.connection_count().await, 1);

    act(&m, &bea, topic("more")).await;
    assert_eq!(bea.next(), ServerMessage::AddTopic { list: Feeling::Happy, text: "more".into() });
    let snapshot = session.snapshot().await;
    assert_eq!(snapshot.people[0].name, "Al");
    assert_eq!(snapshot.topics.len(), 2);
}
