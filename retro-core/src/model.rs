//! Room aggregate: people, topics, clusters, action items and the vote tally.
//!
//! ```text
//! Room
//!  ├── people ──────── Person { name, votes: [ClusterId] }
//!  ├── topics ──────── Topic  { id, text, feeling, position, cluster? }
//!  ├── clusters ────── Cluster { id, topics: [TopicId], votes }
//!  └── action_items ── ActionItem { text }
//! ```
//!
//! Topics carry a dense per-room [`TopicId`]. The wire protocol still names
//! topics by their text, so every text lookup goes through
//! [`Room::resolve_topic`] and the configured [`TopicMatching`] mode.

use std::collections::HashSet;
use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::RetroError;

// ───────────────────────────────────────────────────────────────────
// Identifiers and small value types
// ───────────────────────────────────────────────────────────────────

/// Stable identifier of a topic, unique within its room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TopicId(pub u32);

/// Identifier of a cluster, dense and zero-based within its room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterId(pub u32);

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The room's position in the fixed five-stage sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Joining,
    Brainstorming,
    Grouping,
    Voting,
    Discussion,
}

impl Phase {
    /// Every phase in visiting order.
    pub const ALL: [Phase; 5] = [
        Phase::Joining,
        Phase::Brainstorming,
        Phase::Grouping,
        Phase::Voting,
        Phase::Discussion,
    ];

    /// The phase that follows this one, `None` for the terminal phase.
    pub fn next(self) -> Option<Phase> {
        match self {
            Phase::Joining => Some(Phase::Brainstorming),
            Phase::Brainstorming => Some(Phase::Grouping),
            Phase::Grouping => Some(Phase::Voting),
            Phase::Voting => Some(Phase::Discussion),
            Phase::Discussion => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Joining => "joining",
            Phase::Brainstorming => "brainstorming",
            Phase::Grouping => "grouping",
            Phase::Voting => "voting",
            Phase::Discussion => "discussion",
        }
    }

    pub fn is_terminal(self) -> bool {
        self.next().is_none()
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which column a topic was brainstormed into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Feeling {
    Happy,
    Sad,
    Confused,
}

impl Feeling {
    pub const ALL: [Feeling; 3] = [Feeling::Happy, Feeling::Sad, Feeling::Confused];

    pub fn as_str(self) -> &'static str {
        match self {
            Feeling::Happy => "happy",
            Feeling::Sad => "sad",
            Feeling::Confused => "confused",
        }
    }
}

impl fmt::Display for Feeling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Topic position on the grouping canvas, in canvas pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
    pub x: i32,
    pub y: i32,
}

impl Position {
    /// Where topics sit before the grouping phase places them.
    pub const UNPLACED: Position = Position { x: -1, y: -1 };

    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

impl Default for Position {
    fn default() -> Self {
        Self::UNPLACED
    }
}

/// Bounds of the grouping canvas. Initial positions fall in
/// `[0, width] × [0, height]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    pub width: i32,
    pub height: i32,
}

impl Workspace {
    pub fn new(width: i32, height: i32) -> Self {
        Self { width, height }
    }

    pub fn contains(&self, pos: Position) -> bool {
        (0..=self.width).contains(&pos.x) && (0..=self.height).contains(&pos.y)
    }
}

impl Default for Workspace {
    fn default() -> Self {
        Self { width: 1400, height: 800 }
    }
}

/// How wire-level topic text is resolved to a [`TopicId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TopicMatching {
    /// The first topic with the given text, whatever else referenced it.
    #[default]
    FirstMatch,
    /// The first topic with the given text that has not already been
    /// claimed by the same operation, so duplicated texts can each be placed.
    FirstUnclaimed,
}

// ───────────────────────────────────────────────────────────────────
// Entities
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Person {
    pub name: String,
    /// Cluster ids this person voted for. One entry per vote, so a cluster
    /// may appear more than once.
    pub votes: Vec<ClusterId>,
}

impl Person {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            votes: Vec::new(),
        }
    }

    pub fn num_votes(&self) -> usize {
        self.votes.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topic {
    pub id: TopicId,
    pub text: String,
    pub feeling: Feeling,
    pub position: Position,
    pub cluster: Option<ClusterId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    pub id: ClusterId,
    pub topics: Vec<TopicId>,
    /// Derived from people's votes by [`Room::tally`]; never updated incrementally.
    pub votes: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionItem {
    pub text: String,
}

// ───────────────────────────────────────────────────────────────────
// Room aggregate
// ───────────────────────────────────────────────────────────────────

/// One retrospective's full shared state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub phase: Phase,
    pub people: Vec<Person>,
    pub topics: Vec<Topic>,
    pub clusters: Vec<Cluster>,
    pub action_items: Vec<ActionItem>,
    next_topic_id: u32,
}

impl Default for Room {
    fn default() -> Self {
        Self::new()
    }
}

impl Room {
    /// An empty room in the joining phase.
    pub fn new() -> Self {
        Self {
            phase: Phase::Joining,
            people: Vec::new(),
            topics: Vec::new(),
            clusters: Vec::new(),
            action_items: Vec::new(),
            next_topic_id: 0,
        }
    }

    pub fn person(&self, name: &str) -> Option<&Person> {
        self.people.iter().find(|p| p.name == name)
    }

    /// Appends a person unless one with that name is already present.
    /// Returns `true` if the person was added.
    pub fn add_person(&mut self, name: &str) -> bool {
        if self.person(name).is_some() {
            return false;
        }
        self.people.push(Person::new(name));
        true
    }

    pub fn topic(&self, id: TopicId) -> Option<&Topic> {
        self.topics.iter().find(|t| t.id == id)
    }

    fn topic_mut(&mut self, id: TopicId) -> Option<&mut Topic> {
        self.topics.iter_mut().find(|t| t.id == id)
    }

    pub fn cluster(&self, id: ClusterId) -> Option<&Cluster> {
        self.clusters.iter().find(|c| c.id == id)
    }

    pub fn add_topic(&mut self, text: impl Into<String>, feeling: Feeling) -> TopicId {
        let id = TopicId(self.next_topic_id);
        self.next_topic_id += 1;
        self.topics.push(Topic {
            id,
            text: text.into(),
            feeling,
            position: Position::UNPLACED,
            cluster: None,
        });
        id
    }

    /// Resolve wire text to a topic id. `claimed` holds ids already taken by
    /// the operation in progress; it only matters for
    /// [`TopicMatching::FirstUnclaimed`].
    pub fn resolve_topic(
        &self,
        text: &str,
        matching: TopicMatching,
        claimed: &HashSet<TopicId>,
    ) -> Option<TopicId> {
        let mut candidates = self.topics.iter().filter(|t| t.text == text);
        match matching {
            TopicMatching::FirstMatch => candidates.next().map(|t| t.id),
            TopicMatching::FirstUnclaimed => candidates
                .find(|t| !claimed.contains(&t.id))
                .map(|t| t.id),
        }
    }

    /// Moves the topic named by `text`. Fails if no topic has that text.
    pub fn move_topic(
        &mut self,
        text: &str,
        position: Position,
        matching: TopicMatching,
    ) -> Result<TopicId, RetroError> {
        let id = self
            .resolve_topic(text, matching, &HashSet::new())
            .ok_or_else(|| RetroError::UnknownTopicReference(text.to_string()))?;
        if let Some(topic) = self.topic_mut(id) {
            topic.position = position;
        }
        Ok(id)
    }

    /// Give every topic a uniformly random position within `bounds`.
    ///
    /// Topics may overlap each other and the canvas edge.
    pub fn assign_initial_positions<R: Rng + ?Sized>(&mut self, bounds: Workspace, rng: &mut R) {
        let width = bounds.width.max(0);
        let height = bounds.height.max(0);
        for topic in &mut self.topics {
            topic.position = Position {
                x: rng.gen_range(0..=width),
                y: rng.gen_range(0..=height),
            };
        }
    }

    /// Create one cluster per grouping, in submission order, with ids `0..n`.
    ///
    /// Every text must resolve to an existing topic that is not clustered yet
    /// (including by an earlier grouping of the same call). Validation runs
    /// over the whole submission before anything is mutated, so a failure
    /// leaves the room untouched.
    pub fn partition_into_clusters(
        &mut self,
        groupings: &[Vec<String>],
        matching: TopicMatching,
    ) -> Result<usize, RetroError> {
        let mut claimed: HashSet<TopicId> = HashSet::new();
        let mut resolved: Vec<Vec<TopicId>> = Vec::with_capacity(groupings.len());

        for grouping in groupings {
            let mut members = Vec::with_capacity(grouping.len());
            for text in grouping {
                let id = self
                    .resolve_topic(text, matching, &claimed)
                    .ok_or_else(|| RetroError::UnknownTopicReference(text.clone()))?;
                let already_clustered = self.topic(id).is_some_and(|t| t.cluster.is_some());
                if already_clustered || !claimed.insert(id) {
                    return Err(RetroError::UnknownTopicReference(text.clone()));
                }
                members.push(id);
            }
            resolved.push(members);
        }

        let base = self.clusters.len() as u32;
        for (offset, members) in resolved.into_iter().enumerate() {
            let cluster_id = ClusterId(base + offset as u32);
            for id in &members {
                if let Some(topic) = self.topic_mut(*id) {
                    topic.cluster = Some(cluster_id);
                }
            }
            self.clusters.push(Cluster {
                id: cluster_id,
                topics: members,
                votes: 0,
            });
        }
        Ok(groupings.len())
    }

    /// Replace a person's votes. Every id must name a cluster in this room.
    pub fn set_votes(&mut self, name: &str, votes: Vec<ClusterId>) -> Result<(), RetroError> {
        if let Some(unknown) = votes.iter().find(|id| self.cluster(**id).is_none()) {
            return Err(RetroError::UnknownClusterReference(*unknown));
        }
        let person = self
            .people
            .iter_mut()
            .find(|p| p.name == name)
            .ok_or(RetroError::UnauthorizedAction("setVotes"))?;
        person.votes = votes;
        Ok(())
    }

    /// Recompute every cluster's vote count from scratch.
    pub fn tally(&mut self) {
        for cluster in &mut self.clusters {
            cluster.votes = 0;
        }
        for person in &self.people {
            for vote in &person.votes {
                match self.clusters.iter_mut().find(|c| c.id == *vote) {
                    Some(cluster) => cluster.votes += 1,
                    None => log::warn!("{} voted for missing cluster {vote}", person.name),
                }
            }
        }
    }

    pub fn add_action_item(&mut self, text: impl Into<String>) {
        self.action_items.push(ActionItem { text: text.into() });
    }

    /// Topic texts of a cluster, in membership order.
    pub fn cluster_texts(&self, cluster: &Cluster) -> Vec<String> {
        cluster
            .topics
            .iter()
            .filter_map(|id| self.topic(*id))
            .map(|t| t.text.clone())
            .collect()
    }
}
