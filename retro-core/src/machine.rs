//! Retro state machine: legality and effect of every action on one room.
//!
//! ```text
//! Joining ──start──► Brainstorming ──goToGrouping──► Grouping
//!                                                       │
//!                                                  goToVoting
//!                                                       ▼
//!                   Discussion ◄──goToDiscussion──── Voting
//! ```
//!
//! `join` is accepted in every phase. Any other action arriving in the wrong
//! phase is rejected with [`RetroError::IllegalActionForState`] before the
//! room is touched; callers drop that error without emitting anything.
//!
//! The machine assumes exclusive access. Serialising actions per room is the
//! caller's job.

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::error::RetroError;
use crate::model::{ClusterId, Feeling, Phase, Position, Room, TopicMatching, Workspace};

// ───────────────────────────────────────────────────────────────────
// Vocabulary
// ───────────────────────────────────────────────────────────────────

/// A typed request to mutate a room, originating from one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Join { name: String },
    Start,
    AddTopic { text: String, feeling: Feeling },
    GoToGrouping,
    MoveTopic { text: String, x: i32, y: i32 },
    GoToVoting { groupings: Vec<Vec<String>> },
    SetVotes { votes: Vec<ClusterId> },
    GoToDiscussion,
    AddActionItem { text: String },
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::Join { .. } => "join",
            Action::Start => "start",
            Action::AddTopic { .. } => "addTopic",
            Action::GoToGrouping => "goToGrouping",
            Action::MoveTopic { .. } => "moveTopic",
            Action::GoToVoting { .. } => "goToVoting",
            Action::SetVotes { .. } => "setVotes",
            Action::GoToDiscussion => "goToDiscussion",
            Action::AddActionItem { .. } => "addAction",
        }
    }

    /// The only phase this action is valid in; `None` means any phase.
    pub fn required_phase(&self) -> Option<Phase> {
        match self {
            Action::Join { .. } => None,
            Action::Start => Some(Phase::Joining),
            Action::AddTopic { .. } | Action::GoToGrouping => Some(Phase::Brainstorming),
            Action::MoveTopic { .. } | Action::GoToVoting { .. } => Some(Phase::Grouping),
            Action::SetVotes { .. } | Action::GoToDiscussion => Some(Phase::Voting),
            Action::AddActionItem { .. } => Some(Phase::Discussion),
        }
    }

    /// Live drags are not worth a durable write each.
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, Action::MoveTopic { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonSummary {
    pub name: String,
    pub num_votes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicView {
    pub text: String,
    pub feeling: Feeling,
    pub x: i32,
    pub y: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterView {
    pub id: ClusterId,
    pub topics: Vec<String>,
    pub votes: u32,
}

/// Full view of a room, sent on connect and after every phase change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSnapshot {
    #[serde(rename = "state")]
    pub phase: Phase,
    pub people: Vec<PersonSummary>,
    pub topics: Vec<TopicView>,
    pub clusters: Vec<ClusterView>,
    pub actions: Vec<String>,
}

impl RoomSnapshot {
    pub fn of(room: &Room) -> Self {
        Self {
            phase: room.phase,
            people: people_summary(room),
            topics: room
                .topics
                .iter()
                .map(|t| TopicView {
                    text: t.text.clone(),
                    feeling: t.feeling,
                    x: t.position.x,
                    y: t.position.y,
                })
                .collect(),
            clusters: room
                .clusters
                .iter()
                .map(|c| ClusterView {
                    id: c.id,
                    topics: room.cluster_texts(c),
                    votes: c.votes,
                })
                .collect(),
            actions: room.action_items.iter().map(|a| a.text.clone()).collect(),
        }
    }
}

fn people_summary(room: &Room) -> Vec<PersonSummary> {
    room.people
        .iter()
        .map(|p| PersonSummary {
            name: p.name.clone(),
            num_votes: p.num_votes(),
        })
        .collect()
}

/// A typed notification of a state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    PersonJoined { name: String },
    RoomSynced(RoomSnapshot),
    TopicAdded { text: String, feeling: Feeling },
    TopicMoved { text: String, x: i32, y: i32 },
    VotesUpdated { people: Vec<PersonSummary> },
}

/// Who receives an emitted event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    /// Every connection currently in the room, originator included.
    Room,
    /// Only the connection whose action produced the event.
    Origin,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Emit {
    pub audience: Audience,
    pub event: Event,
}

impl Emit {
    pub fn room(event: Event) -> Self {
        Self { audience: Audience::Room, event }
    }

    pub fn origin(event: Event) -> Self {
        Self { audience: Audience::Origin, event }
    }
}

/// Opt-in validation on top of the observed behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RetroRules {
    /// Cap on votes per person. `None` accepts any number.
    pub max_votes: Option<usize>,
    pub topic_matching: TopicMatching,
}

// ───────────────────────────────────────────────────────────────────
// Machine
// ───────────────────────────────────────────────────────────────────

pub struct RetroMachine {
    room: Room,
    rules: RetroRules,
    workspace: Workspace,
    rng: StdRng,
}

impl RetroMachine {
    /// A machine over a fresh room in the joining phase.
    pub fn new(rules: RetroRules, workspace: Workspace) -> Self {
        Self::from_room(Room::new(), rules, workspace)
    }

    /// Resume a machine over a previously stored room.
    pub fn from_room(room: Room, rules: RetroRules, workspace: Workspace) -> Self {
        Self {
            room,
            rules,
            workspace,
            rng: StdRng::from_entropy(),
        }
    }

    /// Fix the position generator, for reproducible layouts.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn room(&self) -> &Room {
        &self.room
    }

    pub fn phase(&self) -> Phase {
        self.room.phase
    }

    pub fn rules(&self) -> RetroRules {
        self.rules
    }

    pub fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot::of(&self.room)
    }

    /// Validate and apply one action.
    ///
    /// `identity` is the name the originating connection joined with, if any.
    /// On error the room is unchanged.
    pub fn apply(&mut self, identity: Option<&str>, action: Action) -> Result<Vec<Emit>, RetroError> {
        if let Some(required) = action.required_phase() {
            if required != self.room.phase {
                return Err(RetroError::IllegalActionForState {
                    action: action.name(),
                    phase: self.room.phase,
                });
            }
        }

        match action {
            Action::Join { name } => {
                if !self.room.add_person(&name) {
                    log::debug!("{name} rejoined");
                }
                let mut emits = vec![Emit::room(Event::PersonJoined { name })];
                if self.room.phase != Phase::Joining {
                    emits.push(Emit::origin(Event::RoomSynced(self.snapshot())));
                }
                Ok(emits)
            }

            Action::Start => {
                self.advance(Phase::Brainstorming);
                Ok(vec![self.synced()])
            }

            Action::AddTopic { text, feeling } => {
                self.room.add_topic(text.clone(), feeling);
                Ok(vec![Emit::room(Event::TopicAdded { text, feeling })])
            }

            Action::GoToGrouping => {
                self.room.assign_initial_positions(self.workspace, &mut self.rng);
                self.advance(Phase::Grouping);
                Ok(vec![self.synced()])
            }

            Action::MoveTopic { text, x, y } => {
                self.room
                    .move_topic(&text, Position::new(x, y), self.rules.topic_matching)?;
                Ok(vec![Emit::room(Event::TopicMoved { text, x, y })])
            }

            Action::GoToVoting { groupings } => {
                let created = self
                    .room
                    .partition_into_clusters(&groupings, self.rules.topic_matching)?;
                log::debug!("Partitioned topics into {created} clusters");
                self.advance(Phase::Voting);
                Ok(vec![self.synced()])
            }

            Action::SetVotes { votes } => {
                let name = identity.ok_or(RetroError::UnauthorizedAction("setVotes"))?;
                if let Some(limit) = self.rules.max_votes {
                    if votes.len() > limit {
                        return Err(RetroError::VoteLimitExceeded {
                            limit,
                            requested: votes.len(),
                        });
                    }
                }
                self.room.set_votes(name, votes)?;
                Ok(vec![Emit::room(Event::VotesUpdated {
                    people: people_summary(&self.room),
                })])
            }

            Action::GoToDiscussion => {
                self.room.tally();
                self.advance(Phase::Discussion);
                Ok(vec![self.synced()])
            }

            Action::AddActionItem { text } => {
                self.room.add_action_item(text);
                Ok(vec![self.synced()])
            }
        }
    }

    fn advance(&mut self, to: Phase) {
        debug_assert_eq!(self.room.phase.next(), Some(to));
        log::debug!("Phase {} -> {}", self.room.phase, to);
        self.room.phase = to;
    }

    fn synced(&self) -> Emit {
        Emit::room(Event::RoomSynced(self.snapshot()))
    }
}
