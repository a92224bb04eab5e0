//! # retro-core — Retrospective room model and state machine
//!
//! Pure, synchronous domain logic for one retrospective room. No async
//! runtime and no I/O: the collaboration layer in `retro-collab` owns
//! serialisation of actions and fan-out of the resulting events.
//!
//! ## Modules
//!
//! - [`model`] — Room aggregate, topics, clusters, votes and the tally
//! - [`machine`] — Phase transitions, action table, emitted events
//! - [`error`] — Rejection reasons

pub mod error;
pub mod machine;
pub mod model;

pub use error::RetroError;
pub use machine::{
    Action, Audience, ClusterView, Emit, Event, PersonSummary, RetroMachine, RetroRules,
    RoomSnapshot, TopicView,
};
pub use model::{
    ActionItem, Cluster, ClusterId, Feeling, Person, Phase, Position, Room, Topic, TopicId,
    TopicMatching, Workspace,
};
