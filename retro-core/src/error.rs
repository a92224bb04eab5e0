use thiserror::Error;

use crate::model::{ClusterId, Phase};

/// Reasons the state machine rejects an action.
///
/// None of these are fatal to the room: a rejected action leaves the room
/// exactly as it was and only the originating connection is told.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RetroError {
    #[error("{action} is not valid while the room is {phase}")]
    IllegalActionForState { action: &'static str, phase: Phase },

    #[error("Unknown topic reference: {0:?}")]
    UnknownTopicReference(String),

    #[error("Unknown cluster reference: {0}")]
    UnknownClusterReference(ClusterId),

    #[error("{0} requires joining the retro first")]
    UnauthorizedAction(&'static str),

    #[error("{requested} votes exceeds the limit of {limit}")]
    VoteLimitExceeded { limit: usize, requested: usize },
}

impl RetroError {
    /// Stable wire code for error replies.
    pub fn code(&self) -> &'static str {
        match self {
            RetroError::IllegalActionForState { .. } => "illegalActionForState",
            RetroError::UnknownTopicReference(_) => "unknownTopicReference",
            RetroError::UnknownClusterReference(_) => "unknownClusterReference",
            RetroError::UnauthorizedAction(_) => "unauthorizedAction",
            RetroError::VoteLimitExceeded { .. } => "voteLimitExceeded",
        }
    }

    /// Out-of-phase actions are dropped without telling anyone, so replayed
    /// or late client messages stay harmless.
    pub fn is_silent(&self) -> bool {
        matches!(self, RetroError::IllegalActionForState { .. })
    }
}
