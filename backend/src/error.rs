use santa_core::{MatchError, ParticipantId};
use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum SantaError {
    #[error("storage unavailable: {0}")]
    Store(#[from] StoreError),

    #[error("invalid participant id {0:?}: ids must be non-empty and must not contain ':'")]
    InvalidIdentifier(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("participant {0} is not registered")]
    ParticipantNotFound(ParticipantId),

    #[error("there is no restriction keeping {subject} from receiving {forbidden}")]
    RestrictionNotFound {
        subject: ParticipantId,
        forbidden: ParticipantId,
    },

    #[error("participant {0} has no assignment")]
    AssignmentNotFound(ParticipantId),

    #[error("at least 2 participants are needed to generate a matching (currently {count})")]
    InsufficientParticipants { count: usize },

    #[error(
        "no valid matching found after {attempts} attempts; \
         there may be too many restrictions, try removing or relaxing some of them"
    )]
    NoValidMatchingFound { attempts: u32 },

    #[error("restriction already exists: {subject} will not receive {forbidden}")]
    DuplicateRestriction {
        subject: ParticipantId,
        forbidden: ParticipantId,
    },

    #[error("a participant cannot be restricted from receiving themselves")]
    SelfRestriction,

    #[error("a participant cannot leave a gift hint about themselves")]
    SelfComment,

    #[error("not authorized to perform this operation")]
    NotAuthorized,

    #[error("no matching has been generated yet")]
    NotGenerated,

    #[error("results have not been revealed yet")]
    NotRevealed,

    #[error("participants cannot be removed once the matching is generated; reset the game first")]
    GameLocked,
}

impl From<MatchError> for SantaError {
    fn from(err: MatchError) -> Self {
        match err {
            MatchError::InsufficientParticipants { count } => {
                Self::InsufficientParticipants { count }
            }
            MatchError::NoValidMatchingFound { attempts } => Self::NoValidMatchingFound { attempts },
        }
    }
}

pub type Result<T> = std::result::Result<T, SantaError>;
