mod matching;
mod model;

pub use matching::{forbidden_map, MatchError, Matcher, DEFAULT_MAX_ATTEMPTS};
pub use model::{
    Assignment, AssignmentViolation, Comment, ForbiddenMap, GameState, ModelError, Participant,
    ParticipantId, Phase, Restriction, Wish,
};
