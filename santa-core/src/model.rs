use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use thiserror::Error;

pub type ForbiddenMap = HashMap<ParticipantId, HashSet<ParticipantId>>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("identifier must not be empty")]
    EmptyIdentifier,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(raw: impl Into<String>) -> Result<Self, ModelError> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ModelError::EmptyIdentifier);
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ParticipantId {
    type Error = ModelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ParticipantId> for String {
    fn from(id: ParticipantId) -> Self {
        id.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Participant {
    pub id: ParticipantId,
    pub display_name: String,
    pub handle: Option<String>,
}

impl Participant {
    pub fn label(&self) -> String {
        match &self.handle {
            Some(handle) => format!("{} (@{})", self.display_name, handle),
            None => self.display_name.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Restriction {
    pub subject: ParticipantId,
    pub forbidden: ParticipantId,
    pub creator: Option<ParticipantId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Wish {
    pub participant: ParticipantId,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Comment {
    pub receiver: ParticipantId,
    pub author: ParticipantId,
    pub text: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Open,
    Generated,
    Revealed,
}

#[derive(Serialize, Deserialize)]
struct GameStateRepr {
    generated: bool,
    revealed: bool,
}

/// Persisted phase flags. `revealed` always implies `generated`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "GameStateRepr", into = "GameStateRepr")]
pub struct GameState {
    generated: bool,
    revealed: bool,
}

impl GameState {
    pub fn new(generated: bool, revealed: bool) -> Self {
        Self {
            generated: generated || revealed,
            revealed,
        }
    }

    pub fn from_phase(phase: Phase) -> Self {
        match phase {
            Phase::Open => Self::new(false, false),
            Phase::Generated => Self::new(true, false),
            Phase::Revealed => Self::new(true, true),
        }
    }

    pub fn is_generated(&self) -> bool {
        self.generated
    }

    pub fn is_revealed(&self) -> bool {
        self.revealed
    }

    pub fn phase(&self) -> Phase {
        match (self.generated, self.revealed) {
            (_, true) => Phase::Revealed,
            (true, false) => Phase::Generated,
            (false, false) => Phase::Open,
        }
    }
}

impl From<GameStateRepr> for GameState {
    fn from(repr: GameStateRepr) -> Self {
        Self::new(repr.generated, repr.revealed)
    }
}

impl From<GameState> for GameStateRepr {
    fn from(state: GameState) -> Self {
        Self {
            generated: state.generated,
            revealed: state.revealed,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AssignmentViolation {
    #[error("participant {0} has no receiver")]
    MissingGiver(ParticipantId),
    #[error("giver {0} is not a participant")]
    UnknownGiver(ParticipantId),
    #[error("receiver {0} is not a participant")]
    UnknownReceiver(ParticipantId),
    #[error("receiver {0} is assigned more than once")]
    DuplicateReceiver(ParticipantId),
    #[error("participant {0} is assigned to themselves")]
    SelfAssignment(ParticipantId),
    #[error("{giver} must not give to {receiver}")]
    Forbidden {
        giver: ParticipantId,
        receiver: ParticipantId,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Assignment {
    pairs: BTreeMap<ParticipantId, ParticipantId>,
}

impl Assignment {
    pub fn from_pairs(pairs: impl IntoIterator<Item = (ParticipantId, ParticipantId)>) -> Self {
        Self {
            pairs: pairs.into_iter().collect(),
        }
    }

    pub fn receiver_for(&self, giver: &ParticipantId) -> Option<&ParticipantId> {
        self.pairs.get(giver)
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ParticipantId, &ParticipantId)> {
        self.pairs.iter()
    }

    pub fn verify(
        &self,
        participants: &BTreeSet<ParticipantId>,
        forbidden: &ForbiddenMap,
    ) -> Result<(), AssignmentViolation> {
        if let Some(missing) = participants.iter().find(|p| !self.pairs.contains_key(*p)) {
            return Err(AssignmentViolation::MissingGiver(missing.clone()));
        }

        let mut seen = HashSet::new();
        for (giver, receiver) in &self.pairs {
            if !participants.contains(giver) {
                return Err(AssignmentViolation::UnknownGiver(giver.clone()));
            }
            if !participants.contains(receiver) {
                return Err(AssignmentViolation::UnknownReceiver(receiver.clone()));
            }
            if giver == receiver {
                return Err(AssignmentViolation::SelfAssignment(giver.clone()));
            }
            if !seen.insert(receiver) {
                return Err(AssignmentViolation::DuplicateReceiver(receiver.clone()));
            }
            if forbidden
                .get(giver)
                .is_some_and(|blocked| blocked.contains(receiver))
            {
                return Err(AssignmentViolation::Forbidden {
                    giver: giver.clone(),
                    receiver: receiver.clone(),
                });
            }
        }
        Ok(())
    }
}

impl FromIterator<(ParticipantId, ParticipantId)> for Assignment {
    fn from_iter<T: IntoIterator<Item = (ParticipantId, ParticipantId)>>(iter: T) -> Self {
        Self::from_pairs(iter)
    }
}
