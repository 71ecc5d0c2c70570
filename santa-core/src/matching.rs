use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::BTreeSet;
use thiserror::Error;

use crate::model::{Assignment, ForbiddenMap, ParticipantId, Restriction};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 1000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MatchError {
    #[error("at least 2 participants required, found {count}")]
    InsufficientParticipants { count: usize },
    #[error("no valid matching found after {attempts} attempts")]
    NoValidMatchingFound { attempts: u32 },
}

/// Rejection sampler bounded by `max_attempts`: a valid matching may go
/// unfound, an invalid one is never returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Matcher {
    max_attempts: u32,
}

impl Default for Matcher {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl Matcher {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn generate<R: Rng + ?Sized>(
        &self,
        participants: &BTreeSet<ParticipantId>,
        forbidden: &ForbiddenMap,
        rng: &mut R,
    ) -> Result<Assignment, MatchError> {
        if participants.len() < 2 {
            return Err(MatchError::InsufficientParticipants {
                count: participants.len(),
            });
        }

        // Givers walk in id order so a seeded rng replays the same result.
        let givers: Vec<&ParticipantId> = participants.iter().collect();

        // A giver with nobody left to receive can never be matched.
        let stranded = givers.iter().any(|giver| {
            !participants
                .iter()
                .any(|receiver| is_allowed(giver, receiver, forbidden))
        });
        if stranded {
            return Err(MatchError::NoValidMatchingFound { attempts: 0 });
        }

        let mut receivers = givers.clone();
        for _ in 0..self.max_attempts {
            receivers.shuffle(rng);
            let valid = givers
                .iter()
                .zip(&receivers)
                .all(|(giver, receiver)| is_allowed(giver, receiver, forbidden));
            if valid {
                return Ok(givers
                    .iter()
                    .zip(&receivers)
                    .map(|(giver, receiver)| ((*giver).clone(), (*receiver).clone()))
                    .collect());
            }
        }

        Err(MatchError::NoValidMatchingFound {
            attempts: self.max_attempts,
        })
    }
}

fn is_allowed(giver: &ParticipantId, receiver: &ParticipantId, forbidden: &ForbiddenMap) -> bool {
    giver != receiver
        && !forbidden
            .get(giver)
            .is_some_and(|blocked| blocked.contains(receiver))
}

pub fn forbidden_map<'a>(
    restrictions: impl IntoIterator<Item = &'a Restriction>,
    participants: &BTreeSet<ParticipantId>,
) -> ForbiddenMap {
    let mut map = ForbiddenMap::new();
    for edge in restrictions {
        if participants.contains(&edge.subject) && participants.contains(&edge.forbidden) {
            map.entry(edge.subject.clone())
                .or_default()
                .insert(edge.forbidden.clone());
        }
    }
    map
}
