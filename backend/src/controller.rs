use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use santa_core::{
    forbidden_map, Assignment, Comment, GameState, Matcher, Participant, ParticipantId, Phase,
    Restriction, Wish,
};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::{Result, SantaError};
use crate::store::Store;

pub trait PrivilegeOracle: Send + Sync {
    fn is_privileged(&self, requester: &ParticipantId) -> bool;
}

#[derive(Debug, Clone, Default)]
pub struct AdminList {
    admins: HashSet<ParticipantId>,
}

impl AdminList {
    pub fn new(admins: impl IntoIterator<Item = ParticipantId>) -> Self {
        Self {
            admins: admins.into_iter().collect(),
        }
    }
}

impl PrivilegeOracle for AdminList {
    fn is_privileged(&self, requester: &ParticipantId) -> bool {
        self.admins.contains(requester)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Status {
    pub phase: Phase,
    pub participants: usize,
    pub restrictions: usize,
    pub assignments: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Hint {
    pub author: ParticipantId,
    pub author_name: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AssignmentCard {
    pub receiver: Participant,
    pub wish: Option<String>,
    pub hints: Vec<Hint>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    PhaseChanged { phase: Phase },
}

fn storable(id: &ParticipantId) -> Result<()> {
    if id.as_str().contains(':') {
        return Err(SantaError::InvalidIdentifier(id.to_string()));
    }
    Ok(())
}

fn non_empty(text: &str, what: &str) -> Result<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(SantaError::InvalidInput(format!("{what} must not be empty")));
    }
    Ok(trimmed.to_string())
}

pub struct Controller {
    store: Store,
    oracle: Arc<dyn PrivilegeOracle>,
    matcher: Matcher,
    writes: Mutex<()>,
    events: broadcast::Sender<Notification>,
}

impl Controller {
    pub fn new(store: Store, oracle: impl PrivilegeOracle + 'static, matcher: Matcher) -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            store,
            oracle: Arc::new(oracle),
            matcher,
            writes: Mutex::new(()),
            events,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.events.subscribe()
    }

    pub fn is_privileged(&self, requester: &ParticipantId) -> bool {
        self.oracle.is_privileged(requester)
    }

    fn serialize_writes(&self) -> MutexGuard<'_, ()> {
        // The guard protects no data, so a poisoned lock is still usable.
        self.writes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, phase: Phase) {
        // No subscribers is not an error.
        let _ = self.events.send(Notification::PhaseChanged { phase });
    }

    fn require_privileged(&self, requester: &ParticipantId) -> Result<()> {
        if self.is_privileged(requester) {
            Ok(())
        } else {
            Err(SantaError::NotAuthorized)
        }
    }

    fn require_self_or_privileged(
        &self,
        requester: &ParticipantId,
        target: &ParticipantId,
    ) -> Result<()> {
        if requester == target {
            return Ok(());
        }
        self.require_privileged(requester)
    }

    fn require_participant(&self, id: &ParticipantId) -> Result<Participant> {
        self.store
            .participant(id)?
            .ok_or_else(|| SantaError::ParticipantNotFound(id.clone()))
    }

    // ---- participants ----

    pub fn add_participant(
        &self,
        requester: &ParticipantId,
        id: &ParticipantId,
        display_name: &str,
        handle: Option<&str>,
    ) -> Result<Participant> {
        storable(id)?;
        self.require_self_or_privileged(requester, id)?;

        let participant = Participant {
            id: id.clone(),
            display_name: non_empty(display_name, "display name")?,
            handle: handle
                .map(|raw| raw.trim().trim_start_matches('@').to_string())
                .filter(|handle| !handle.is_empty()),
        };

        let existing = self.store.participant(id)?;
        if existing.as_ref() == Some(&participant) {
            debug!(%id, "Participant unchanged");
            return Ok(participant);
        }

        self.store.save_participant(&participant)?;
        if existing.is_some() {
            info!(%id, name = %participant.label(), "Participant updated");
        } else {
            info!(%id, name = %participant.label(), "Participant registered");
        }
        Ok(participant)
    }

    /// Refused once a matching exists; the game has to be reset first.
    pub fn remove_participant(&self, requester: &ParticipantId, id: &ParticipantId) -> Result<()> {
        self.require_self_or_privileged(requester, id)?;
        let _guard = self.serialize_writes();

        if self.store.game_state()?.is_generated() {
            return Err(SantaError::GameLocked);
        }
        self.require_participant(id)?;

        self.store.delete_participant(id)?;
        let outgoing = self.store.delete_restrictions_for_subject(id)?;
        let mut incoming = 0;
        for edge in self
            .store
            .restrictions()?
            .into_iter()
            .filter(|edge| &edge.forbidden == id)
        {
            self.store.delete_restriction(&edge.subject, &edge.forbidden)?;
            incoming += 1;
        }
        self.store.delete_assignment(id)?;

        info!(%id, outgoing, incoming, "Participant removed");
        Ok(())
    }

    pub fn participant(&self, id: &ParticipantId) -> Result<Participant> {
        self.require_participant(id)
    }

    pub fn participants(&self) -> Result<Vec<Participant>> {
        let mut participants = self.store.participants()?;
        participants.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(participants)
    }

    pub fn participant_by_handle(&self, handle: &str) -> Result<Participant> {
        let wanted = handle.trim().trim_start_matches('@').to_lowercase();
        if wanted.is_empty() {
            return Err(SantaError::InvalidInput("handle must not be empty".to_string()));
        }

        let found = self.participants()?.into_iter().find(|participant| {
            participant
                .handle
                .as_deref()
                .is_some_and(|own| own.to_lowercase() == wanted)
        });
        match found {
            Some(participant) => Ok(participant),
            None => {
                let missing = ParticipantId::new(format!("@{wanted}"))
                    .map_err(|_| SantaError::InvalidInput("handle must not be empty".to_string()))?;
                Err(SantaError::ParticipantNotFound(missing))
            }
        }
    }

    // ---- restrictions ----

    pub fn add_restriction(
        &self,
        requester: &ParticipantId,
        subject: &ParticipantId,
        forbidden: &ParticipantId,
    ) -> Result<Restriction> {
        storable(subject)?;
        storable(forbidden)?;
        self.require_self_or_privileged(requester, subject)?;
        if subject == forbidden {
            return Err(SantaError::SelfRestriction);
        }
        self.require_participant(subject)?;
        self.require_participant(forbidden)?;

        if self.store.has_restriction(subject, forbidden)? {
            return Err(SantaError::DuplicateRestriction {
                subject: subject.clone(),
                forbidden: forbidden.clone(),
            });
        }

        self.store.save_restriction(subject, forbidden, requester)?;
        info!(%subject, %forbidden, creator = %requester, "Restriction added");
        Ok(Restriction {
            subject: subject.clone(),
            forbidden: forbidden.clone(),
            creator: Some(requester.clone()),
        })
    }

    pub fn remove_restriction(
        &self,
        requester: &ParticipantId,
        subject: &ParticipantId,
        forbidden: &ParticipantId,
    ) -> Result<()> {
        let edge = self.store.restriction(subject, forbidden)?.ok_or_else(|| {
            SantaError::RestrictionNotFound {
                subject: subject.clone(),
                forbidden: forbidden.clone(),
            }
        })?;

        let allowed = self.is_privileged(requester) || edge.creator.as_ref() == Some(requester);
        if !allowed {
            return Err(SantaError::NotAuthorized);
        }

        self.store.delete_restriction(subject, forbidden)?;
        info!(%subject, %forbidden, by = %requester, "Restriction removed");
        Ok(())
    }

    pub fn restrictions(&self, requester: &ParticipantId) -> Result<Vec<Restriction>> {
        let privileged = self.is_privileged(requester);
        let mut restrictions: Vec<Restriction> = self
            .store
            .restrictions()?
            .into_iter()
            .filter(|edge| privileged || &edge.subject == requester)
            .collect();
        restrictions.sort_by(|a, b| {
            (&a.subject, &a.forbidden).cmp(&(&b.subject, &b.forbidden))
        });
        Ok(restrictions)
    }

    // ---- game lifecycle ----

    /// Draws a fresh matching over the current participants and replaces any
    /// previous one. A failed draw leaves the phase and stored assignments
    /// untouched.
    pub fn generate(&self, requester: &ParticipantId, seed: Option<u64>) -> Result<Status> {
        self.require_privileged(requester)?;
        let _guard = self.serialize_writes();

        let participants: BTreeSet<ParticipantId> = self
            .store
            .participants()?
            .into_iter()
            .map(|participant| participant.id)
            .collect();
        if participants.len() < 2 {
            return Err(SantaError::InsufficientParticipants {
                count: participants.len(),
            });
        }

        let restrictions = self.store.restrictions()?;
        let forbidden = forbidden_map(&restrictions, &participants);
        debug!(
            participants = participants.len(),
            restrictions = restrictions.len(),
            "Loaded matching input"
        );

        let mut rng = match seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        let assignment = self
            .matcher
            .generate(&participants, &forbidden, &mut rng)
            .map_err(|err| {
                warn!(%err, "Matching failed");
                SantaError::from(err)
            })?;

        let replaced = self.store.delete_all_assignments()?;
        for (giver, receiver) in assignment.iter() {
            self.store.save_assignment(giver, receiver)?;
        }
        self.store
            .save_game_state(GameState::from_phase(Phase::Generated))?;

        info!(pairs = assignment.len(), replaced, "Matching generated");
        self.notify(Phase::Generated);
        self.status()
    }

    pub fn reveal(&self, requester: &ParticipantId) -> Result<Status> {
        self.require_privileged(requester)?;
        let _guard = self.serialize_writes();

        if !self.store.game_state()?.is_generated() || self.store.assignments()?.is_empty() {
            return Err(SantaError::NotGenerated);
        }

        self.store
            .save_game_state(GameState::from_phase(Phase::Revealed))?;
        info!("Results revealed");
        self.notify(Phase::Revealed);
        self.status()
    }

    pub fn reset(&self, requester: &ParticipantId) -> Result<Status> {
        self.require_privileged(requester)?;
        let _guard = self.serialize_writes();

        let removed = self.store.delete_all_assignments()?;
        self.store.reset_game_state()?;
        info!(removed, "Game reset");
        self.notify(Phase::Open);
        self.status()
    }

    pub fn clear_all(&self, requester: &ParticipantId) -> Result<()> {
        self.require_privileged(requester)?;
        let _guard = self.serialize_writes();

        self.store.clear_all()?;
        warn!("All game data cleared");
        self.notify(Phase::Open);
        Ok(())
    }

    pub fn status(&self) -> Result<Status> {
        Ok(Status {
            phase: self.store.game_state()?.phase(),
            participants: self.store.participants()?.len(),
            restrictions: self.store.restrictions()?.len(),
            assignments: self.store.assignments()?.len(),
        })
    }

    pub fn assignment_for(&self, requester: &ParticipantId) -> Result<AssignmentCard> {
        if !self.store.game_state()?.is_revealed() {
            return Err(SantaError::NotRevealed);
        }

        let receiver_id = self
            .store
            .assignment(requester)?
            .ok_or_else(|| SantaError::AssignmentNotFound(requester.clone()))?;
        let receiver = self
            .store
            .participant(&receiver_id)?
            .unwrap_or_else(|| Participant {
                id: receiver_id.clone(),
                display_name: receiver_id.to_string(),
                handle: None,
            });

        Ok(AssignmentCard {
            wish: self.optional_wish(&receiver_id),
            hints: self.optional_hints(&receiver_id),
            receiver,
        })
    }

    pub fn assignments(&self, requester: &ParticipantId) -> Result<Assignment> {
        self.require_privileged(requester)?;
        if !self.store.game_state()?.is_generated() {
            return Err(SantaError::NotGenerated);
        }
        Ok(self.store.assignments()?)
    }

    fn optional_wish(&self, id: &ParticipantId) -> Option<String> {
        self.store.wish(id).unwrap_or_else(|err| {
            warn!(%id, %err, "Wish unavailable");
            None
        })
    }

    fn optional_hints(&self, receiver: &ParticipantId) -> Vec<Hint> {
        let comments = match self.store.comments_for(receiver) {
            Ok(comments) => comments,
            Err(err) => {
                warn!(%receiver, %err, "Hints unavailable");
                return Vec::new();
            }
        };
        let names: HashMap<ParticipantId, String> = self
            .store
            .participants()
            .map(|all| all.into_iter().map(|p| (p.id.clone(), p.label())).collect())
            .unwrap_or_default();

        let mut hints: Vec<Hint> = comments
            .into_iter()
            .map(|comment| Hint {
                author_name: names
                    .get(&comment.author)
                    .cloned()
                    .unwrap_or_else(|| comment.author.to_string()),
                author: comment.author,
                text: comment.text,
            })
            .collect();
        hints.sort_by(|a, b| a.author.cmp(&b.author));
        hints
    }

    // ---- wishes ----

    pub fn set_wish(
        &self,
        requester: &ParticipantId,
        participant: &ParticipantId,
        text: &str,
    ) -> Result<Wish> {
        self.require_self_or_privileged(requester, participant)?;
        self.require_participant(participant)?;
        let text = non_empty(text, "wish")?;

        self.store.save_wish(participant, &text)?;
        debug!(%participant, "Wish saved");
        Ok(Wish {
            participant: participant.clone(),
            text,
        })
    }

    pub fn wish(
        &self,
        requester: &ParticipantId,
        participant: &ParticipantId,
    ) -> Result<Option<Wish>> {
        self.require_self_or_privileged(requester, participant)?;
        self.require_participant(participant)?;
        Ok(self.store.wish(participant)?.map(|text| Wish {
            participant: participant.clone(),
            text,
        }))
    }

    pub fn delete_wish(&self, requester: &ParticipantId, participant: &ParticipantId) -> Result<()> {
        self.require_self_or_privileged(requester, participant)?;
        self.require_participant(participant)?;
        self.store.delete_wish(participant)?;
        Ok(())
    }

    // ---- gift hints ----

    pub fn add_comment(
        &self,
        author: &ParticipantId,
        receiver: &ParticipantId,
        text: &str,
    ) -> Result<Comment> {
        storable(author)?;
        storable(receiver)?;
        if author == receiver {
            return Err(SantaError::SelfComment);
        }
        self.require_participant(receiver)?;

        let comment = Comment {
            receiver: receiver.clone(),
            author: author.clone(),
            text: non_empty(text, "comment")?,
        };
        self.store.save_comment(&comment)?;
        info!(%receiver, %author, "Hint added");
        Ok(comment)
    }

    pub fn comments(
        &self,
        requester: &ParticipantId,
        receiver: &ParticipantId,
    ) -> Result<Vec<Comment>> {
        if requester == receiver && !self.is_privileged(requester) {
            return Err(SantaError::NotAuthorized);
        }
        let mut comments = self.store.comments_for(receiver)?;
        comments.sort_by(|a, b| a.author.cmp(&b.author));
        Ok(comments)
    }

    pub fn delete_comment(&self, author: &ParticipantId, receiver: &ParticipantId) -> Result<()> {
        self.store.delete_comment(receiver, author)?;
        Ok(())
    }
}
