//! Typed repository over a [`KvBackend`].
//!
//! Every record family lives under its own key prefix:
//!
//! ```text
//! participant:{id}                           -> Participant as JSON
//! restriction:{subject}:{forbidden}          -> "1"
//! restriction_creator:{subject}:{forbidden}  -> creator id
//! assignment:{giver}                         -> receiver id
//! game:state                                 -> {"generated":..,"revealed":..}
//! wish:{id}                                  -> free text
//! comment:{receiver}:{author}                -> free text
//! ```
//!
//! Identifiers must not contain `:`; the controller rejects them before they
//! get here.

mod kv;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use santa_core::{Assignment, Comment, GameState, Participant, ParticipantId, Restriction};
use thiserror::Error;
use tracing::debug;

pub use kv::{FileBackend, KvBackend, MemoryBackend};

const PARTICIPANT: &str = "participant:";
const RESTRICTION: &str = "restriction:";
const RESTRICTION_CREATOR: &str = "restriction_creator:";
const ASSIGNMENT: &str = "assignment:";
const GAME_STATE: &str = "game:state";
const WISH: &str = "wish:";
const COMMENT: &str = "comment:";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store lock was poisoned")]
    LockPoisoned,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("corrupted record {key}: {reason}")]
    Corrupted { key: String, reason: String },
}

pub type Result<T> = std::result::Result<T, StoreError>;

fn participant_key(id: &ParticipantId) -> String {
    format!("{PARTICIPANT}{id}")
}

fn restriction_key(subject: &ParticipantId, forbidden: &ParticipantId) -> String {
    format!("{RESTRICTION}{subject}:{forbidden}")
}

fn restriction_creator_key(subject: &ParticipantId, forbidden: &ParticipantId) -> String {
    format!("{RESTRICTION_CREATOR}{subject}:{forbidden}")
}

fn assignment_key(giver: &ParticipantId) -> String {
    format!("{ASSIGNMENT}{giver}")
}

fn wish_key(id: &ParticipantId) -> String {
    format!("{WISH}{id}")
}

fn comment_key(receiver: &ParticipantId, author: &ParticipantId) -> String {
    format!("{COMMENT}{receiver}:{author}")
}

fn corrupted(key: &str, reason: impl Into<String>) -> StoreError {
    StoreError::Corrupted {
        key: key.to_string(),
        reason: reason.into(),
    }
}

fn parse_id(key: &str, raw: &str) -> Result<ParticipantId> {
    ParticipantId::new(raw).map_err(|err| corrupted(key, err.to_string()))
}

fn parse_pair(key: &str, prefix: &str) -> Result<(ParticipantId, ParticipantId)> {
    let rest = key
        .strip_prefix(prefix)
        .ok_or_else(|| corrupted(key, "unexpected key prefix"))?;
    let (first, second) = rest
        .split_once(':')
        .ok_or_else(|| corrupted(key, "expected two ids"))?;
    Ok((parse_id(key, first)?, parse_id(key, second)?))
}

fn parse_single(key: &str, prefix: &str) -> Result<ParticipantId> {
    let rest = key
        .strip_prefix(prefix)
        .ok_or_else(|| corrupted(key, "unexpected key prefix"))?;
    parse_id(key, rest)
}

#[derive(Clone)]
pub struct Store {
    backend: Arc<dyn KvBackend>,
}

impl Store {
    pub fn new(backend: impl KvBackend + 'static) -> Self {
        Self::shared(Arc::new(backend))
    }

    pub fn shared(backend: Arc<dyn KvBackend>) -> Self {
        Self { backend }
    }

    pub fn in_memory() -> Self {
        Self::new(MemoryBackend::new())
    }

    pub fn open_file(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(FileBackend::open(path)?))
    }

    // ---- participants ----

    pub fn save_participant(&self, participant: &Participant) -> Result<()> {
        let json = serde_json::to_string(participant)?;
        self.backend.set(&participant_key(&participant.id), &json)
    }

    pub fn participant(&self, id: &ParticipantId) -> Result<Option<Participant>> {
        self.backend
            .get(&participant_key(id))?
            .map(|json| serde_json::from_str(&json).map_err(StoreError::from))
            .transpose()
    }

    pub fn participants(&self) -> Result<Vec<Participant>> {
        self.backend
            .scan_prefix(PARTICIPANT)?
            .into_iter()
            .map(|(key, json)| {
                serde_json::from_str::<Participant>(&json)
                    .map_err(|err| corrupted(&key, err.to_string()))
            })
            .collect()
    }

    pub fn delete_participant(&self, id: &ParticipantId) -> Result<()> {
        self.backend.delete(&participant_key(id))
    }

    // ---- restrictions ----

    /// Writes the edge flag and then its creator. The two writes are not
    /// atomic; an edge whose creator record is missing reads back with
    /// `creator: None`.
    pub fn save_restriction(
        &self,
        subject: &ParticipantId,
        forbidden: &ParticipantId,
        creator: &ParticipantId,
    ) -> Result<()> {
        self.backend.set(&restriction_key(subject, forbidden), "1")?;
        self.backend
            .set(&restriction_creator_key(subject, forbidden), creator.as_str())?;
        debug!(%subject, %forbidden, %creator, "Restriction saved");
        Ok(())
    }

    pub fn has_restriction(&self, subject: &ParticipantId, forbidden: &ParticipantId) -> Result<bool> {
        Ok(self.backend.get(&restriction_key(subject, forbidden))?.is_some())
    }

    pub fn restriction_creator(
        &self,
        subject: &ParticipantId,
        forbidden: &ParticipantId,
    ) -> Result<Option<ParticipantId>> {
        let key = restriction_creator_key(subject, forbidden);
        self.backend
            .get(&key)?
            .map(|raw| parse_id(&key, &raw))
            .transpose()
    }

    pub fn restriction(
        &self,
        subject: &ParticipantId,
        forbidden: &ParticipantId,
    ) -> Result<Option<Restriction>> {
        if !self.has_restriction(subject, forbidden)? {
            return Ok(None);
        }
        Ok(Some(Restriction {
            subject: subject.clone(),
            forbidden: forbidden.clone(),
            creator: self.restriction_creator(subject, forbidden)?,
        }))
    }

    pub fn restrictions(&self) -> Result<Vec<Restriction>> {
        let edges = self.backend.scan_prefix(RESTRICTION)?;
        let creators = self.backend.scan_prefix(RESTRICTION_CREATOR)?;

        let mut attributed = HashMap::new();
        for (key, raw) in creators {
            let pair = parse_pair(&key, RESTRICTION_CREATOR)?;
            attributed.insert(pair, parse_id(&key, &raw)?);
        }

        edges
            .into_iter()
            .map(|(key, _)| -> Result<Restriction> {
                let (subject, forbidden) = parse_pair(&key, RESTRICTION)?;
                let creator = attributed.remove(&(subject.clone(), forbidden.clone()));
                Ok(Restriction {
                    subject,
                    forbidden,
                    creator,
                })
            })
            .collect()
    }

    pub fn delete_restriction(&self, subject: &ParticipantId, forbidden: &ParticipantId) -> Result<()> {
        self.backend.delete_many(&[
            restriction_key(subject, forbidden),
            restriction_creator_key(subject, forbidden),
        ])
    }

    pub fn delete_restrictions_for_subject(&self, subject: &ParticipantId) -> Result<usize> {
        let prefix = format!("{RESTRICTION}{subject}:");
        let mut keys = Vec::new();
        for (key, _) in self.backend.scan_prefix(&prefix)? {
            let (subject, forbidden) = parse_pair(&key, RESTRICTION)?;
            keys.push(restriction_creator_key(&subject, &forbidden));
            keys.push(key);
        }
        let removed = keys.len() / 2;
        if !keys.is_empty() {
            self.backend.delete_many(&keys)?;
        }
        Ok(removed)
    }

    // ---- assignments ----

    pub fn save_assignment(&self, giver: &ParticipantId, receiver: &ParticipantId) -> Result<()> {
        self.backend.set(&assignment_key(giver), receiver.as_str())
    }

    pub fn assignment(&self, giver: &ParticipantId) -> Result<Option<ParticipantId>> {
        let key = assignment_key(giver);
        self.backend
            .get(&key)?
            .map(|raw| parse_id(&key, &raw))
            .transpose()
    }

    pub fn assignments(&self) -> Result<Assignment> {
        self.backend
            .scan_prefix(ASSIGNMENT)?
            .into_iter()
            .map(|(key, raw)| -> Result<(ParticipantId, ParticipantId)> {
                Ok((parse_single(&key, ASSIGNMENT)?, parse_id(&key, &raw)?))
            })
            .collect()
    }

    pub fn delete_assignment(&self, giver: &ParticipantId) -> Result<()> {
        self.backend.delete(&assignment_key(giver))
    }

    pub fn delete_all_assignments(&self) -> Result<usize> {
        let keys: Vec<String> = self
            .backend
            .scan_prefix(ASSIGNMENT)?
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        if !keys.is_empty() {
            self.backend.delete_many(&keys)?;
        }
        Ok(keys.len())
    }

    // ---- game state ----

    pub fn game_state(&self) -> Result<GameState> {
        match self.backend.get(GAME_STATE)? {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(GameState::default()),
        }
    }

    pub fn save_game_state(&self, state: GameState) -> Result<()> {
        let json = serde_json::to_string(&state)?;
        self.backend.set(GAME_STATE, &json)
    }

    pub fn reset_game_state(&self) -> Result<()> {
        self.backend.delete(GAME_STATE)
    }

    // ---- wishes ----

    pub fn save_wish(&self, id: &ParticipantId, text: &str) -> Result<()> {
        self.backend.set(&wish_key(id), text)
    }

    pub fn wish(&self, id: &ParticipantId) -> Result<Option<String>> {
        self.backend.get(&wish_key(id))
    }

    pub fn delete_wish(&self, id: &ParticipantId) -> Result<()> {
        self.backend.delete(&wish_key(id))
    }

    // ---- comments ----

    pub fn save_comment(&self, comment: &Comment) -> Result<()> {
        self.backend
            .set(&comment_key(&comment.receiver, &comment.author), &comment.text)
    }

    pub fn comments_for(&self, receiver: &ParticipantId) -> Result<Vec<Comment>> {
        let prefix = format!("{COMMENT}{receiver}:");
        self.backend
            .scan_prefix(&prefix)?
            .into_iter()
            .map(|(key, text)| -> Result<Comment> {
                let (receiver, author) = parse_pair(&key, COMMENT)?;
                Ok(Comment {
                    receiver,
                    author,
                    text,
                })
            })
            .collect()
    }

    pub fn delete_comment(&self, receiver: &ParticipantId, author: &ParticipantId) -> Result<()> {
        self.backend.delete(&comment_key(receiver, author))
    }

    pub fn clear_all(&self) -> Result<()> {
        self.backend.clear()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use santa_core::Phase;

    fn id(raw: &str) -> ParticipantId {
        ParticipantId::new(raw).unwrap()
    }

    fn participant(raw: &str, name: &str) -> Participant {
        Participant {
            id: id(raw),
            display_name: name.to_string(),
            handle: Some(name.to_lowercase()),
        }
    }

    #[test]
    fn participant_round_trip_and_delete() {
        let store = Store::in_memory();
        let alice = participant("100", "Alice");

        assert_eq!(store.participant(&alice.id).unwrap(), None);
        store.save_participant(&alice).unwrap();
        assert_eq!(store.participant(&alice.id).unwrap(), Some(alice.clone()));

        let renamed = Participant {
            display_name: "Alice Cooper".into(),
            ..alice.clone()
        };
        store.save_participant(&renamed).unwrap();
        assert_eq!(store.participants().unwrap(), vec![renamed]);

        store.delete_participant(&alice.id).unwrap();
        assert_eq!(store.participant(&alice.id).unwrap(), None);
        store.delete_participant(&alice.id).unwrap();
    }

    #[test]
    fn restrictions_carry_creator_attribution() {
        let store = Store::in_memory();
        store.save_restriction(&id("1"), &id("2"), &id("1")).unwrap();
        store.save_restriction(&id("1"), &id("3"), &id("9")).unwrap();

        assert!(store.has_restriction(&id("1"), &id("2")).unwrap());
        assert!(!store.has_restriction(&id("2"), &id("1")).unwrap());
        assert_eq!(store.restriction_creator(&id("1"), &id("3")).unwrap(), Some(id("9")));

        let mut all = store.restrictions().unwrap();
        all.sort_by(|a, b| a.forbidden.cmp(&b.forbidden));
        assert_eq!(
            all,
            vec![
                Restriction {
                    subject: id("1"),
                    forbidden: id("2"),
                    creator: Some(id("1")),
                },
                Restriction {
                    subject: id("1"),
                    forbidden: id("3"),
                    creator: Some(id("9")),
                },
            ]
        );

        store.delete_restriction(&id("1"), &id("2")).unwrap();
        assert_eq!(store.restriction(&id("1"), &id("2")).unwrap(), None);
        assert_eq!(store.restriction_creator(&id("1"), &id("2")).unwrap(), None);
    }

    #[test]
    fn edge_without_creator_reads_as_unattributed() {
        let backend = MemoryBackend::new();
        backend.set("restriction:1:2", "1").unwrap();
        backend.set("restriction_creator:5:6", "5").unwrap();
        let store = Store::new(backend);

        assert_eq!(
            store.restrictions().unwrap(),
            vec![Restriction {
                subject: id("1"),
                forbidden: id("2"),
                creator: None,
            }]
        );
        assert_eq!(store.restriction(&id("5"), &id("6")).unwrap(), None);
    }

    #[test]
    fn subject_cascade_keeps_incoming_edges() {
        let store = Store::in_memory();
        store.save_restriction(&id("1"), &id("2"), &id("1")).unwrap();
        store.save_restriction(&id("1"), &id("3"), &id("1")).unwrap();
        store.save_restriction(&id("2"), &id("1"), &id("2")).unwrap();
        store.save_restriction(&id("10"), &id("2"), &id("10")).unwrap();

        assert_eq!(store.delete_restrictions_for_subject(&id("1")).unwrap(), 2);

        let mut remaining: Vec<(String, String)> = store
            .restrictions()
            .unwrap()
            .into_iter()
            .map(|r| (r.subject.to_string(), r.forbidden.to_string()))
            .collect();
        remaining.sort();
        assert_eq!(
            remaining,
            vec![("10".into(), "2".into()), ("2".into(), "1".into())]
        );
        assert_eq!(store.restriction_creator(&id("1"), &id("3")).unwrap(), None);
    }

    #[test]
    fn assignments_and_game_state() {
        let store = Store::in_memory();
        assert_eq!(store.game_state().unwrap().phase(), Phase::Open);
        assert!(store.assignments().unwrap().is_empty());

        store.save_assignment(&id("1"), &id("2")).unwrap();
        store.save_assignment(&id("2"), &id("1")).unwrap();
        store.save_game_state(GameState::from_phase(Phase::Generated)).unwrap();

        assert_eq!(store.assignment(&id("1")).unwrap(), Some(id("2")));
        assert_eq!(store.assignment(&id("3")).unwrap(), None);
        assert_eq!(store.assignments().unwrap().len(), 2);
        assert_eq!(store.game_state().unwrap().phase(), Phase::Generated);

        assert_eq!(store.delete_all_assignments().unwrap(), 2);
        store.reset_game_state().unwrap();
        assert!(store.assignments().unwrap().is_empty());
        assert_eq!(store.game_state().unwrap(), GameState::default());
    }

    #[test]
    fn wishes_and_comments() {
        let store = Store::in_memory();
        store.save_wish(&id("1"), "a good book").unwrap();
        assert_eq!(store.wish(&id("1")).unwrap().as_deref(), Some("a good book"));
        store.delete_wish(&id("1")).unwrap();
        assert_eq!(store.wish(&id("1")).unwrap(), None);

        for (author, text) in [("2", "likes tea"), ("3", "no socks")] {
            store
                .save_comment(&Comment {
                    receiver: id("1"),
                    author: id(author),
                    text: text.into(),
                })
                .unwrap();
        }
        store
            .save_comment(&Comment {
                receiver: id("11"),
                author: id("2"),
                text: "other person".into(),
            })
            .unwrap();

        let comments = store.comments_for(&id("1")).unwrap();
        assert_eq!(comments.len(), 2);
        assert!(comments.iter().all(|c| c.receiver == id("1")));

        store.delete_comment(&id("1"), &id("2")).unwrap();
        let comments = store.comments_for(&id("1")).unwrap();
        assert_eq!(comments.len(), 1);
        assert_eq!(comments[0].text, "no socks");
    }

    #[test]
    fn clear_all_wipes_every_family() {
        let store = Store::in_memory();
        store.save_participant(&participant("1", "Alice")).unwrap();
        store.save_restriction(&id("1"), &id("2"), &id("1")).unwrap();
        store.save_assignment(&id("1"), &id("2")).unwrap();
        store.save_game_state(GameState::from_phase(Phase::Revealed)).unwrap();
        store.save_wish(&id("1"), "tea").unwrap();

        store.clear_all().unwrap();

        assert!(store.participants().unwrap().is_empty());
        assert!(store.restrictions().unwrap().is_empty());
        assert!(store.assignments().unwrap().is_empty());
        assert_eq!(store.game_state().unwrap().phase(), Phase::Open);
        assert_eq!(store.wish(&id("1")).unwrap(), None);
    }

    #[test]
    fn corrupted_participant_fails_the_whole_scan() {
        let backend = MemoryBackend::new();
        backend
            .set("participant:1", r#"{"id":"1","display_name":"A","handle":null}"#)
            .unwrap();
        backend.set("participant:2", "garbage").unwrap();
        let store = Store::new(backend);

        assert!(matches!(
            store.participants(),
            Err(StoreError::Corrupted { .. })
        ));
    }
}
