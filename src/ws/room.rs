//! Room state, room-code allocation, and idle-room eviction.

use std::{
    collections::{BTreeSet, HashMap},
    time::{Duration, Instant},
};

use rand::Rng as _;
use serde_json::Value;
use thiserror::Error;

use crate::ws::{ConnId, RoomCode};

/// Hard cap on code-generation retries. The default codespace (26^4) makes
/// hitting this a misconfiguration, not a runtime condition.
const MAX_CODE_ATTEMPTS: usize = 10_000;

pub const DEFAULT_CODE_LENGTH: usize = 4;
pub const DEFAULT_CODE_ALPHABET: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ";

#[derive(Debug, Error)]
pub enum RoomError {
    #[error("No free room code after {0} attempts; code length/alphabet too small")]
    CodespaceExhausted(usize),
}

/// Produces short, human-typable room codes.
///
/// Each call is an independent random draw; uniqueness is the
/// [`RoomRegistry`]'s job.
#[derive(Debug, Clone)]
pub struct RoomCodeGenerator {
    length: usize,
    alphabet: Vec<char>,
}

impl RoomCodeGenerator {
    /// # Panics
    ///
    /// * If `length` is zero or `alphabet` is empty.
    #[must_use]
    pub fn new(length: usize, alphabet: &str) -> Self {
        assert!(length > 0, "room code length must be non-zero");
        let alphabet: Vec<char> = alphabet.chars().collect();
        assert!(!alphabet.is_empty(), "room code alphabet must be non-empty");

        Self { length, alphabet }
    }

    #[must_use]
    pub fn generate(&self) -> RoomCode {
        let mut rng = rand::rng();

        (0..self.length)
            .map(|_| self.alphabet[rng.random_range(0..self.alphabet.len())])
            .collect()
    }
}

impl Default for RoomCodeGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_CODE_LENGTH, DEFAULT_CODE_ALPHABET)
    }
}

/// A single display-plus-controllers room.
///
/// Mutation goes through [`RoomRegistry`] so the abandoned-since bookkeeping
/// stays consistent.
#[derive(Debug)]
pub struct Room {
    app_conn_id: Option<ConnId>,
    controller_conn_ids: BTreeSet<ConnId>,
    last_known_app_state: Value,
    abandoned_since: Option<Instant>,
}

impl Room {
    fn new(app_conn_id: ConnId) -> Self {
        Self {
            app_conn_id: Some(app_conn_id),
            controller_conn_ids: BTreeSet::new(),
            last_known_app_state: crate::ws::models::empty_object(),
            abandoned_since: None,
        }
    }

    #[must_use]
    pub const fn app_conn_id(&self) -> Option<ConnId> {
        self.app_conn_id
    }

    #[must_use]
    pub const fn controller_conn_ids(&self) -> &BTreeSet<ConnId> {
        &self.controller_conn_ids
    }

    #[must_use]
    pub fn controller_count(&self) -> usize {
        self.controller_conn_ids.len()
    }

    #[must_use]
    pub const fn last_known_app_state(&self) -> &Value {
        &self.last_known_app_state
    }

    #[must_use]
    pub fn is_app(&self, conn_id: ConnId) -> bool {
        self.app_conn_id == Some(conn_id)
    }

    #[must_use]
    pub fn has_controller(&self, conn_id: ConnId) -> bool {
        self.controller_conn_ids.contains(&conn_id)
    }

    fn update_abandoned(&mut self) {
        if self.app_conn_id.is_none() && self.controller_conn_ids.is_empty() {
            if self.abandoned_since.is_none() {
                self.abandoned_since = Some(Instant::now());
            }
        } else {
            self.abandoned_since = None;
        }
    }
}

/// The authoritative map from room code to room state.
#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: HashMap<RoomCode, Room>,
    codes: RoomCodeGenerator,
}

impl RoomRegistry {
    #[must_use]
    pub fn new(codes: RoomCodeGenerator) -> Self {
        Self {
            rooms: HashMap::new(),
            codes,
        }
    }

    /// Create a room with a fresh unique code and `app_conn_id` as its display.
    ///
    /// # Errors
    ///
    /// * If no unused code is found within [`MAX_CODE_ATTEMPTS`] draws.
    pub fn create(&mut self, app_conn_id: ConnId) -> Result<RoomCode, RoomError> {
        for _ in 0..MAX_CODE_ATTEMPTS {
            let code = self.codes.generate();
            if !self.rooms.contains_key(&code) {
                self.rooms.insert(code.clone(), Room::new(app_conn_id));
                return Ok(code);
            }
        }

        Err(RoomError::CodespaceExhausted(MAX_CODE_ATTEMPTS))
    }

    #[must_use]
    pub fn get(&self, code: &str) -> Option<&Room> {
        self.rooms.get(code)
    }

    #[must_use]
    pub fn contains(&self, code: &str) -> bool {
        self.rooms.contains_key(code)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    /// Install `conn_id` as the room's display. Returns `false` if the room
    /// does not exist.
    pub fn set_app(&mut self, code: &str, conn_id: ConnId) -> bool {
        self.rooms.get_mut(code).is_some_and(|room| {
            room.app_conn_id = Some(conn_id);
            room.update_abandoned();
            true
        })
    }

    /// Mark the display offline. Returns `true` only if `conn_id` was the
    /// room's current display; a replaced display cannot clobber its
    /// successor.
    pub fn clear_app(&mut self, code: &str, conn_id: ConnId) -> bool {
        self.rooms
            .get_mut(code)
            .is_some_and(|room| match room.app_conn_id {
                Some(current) if current == conn_id => {
                    room.app_conn_id = None;
                    room.update_abandoned();
                    true
                }
                _ => false,
            })
    }

    /// Add `conn_id` to the room's controller set. Returns `false` if the
    /// room does not exist.
    pub fn add_controller(&mut self, code: &str, conn_id: ConnId) -> bool {
        self.rooms.get_mut(code).is_some_and(|room| {
            room.controller_conn_ids.insert(conn_id);
            room.update_abandoned();
            true
        })
    }

    /// Remove `conn_id` from the room's controller set. Returns `true` only
    /// if it was a member.
    pub fn remove_controller(&mut self, code: &str, conn_id: ConnId) -> bool {
        self.rooms.get_mut(code).is_some_and(|room| {
            let removed = room.controller_conn_ids.remove(&conn_id);
            room.update_abandoned();
            removed
        })
    }

    /// Overwrite the room's last-known display state. The blob is opaque; no
    /// merging. Returns `false` if the room does not exist.
    pub fn set_app_state(&mut self, code: &str, state: Value) -> bool {
        self.rooms.get_mut(code).is_some_and(|room| {
            room.last_known_app_state = state;
            true
        })
    }

    /// Evict rooms that have had no display and no controllers for at least
    /// `max_idle`, returning the evicted codes.
    pub fn sweep_abandoned(&mut self, max_idle: Duration) -> Vec<RoomCode> {
        let now = Instant::now();
        let expired: Vec<RoomCode> = self
            .rooms
            .iter()
            .filter(|(_, room)| {
                room.abandoned_since
                    .is_some_and(|since| now.duration_since(since) >= max_idle)
            })
            .map(|(code, _)| code.clone())
            .collect();

        for code in &expired {
            self.rooms.remove(code);
        }

        expired
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn generates_codes_of_configured_length_and_alphabet() {
        let codes = RoomCodeGenerator::new(6, "XY");

        for _ in 0..100 {
            let code = codes.generate();
            assert_eq!(code.len(), 6);
            assert!(code.chars().all(|c| c == 'X' || c == 'Y'));
        }
    }

    #[test]
    fn created_rooms_get_unique_codes() {
        let mut registry = RoomRegistry::new(RoomCodeGenerator::default());
        let mut seen = HashSet::new();

        for conn_id in 0..200 {
            let code = registry.create(conn_id).unwrap();
            assert!(seen.insert(code), "duplicate room code handed out");
        }

        assert_eq!(registry.len(), 200);
    }

    #[test]
    fn exhausted_codespace_is_an_error() {
        // single-code codespace: one room fits, the second draw can never win
        let mut registry = RoomRegistry::new(RoomCodeGenerator::new(1, "A"));

        assert_eq!(registry.create(1).unwrap(), "A");
        assert!(matches!(
            registry.create(2),
            Err(RoomError::CodespaceExhausted(_))
        ));
    }

    #[test]
    fn clear_app_ignores_a_replaced_display() {
        let mut registry = RoomRegistry::new(RoomCodeGenerator::default());
        let code = registry.create(1).unwrap();

        assert!(registry.set_app(&code, 2));
        assert!(!registry.clear_app(&code, 1));
        assert_eq!(registry.get(&code).unwrap().app_conn_id(), Some(2));

        assert!(registry.clear_app(&code, 2));
        assert_eq!(registry.get(&code).unwrap().app_conn_id(), None);
    }

    #[test]
    fn app_state_is_overwritten_not_merged() {
        let mut registry = RoomRegistry::new(RoomCodeGenerator::default());
        let code = registry.create(1).unwrap();

        assert!(registry.set_app_state(&code, json!({"a": 1, "b": 2})));
        assert!(registry.set_app_state(&code, json!({"b": 3})));

        assert_eq!(
            registry.get(&code).unwrap().last_known_app_state(),
            &json!({"b": 3})
        );
    }

    #[test]
    fn sweep_evicts_only_rooms_with_no_members() {
        let mut registry = RoomRegistry::new(RoomCodeGenerator::default());

        let abandoned = registry.create(1).unwrap();
        registry.clear_app(&abandoned, 1);

        let app_offline_but_watched = registry.create(2).unwrap();
        registry.add_controller(&app_offline_but_watched, 3);
        registry.clear_app(&app_offline_but_watched, 2);

        let live = registry.create(4).unwrap();

        let evicted = registry.sweep_abandoned(Duration::ZERO);

        assert_eq!(evicted, vec![abandoned.clone()]);
        assert!(!registry.contains(&abandoned));
        assert!(registry.contains(&app_offline_but_watched));
        assert!(registry.contains(&live));
    }

    #[test]
    fn membership_resuming_clears_the_abandoned_clock() {
        let mut registry = RoomRegistry::new(RoomCodeGenerator::default());
        let code = registry.create(1).unwrap();

        registry.clear_app(&code, 1);
        registry.add_controller(&code, 2);

        assert!(registry.sweep_abandoned(Duration::ZERO).is_empty());
    }
}
