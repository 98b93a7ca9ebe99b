//! Presence table — which participants are currently in which board.
//!
//! DESIGN
//! ======
//! Each `(board, username)` slot remembers the connection that last joined
//! it. A rejoin from a new connection replaces the slot (last join wins), and
//! teardown of a connection only evicts slots it still owns, so a stale
//! socket expiring after its user reconnected never removes the fresh entry.
//!
//! Boards with no participants are removed outright.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::ConnId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub username: String,
    pub avatar: String,
    pub is_admin: bool,
}

#[derive(Debug, Clone)]
struct Slot {
    participant: Participant,
    owner: ConnId,
}

#[derive(Debug, Default)]
pub struct PresenceTable {
    boards: HashMap<String, HashMap<String, Slot>>,
    /// Bumped on every mutation that changes the table.
    revision: u64,
}

impl PresenceTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the participant's slot. Returns the previous owner
    /// when a different connection held the slot.
    pub fn upsert(&mut self, board_id: &str, participant: Participant, owner: ConnId) -> Option<ConnId> {
        let slots = self.boards.entry(board_id.to_owned()).or_default();
        let previous = slots.insert(participant.username.clone(), Slot { participant, owner });
        self.revision += 1;
        previous.map(|slot| slot.owner).filter(|prev| *prev != owner)
    }

    /// Remove the slot regardless of owner. Returns whether it existed.
    pub fn remove(&mut self, board_id: &str, username: &str) -> bool {
        self.remove_where(board_id, username, |_| true)
    }

    /// Remove the slot only if `owner` still holds it.
    pub fn remove_if_owner(&mut self, board_id: &str, username: &str, owner: ConnId) -> bool {
        self.remove_where(board_id, username, |slot| slot.owner == owner)
    }

    fn remove_where(&mut self, board_id: &str, username: &str, should_remove: impl Fn(&Slot) -> bool) -> bool {
        let Some(slots) = self.boards.get_mut(board_id) else {
            return false;
        };
        if !slots.get(username).is_some_and(should_remove) {
            return false;
        }
        slots.remove(username);
        if slots.is_empty() {
            self.boards.remove(board_id);
        }
        self.revision += 1;
        true
    }

    /// Participants in a board, ordered by username.
    #[must_use]
    pub fn participants(&self, board_id: &str) -> Vec<Participant> {
        let Some(slots) = self.boards.get(board_id) else {
            return Vec::new();
        };
        let mut list: Vec<Participant> = slots.values().map(|slot| slot.participant.clone()).collect();
        list.sort_by(|a, b| a.username.cmp(&b.username));
        list
    }

    #[must_use]
    pub fn owner(&self, board_id: &str, username: &str) -> Option<ConnId> {
        self.boards
            .get(board_id)
            .and_then(|slots| slots.get(username))
            .map(|slot| slot.owner)
    }

    #[must_use]
    pub fn board_count(&self) -> usize {
        self.boards.len()
    }

    #[must_use]
    pub fn revision(&self) -> u64 {
        self.revision
    }
}

#[cfg(test)]
#[path = "presence_test.rs"]
mod tests;
