//! Event — the wire envelope shared by clients, the hub, and the backbone.
//!
//! ARCHITECTURE
//! ============
//! Every outbound notification is `{"type": ..., "data": {...}}`. The hub
//! serializes an event exactly once into a [`Payload`] and hands clones of
//! that shared string to every outbound queue and to the backbone, so the
//! bytes a remote instance re-injects are the bytes this instance produced.
//!
//! DESIGN
//! ======
//! Inbound frames are relayed verbatim. The hub only extracts the `type`
//! discriminator and, for control types, the handful of fields it needs.
//! Control fields are read from the top level first and from the nested
//! `data` object second, since browser clients send both shapes.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::hub::presence::Participant;

// =============================================================================
// EVENT TYPES
// =============================================================================

pub const PARTICIPANTS_UPDATE: &str = "participants_update";
pub const BOARD_UPDATE: &str = "board_update";
pub const VOTE_UPDATE: &str = "vote_update";

pub const JOIN_BOARD: &str = "join_board";
pub const LEAVE_BOARD: &str = "leave_board";
pub const PHASE_CHANGE: &str = "phase_change";

/// `board_update` action telling clients to re-fetch board state.
pub const ACTION_REFRESH_BOARD: &str = "refresh_board";

// =============================================================================
// TYPES
// =============================================================================

/// Flat key-value payload. Alias to reduce noise in signatures.
pub type Data = serde_json::Map<String, Value>;

/// Serialized envelope text. Cheap to clone across outbound queues.
pub type Payload = Arc<str>;

/// Outbound event envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Data,
}

impl Event {
    pub fn new(kind: impl Into<String>, data: Data) -> Self {
        Self { kind: kind.into(), data }
    }

    #[must_use]
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Full presence list for one board.
    #[must_use]
    pub fn participants_update(board_id: &str, participants: &[Participant]) -> Self {
        let list = serde_json::to_value(participants).unwrap_or_else(|_| Value::Array(Vec::new()));
        Self::new(PARTICIPANTS_UPDATE, Data::new())
            .with_data("board_id", board_id)
            .with_data("participants", list)
    }

    /// Hint to re-fetch the board from the store rather than a state push.
    #[must_use]
    pub fn board_refresh(board_id: &str) -> Self {
        Self::new(BOARD_UPDATE, Data::new())
            .with_data("board_id", board_id)
            .with_data("action", ACTION_REFRESH_BOARD)
    }

    /// Aggregate counts for one card. Counts may carry the hidden sentinel.
    #[must_use]
    pub fn vote_update(board_id: &str, card_id: &str, likes: i64, dislikes: i64) -> Self {
        Self::new(VOTE_UPDATE, Data::new())
            .with_data("board_id", board_id)
            .with_data("card_id", card_id)
            .with_data("likes", likes)
            .with_data("dislikes", dislikes)
    }

    /// Serialize once for fan-out.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the data map cannot be encoded.
    pub fn to_payload(&self) -> Result<Payload, serde_json::Error> {
        serde_json::to_string(self).map(Payload::from)
    }
}

// =============================================================================
// INBOUND
// =============================================================================

/// Classified inbound frame. Everything the hub does not act on is a relay.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Join { board_id: String, participant: Participant },
    Leave { board_id: String, username: String },
    PhaseChange { board_id: String, phase: String },
    Relay { kind: Option<String> },
}

/// Classify one inbound text frame.
///
/// Returns `None` when the text is not a JSON object; such frames are
/// dropped. A control type missing a required field degrades to a relay.
#[must_use]
pub fn classify(text: &str) -> Option<Inbound> {
    let value: Value = serde_json::from_str(text).ok()?;
    let object = value.as_object()?;
    let kind = object.get("type").and_then(Value::as_str);

    let inbound = match kind {
        Some(JOIN_BOARD) => match (field_str(object, "board_id"), field_str(object, "username")) {
            (Some(board_id), Some(username)) => Inbound::Join {
                board_id,
                participant: Participant {
                    username,
                    avatar: field_str(object, "avatar").unwrap_or_default(),
                    is_admin: field(object, "is_admin")
                        .and_then(Value::as_bool)
                        .unwrap_or(false),
                },
            },
            _ => relay(kind),
        },
        Some(LEAVE_BOARD) => match (field_str(object, "board_id"), field_str(object, "username")) {
            (Some(board_id), Some(username)) => Inbound::Leave { board_id, username },
            _ => relay(kind),
        },
        Some(PHASE_CHANGE) => match (field_str(object, "board_id"), field_str(object, "phase")) {
            (Some(board_id), Some(phase)) => Inbound::PhaseChange { board_id, phase },
            _ => relay(kind),
        },
        _ => relay(kind),
    };
    Some(inbound)
}

fn relay(kind: Option<&str>) -> Inbound {
    Inbound::Relay { kind: kind.map(str::to_owned) }
}

fn field<'a>(object: &'a Data, key: &str) -> Option<&'a Value> {
    object.get(key).or_else(|| {
        object
            .get("data")
            .and_then(Value::as_object)
            .and_then(|data| data.get(key))
    })
}

/// Non-empty string field. Empty strings count as missing.
fn field_str(object: &Data, key: &str) -> Option<String> {
    field(object, key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
}

#[cfg(test)]
#[path = "event_test.rs"]
mod tests;
