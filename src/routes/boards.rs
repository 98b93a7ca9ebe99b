//! Board presence routes.

use axum::extract::{Path, State};
use axum::response::Json;
use serde::Serialize;

use crate::hub::presence::Participant;
use crate::state::AppState;

#[derive(Serialize)]
pub struct ParticipantsResponse {
    pub board_id: String,
    pub revision: u64,
    pub participants: Vec<Participant>,
}

/// `GET /api/boards/:id/participants` — this instance's presence for a board.
pub async fn list_participants(
    State(state): State<AppState>,
    Path(board_id): Path<String>,
) -> Json<ParticipantsResponse> {
    let (revision, participants) = state.hub.snapshot(&board_id);
    Json(ParticipantsResponse { board_id, revision, participants })
}

#[cfg(test)]
#[path = "boards_test.rs"]
mod tests;
