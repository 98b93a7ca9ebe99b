//! Vote routes.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use serde::Deserialize;
use uuid::Uuid;

use crate::services::vote::{self, VoteTally};
use crate::state::AppState;
use crate::store::{StoreError, Vote, VoteKind};

#[derive(Deserialize)]
pub struct VotesQuery {
    pub user_name: Option<String>,
}

#[derive(Deserialize)]
pub struct CastVoteBody {
    pub user_name: String,
    pub vote_type: String,
}

/// `GET /api/cards/:id/votes?user_name=` — tally as the viewer may see it.
pub async fn list_votes(
    State(state): State<AppState>,
    Path(card_id): Path<Uuid>,
    Query(query): Query<VotesQuery>,
) -> Result<Json<VoteTally>, StatusCode> {
    let viewer = query.user_name.as_deref().filter(|name| !name.is_empty());
    let tally = vote::votes_for_viewer(state.store.as_ref(), card_id, viewer)
        .await
        .map_err(store_error_to_status)?;
    Ok(Json(tally))
}

/// `POST /api/cards/:id/votes` — cast a vote.
pub async fn cast_vote(
    State(state): State<AppState>,
    Path(card_id): Path<Uuid>,
    Json(body): Json<CastVoteBody>,
) -> Result<(StatusCode, Json<Vote>), StatusCode> {
    let Some(vote_type) = VoteKind::parse(&body.vote_type) else {
        return Err(StatusCode::BAD_REQUEST);
    };
    let user_name = body.user_name.trim();
    if user_name.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let vote = vote::cast_vote(state.store.as_ref(), &state.hub, card_id, user_name, vote_type)
        .await
        .map_err(store_error_to_status)?;
    Ok((StatusCode::CREATED, Json(vote)))
}

/// `DELETE /api/votes/:id` — retract a vote.
pub async fn delete_vote(
    State(state): State<AppState>,
    Path(vote_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    vote::retract_vote(state.store.as_ref(), &state.hub, vote_id)
        .await
        .map_err(store_error_to_status)?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

pub(crate) fn store_error_to_status(err: StoreError) -> StatusCode {
    match err {
        StoreError::NotFound(_) => StatusCode::NOT_FOUND,
        StoreError::Conflict(_) => StatusCode::CONFLICT,
        StoreError::Database(e) => {
            tracing::error!(error = %e, "vote route: database error");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

#[cfg(test)]
#[path = "votes_test.rs"]
mod tests;
