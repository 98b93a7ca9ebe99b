//! Vote service — per-card tallies and blind-voting redaction.
//!
//! DESIGN
//! ======
//! Redaction depends on who is asking, so it is applied on reads: a viewer
//! under blind voting in the voting phase sees only their own ballots and
//! the hidden sentinel instead of counts. The pushed `vote_update` carries
//! no viewer identity; it is the same for everyone and only ever carries
//! real counts once the board has left the voting phase. Clients fetch
//! their redacted detail through [`votes_for_viewer`].

use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::event::Event;
use crate::hub::Hub;
use crate::store::{BoardStore, StoreError, Vote, VoteKind, VotingContext};

/// Aggregate count reported while votes are hidden.
pub const HIDDEN_COUNT: i64 = -1;

/// Board phase during which blind voting hides results.
pub const VOTING_PHASE: &str = "voting";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VoteTally {
    pub votes: Vec<Vote>,
    pub likes: i64,
    pub dislikes: i64,
}

// =============================================================================
// AGGREGATION
// =============================================================================

/// `(likes, dislikes)` over a vote list.
#[must_use]
pub fn count(votes: &[Vote]) -> (i64, i64) {
    votes.iter().fold((0, 0), |(likes, dislikes), vote| match vote.vote_type {
        VoteKind::Like => (likes + 1, dislikes),
        VoteKind::Dislike => (likes, dislikes + 1),
    })
}

/// Tally as `viewer` is allowed to see it. An anonymous viewer under
/// redaction sees no ballots at all.
#[must_use]
pub fn tally_for_viewer(votes: Vec<Vote>, ctx: &VotingContext, viewer: Option<&str>) -> VoteTally {
    if ctx.is_hidden() {
        let votes = votes
            .into_iter()
            .filter(|vote| viewer.is_some_and(|name| vote.user_name == name))
            .collect();
        return VoteTally { votes, likes: HIDDEN_COUNT, dislikes: HIDDEN_COUNT };
    }
    let (likes, dislikes) = count(&votes);
    VoteTally { votes, likes, dislikes }
}

/// Viewer-agnostic push notification for one card.
#[must_use]
pub fn vote_update_event(ctx: &VotingContext, card_id: Uuid, votes: &[Vote]) -> Event {
    let (likes, dislikes) = if ctx.is_hidden() { (HIDDEN_COUNT, HIDDEN_COUNT) } else { count(votes) };
    Event::vote_update(&ctx.board_id.to_string(), &card_id.to_string(), likes, dislikes)
}

// =============================================================================
// OPERATIONS
// =============================================================================

/// Load a card's votes redacted for `viewer`.
///
/// # Errors
///
/// Returns [`StoreError::NotFound`] if the card does not exist.
pub async fn votes_for_viewer(
    store: &dyn BoardStore,
    card_id: Uuid,
    viewer: Option<&str>,
) -> Result<VoteTally, StoreError> {
    let ctx = store.voting_context(card_id).await?.ok_or(StoreError::NotFound(card_id))?;
    let votes = store.card_votes(card_id).await?;
    Ok(tally_for_viewer(votes, &ctx, viewer))
}

/// Record a vote and notify every client.
///
/// # Errors
///
/// Returns [`StoreError::NotFound`] for an unknown card and
/// [`StoreError::Conflict`] if the user already voted on it.
pub async fn cast_vote(
    store: &dyn BoardStore,
    hub: &Hub,
    card_id: Uuid,
    user_name: &str,
    vote_type: VoteKind,
) -> Result<Vote, StoreError> {
    let ctx = store.voting_context(card_id).await?.ok_or(StoreError::NotFound(card_id))?;
    let vote = store.add_vote(card_id, user_name, vote_type).await?;
    info!(%card_id, user_name, vote_type = vote_type.as_str(), "vote: cast");
    publish_vote_update(store, hub, &ctx, card_id).await;
    Ok(vote)
}

/// Delete a vote and notify every client.
///
/// # Errors
///
/// Returns [`StoreError::NotFound`] if the vote does not exist.
pub async fn retract_vote(store: &dyn BoardStore, hub: &Hub, vote_id: Uuid) -> Result<(), StoreError> {
    let card_id = store.delete_vote(vote_id).await?.ok_or(StoreError::NotFound(vote_id))?;
    info!(%vote_id, %card_id, "vote: retracted");
    match store.voting_context(card_id).await {
        Ok(Some(ctx)) => publish_vote_update(store, hub, &ctx, card_id).await,
        Ok(None) => {}
        Err(e) => warn!(error = %e, %card_id, "vote: context lookup failed, vote_update skipped"),
    }
    Ok(())
}

/// Publish the current counts. The mutation has already committed, so
/// failures here are logged rather than returned.
async fn publish_vote_update(store: &dyn BoardStore, hub: &Hub, ctx: &VotingContext, card_id: Uuid) {
    let votes = match store.card_votes(card_id).await {
        Ok(votes) => votes,
        Err(e) => {
            warn!(error = %e, %card_id, "vote: reload failed, vote_update skipped");
            return;
        }
    };
    if let Err(e) = hub.broadcast(&vote_update_event(ctx, card_id, &votes)).await {
        warn!(error = %e, %card_id, "vote: vote_update broadcast failed");
    }
}

#[cfg(test)]
#[path = "vote_test.rs"]
mod tests;
