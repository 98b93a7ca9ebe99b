//! Board store — the CRUD service's tables, seen from the hub.
//!
//! SYSTEM CONTEXT
//! ==============
//! Boards, columns, cards, and votes are owned by the CRUD layer and its
//! schema. This service reads and writes just enough of them to persist
//! phase changes and to answer vote queries, through the [`BoardStore`]
//! trait so handlers and tests never depend on a live database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

use crate::services::vote::VOTING_PHASE;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(Uuid),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteKind {
    Like,
    Dislike,
}

impl VoteKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Like => "like",
            Self::Dislike => "dislike",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "like" => Some(Self::Like),
            "dislike" => Some(Self::Dislike),
            _ => None,
        }
    }
}

/// One user's vote on one card. Mirrors the `votes` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub id: Uuid,
    pub card_id: Uuid,
    pub user_name: String,
    pub vote_type: VoteKind,
    pub created_at: DateTime<Utc>,
}

/// Board settings that decide whether a card's votes are visible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VotingContext {
    pub board_id: Uuid,
    pub blind_voting: bool,
    pub phase: String,
}

impl VotingContext {
    /// Blind voting hides counts only while the board is in its voting phase.
    #[must_use]
    pub fn is_hidden(&self) -> bool {
        self.blind_voting && self.phase == VOTING_PHASE
    }
}

// =============================================================================
// TRAIT
// =============================================================================

#[async_trait]
pub trait BoardStore: Send + Sync {
    /// Update the board's phase field.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the board does not exist.
    async fn set_phase(&self, board_id: Uuid, phase: &str) -> Result<(), StoreError>;

    /// Resolve the owning board's voting settings for a card.
    ///
    /// # Errors
    ///
    /// Returns a database error if the lookup fails.
    async fn voting_context(&self, card_id: Uuid) -> Result<Option<VotingContext>, StoreError>;

    /// All votes on a card, oldest first.
    ///
    /// # Errors
    ///
    /// Returns a database error if the query fails.
    async fn card_votes(&self, card_id: Uuid) -> Result<Vec<Vote>, StoreError>;

    /// Record a vote. One vote per user per card.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] if `user_name` already voted on the card.
    async fn add_vote(&self, card_id: Uuid, user_name: &str, vote_type: VoteKind) -> Result<Vote, StoreError>;

    /// Delete a vote, returning the card it belonged to.
    ///
    /// # Errors
    ///
    /// Returns a database error if the delete fails.
    async fn delete_vote(&self, vote_id: Uuid) -> Result<Option<Uuid>, StoreError>;
}

// =============================================================================
// POSTGRES
// =============================================================================

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BoardStore for PgStore {
    async fn set_phase(&self, board_id: Uuid, phase: &str) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE boards SET phase = $2 WHERE id = $1")
            .bind(board_id)
            .bind(phase)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(board_id));
        }
        Ok(())
    }

    async fn voting_context(&self, card_id: Uuid) -> Result<Option<VotingContext>, StoreError> {
        let row = sqlx::query_as::<_, (Uuid, bool, String)>(
            "SELECT b.id, b.blind_voting, b.phase
             FROM cards c
             JOIN columns col ON col.id = c.column_id
             JOIN boards b ON b.id = col.board_id
             WHERE c.id = $1",
        )
        .bind(card_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(board_id, blind_voting, phase)| VotingContext { board_id, blind_voting, phase }))
    }

    async fn card_votes(&self, card_id: Uuid) -> Result<Vec<Vote>, StoreError> {
        let rows = sqlx::query_as::<_, (Uuid, Uuid, String, String, DateTime<Utc>)>(
            "SELECT id, card_id, user_name, vote_type, created_at
             FROM votes
             WHERE card_id = $1
             ORDER BY created_at ASC, id ASC",
        )
        .bind(card_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(id, card_id, user_name, vote_type, created_at)| {
                let Some(vote_type) = VoteKind::parse(&vote_type) else {
                    warn!(%id, %card_id, vote_type, "store: skipping vote with unknown type");
                    return None;
                };
                Some(Vote { id, card_id, user_name, vote_type, created_at })
            })
            .collect())
    }

    async fn add_vote(&self, card_id: Uuid, user_name: &str, vote_type: VoteKind) -> Result<Vote, StoreError> {
        let conflict = || StoreError::Conflict(format!("{user_name} already voted on card {card_id}"));
        let mut tx = self.pool.begin().await?;

        // Serializes casts for one (card, user); the schema may not enforce uniqueness.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(format!("vote:{card_id}:{user_name}"))
            .execute(&mut *tx)
            .await?;

        let id = Uuid::new_v4();
        let inserted = sqlx::query_as::<_, (DateTime<Utc>,)>(
            "INSERT INTO votes (id, card_id, user_name, vote_type)
             SELECT $1, $2, $3, $4
             WHERE NOT EXISTS (SELECT 1 FROM votes WHERE card_id = $2 AND user_name = $3)
             RETURNING created_at",
        )
        .bind(id)
        .bind(card_id)
        .bind(user_name)
        .bind(vote_type.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| if is_unique_violation(&e) { conflict() } else { StoreError::Database(e) })?;

        let Some((created_at,)) = inserted else {
            return Err(conflict());
        };
        tx.commit().await?;

        Ok(Vote { id, card_id, user_name: user_name.to_owned(), vote_type, created_at })
    }

    async fn delete_vote(&self, vote_id: Uuid) -> Result<Option<Uuid>, StoreError> {
        let row = sqlx::query_as::<_, (Uuid,)>("DELETE FROM votes WHERE id = $1 RETURNING card_id")
            .bind(vote_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(card_id,)| card_id))
    }
}

/// Unique-key rejection, raised when the schema does enforce one vote per user.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error().is_some_and(|db| db.is_unique_violation())
}

#[cfg(test)]
#[path = "store_test.rs"]
mod tests;
