//! Board service — phase change persistence.
//!
//! ERROR HANDLING
//! ==============
//! A `phase_change` is relayed to clients whether or not it persists; the
//! two are not transactional. Persistence runs off the reader task and its
//! failures are only logged. A successful write is followed by a
//! `board_update` refresh hint, since the phase decides vote redaction.

use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use crate::event::Event;
use crate::hub::{Hub, HubError};
use crate::store::{BoardStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum PhaseError {
    #[error("invalid board id: {0}")]
    InvalidBoardId(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Hub(#[from] HubError),
}

/// Persist the phase and ask every client to refresh the board.
///
/// # Errors
///
/// Returns [`PhaseError::InvalidBoardId`] for a non-UUID id, or the store
/// or hub failure.
pub async fn apply_phase_change(
    store: &dyn BoardStore,
    hub: &Hub,
    board_id: &str,
    phase: &str,
) -> Result<(), PhaseError> {
    let id = Uuid::parse_str(board_id).map_err(|_| PhaseError::InvalidBoardId(board_id.to_owned()))?;
    store.set_phase(id, phase).await?;
    info!(%board_id, phase, "board: phase persisted");
    hub.broadcast(&Event::board_refresh(board_id)).await?;
    Ok(())
}

/// Fire-and-forget [`apply_phase_change`].
pub fn spawn_phase_change(store: Arc<dyn BoardStore>, hub: Hub, board_id: String, phase: String) {
    tokio::spawn(async move {
        if let Err(e) = apply_phase_change(store.as_ref(), &hub, &board_id, &phase).await {
            warn!(error = %e, %board_id, phase, "board: phase change not persisted");
        }
    });
}

#[cfg(test)]
#[path = "board_test.rs"]
mod tests;
