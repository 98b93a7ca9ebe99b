//! Shared application state.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor. It
//! holds the process's single hub handle, the board store, and the
//! per-connection transport settings. Everything inside is cheap to clone.

use std::sync::Arc;

use crate::config::ConnectionConfig;
use crate::hub::Hub;
use crate::store::BoardStore;

#[derive(Clone)]
pub struct AppState {
    pub hub: Hub,
    pub store: Arc<dyn BoardStore>,
    pub connection: ConnectionConfig,
}

impl AppState {
    #[must_use]
    pub fn new(hub: Hub, store: Arc<dyn BoardStore>, connection: ConnectionConfig) -> Self {
        Self { hub, store, connection: connection.normalized() }
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================
