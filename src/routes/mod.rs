//! Router assembly.
//!
//! SYSTEM CONTEXT
//! ==============
//! One Axum router carries the websocket upgrade, the presence snapshot and
//! vote endpoints, and the health check. CORS is open because the board UI
//! is served from the CRUD service's origin.

pub mod boards;
pub mod votes;
pub mod ws;

use axum::Router;
use axum::http::StatusCode;
use axum::routing::{delete, get};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ws", get(ws::handle_ws))
        .route("/api/boards/{id}/participants", get(boards::list_participants))
        .route("/api/cards/{id}/votes", get(votes::list_votes).post(votes::cast_vote))
        .route("/api/votes/{id}", delete(votes::delete_vote))
        .route("/healthz", get(healthz))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
