//! Hub — one instance's live connections and board presence.
//!
//! ARCHITECTURE
//! ============
//! A single dispatch loop owns the connection set and is the only writer of
//! the presence table. Everything else talks to it through the bounded
//! command queue: websocket readers (register/join/leave/relay/unregister),
//! HTTP handlers (broadcast), and the fan-out bridge (backbone deliveries and
//! publish fallbacks). Snapshot reads of presence go through a narrow
//! read lock and never touch the loop.
//!
//! DELIVERY
//! ========
//! Outbound events go to the bridge. With a live backbone the event reaches
//! local clients through this instance's own subscription, like every other
//! instance; otherwise it is broadcast locally. Backbone-origin payloads are
//! only ever broadcast locally, never republished.
//!
//! Local broadcast never awaits a client: a connection whose outbound queue
//! is full is evicted on the spot, exactly as if it had disconnected.

pub mod bridge;
pub mod presence;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::HubConfig;
use crate::event::{Event, Payload};
use bridge::{Backbone, Publisher};
use presence::{Participant, PresenceTable};

/// Opaque connection identifier.
pub type ConnId = Uuid;

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("hub dispatch loop has stopped")]
    Closed,
    #[error("event encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

// =============================================================================
// COMMANDS
// =============================================================================

#[derive(Debug)]
pub(crate) enum Command {
    Register { conn_id: ConnId, tx: mpsc::Sender<Payload> },
    Unregister { conn_id: ConnId },
    Join { conn_id: ConnId, board_id: String, participant: Participant },
    Leave { conn_id: ConnId, board_id: String, username: String },
    /// Local-origin payload headed for the bridge.
    Publish(Payload),
    /// Bridge could not publish; deliver to this instance only.
    BroadcastLocal(Payload),
    /// Delivered by the backbone subscription.
    BroadcastRemote(Payload),
}

// =============================================================================
// HUB HANDLE
// =============================================================================

/// Cloneable handle to one instance's dispatch loop. Construct one per
/// process with [`Hub::start`] and pass it to every component that needs it.
#[derive(Clone)]
pub struct Hub {
    commands: mpsc::Sender<Command>,
    presence: Arc<RwLock<PresenceTable>>,
}

impl Hub {
    /// Start the dispatch loop and, if a backbone is given, the bridge tasks.
    pub async fn start(config: HubConfig, backbone: Option<Arc<dyn Backbone>>) -> (Self, JoinHandle<()>) {
        let (commands, rx) = mpsc::channel(config.command_capacity);
        let presence = Arc::new(RwLock::new(PresenceTable::new()));
        let publisher = bridge::start(backbone, commands.clone(), config.publish_capacity, config.publish_timeout).await;

        let dispatcher = Dispatcher { connections: HashMap::new(), presence: presence.clone(), publisher };
        let handle = tokio::spawn(dispatcher.run(rx));

        (Self { commands, presence }, handle)
    }

    /// Add a connection and its outbound queue to the live set.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the dispatch loop has stopped.
    pub async fn register(&self, conn_id: ConnId, tx: mpsc::Sender<Payload>) -> Result<(), HubError> {
        self.send(Command::Register { conn_id, tx }).await
    }

    /// Drop a connection, releasing any presence slot it still owns.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the dispatch loop has stopped.
    pub async fn unregister(&self, conn_id: ConnId) -> Result<(), HubError> {
        self.send(Command::Unregister { conn_id }).await
    }

    /// Bind a connection to a board as `participant`.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the dispatch loop has stopped.
    pub async fn join(&self, conn_id: ConnId, board_id: String, participant: Participant) -> Result<(), HubError> {
        self.send(Command::Join { conn_id, board_id, participant }).await
    }

    /// Remove `username` from a board.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the dispatch loop has stopped.
    pub async fn leave(&self, conn_id: ConnId, board_id: String, username: String) -> Result<(), HubError> {
        self.send(Command::Leave { conn_id, board_id, username }).await
    }

    /// Forward an inbound payload unchanged to every subscriber.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the dispatch loop has stopped.
    pub async fn relay(&self, payload: Payload) -> Result<(), HubError> {
        self.send(Command::Publish(payload)).await
    }

    /// Serialize and publish a server-originated event.
    ///
    /// # Errors
    ///
    /// Returns an encode error or [`HubError::Closed`].
    pub async fn broadcast(&self, event: &Event) -> Result<(), HubError> {
        let payload = event.to_payload()?;
        self.send(Command::Publish(payload)).await
    }

    /// Current participants of a board on this instance.
    #[cfg(test)]
    #[must_use]
    pub fn participants(&self, board_id: &str) -> Vec<Participant> {
        self.snapshot(board_id).1
    }

    /// Presence revision and participants, read under one lock.
    #[must_use]
    pub fn snapshot(&self, board_id: &str) -> (u64, Vec<Participant>) {
        let table = self.presence.read().unwrap_or_else(PoisonError::into_inner);
        (table.revision(), table.participants(board_id))
    }

    async fn send(&self, command: Command) -> Result<(), HubError> {
        self.commands.send(command).await.map_err(|_| HubError::Closed)
    }
}

// =============================================================================
// DISPATCH LOOP
// =============================================================================

struct Connection {
    tx: mpsc::Sender<Payload>,
    binding: Option<Binding>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    board_id: String,
    username: String,
}

struct Dispatcher {
    connections: HashMap<ConnId, Connection>,
    presence: Arc<RwLock<PresenceTable>>,
    publisher: Publisher,
}

impl Dispatcher {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        info!(backbone = self.publisher.is_enabled(), "hub: dispatch loop started");
        while let Some(command) = rx.recv().await {
            self.handle(command);
        }
        info!("hub: dispatch loop stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Register { conn_id, tx } => {
                self.connections.insert(conn_id, Connection { tx, binding: None });
                debug!(%conn_id, total = self.connections.len(), "hub: registered");
            }
            Command::Unregister { conn_id } => {
                if let Some(board_id) = self.drop_connection(conn_id) {
                    self.emit_participants(&board_id);
                }
            }
            Command::Join { conn_id, board_id, participant } => self.join(conn_id, board_id, participant),
            Command::Leave { conn_id, board_id, username } => self.leave(conn_id, &board_id, &username),
            Command::Publish(payload) => self.publish(payload),
            Command::BroadcastLocal(payload) | Command::BroadcastRemote(payload) => self.broadcast_local(payload),
        }
    }

    fn join(&mut self, conn_id: ConnId, board_id: String, participant: Participant) {
        let Some(conn) = self.connections.get_mut(&conn_id) else {
            debug!(%conn_id, %board_id, "hub: join from unknown connection ignored");
            return;
        };
        let binding = Binding { board_id: board_id.clone(), username: participant.username.clone() };
        let previous = conn.binding.replace(binding.clone());

        let mut presence = self.presence.write().unwrap_or_else(PoisonError::into_inner);

        // Rebinding without an explicit leave releases the old slot first.
        let mut vacated = None;
        if let Some(old) = previous.filter(|old| *old != binding) {
            if presence.remove_if_owner(&old.board_id, &old.username, conn_id) {
                vacated = Some(old.board_id);
            }
        }

        if let Some(prev_owner) = presence.upsert(&board_id, participant, conn_id) {
            info!(%conn_id, %prev_owner, %board_id, username = %binding.username, "hub: rejoin replaced slot");
        }
        let boards = presence.board_count();
        drop(presence);
        info!(%conn_id, %board_id, username = %binding.username, boards, "hub: joined board");

        if let Some(old_board) = vacated.filter(|old| *old != board_id) {
            self.emit_participants(&old_board);
        }
        self.emit_participants(&board_id);
    }

    fn leave(&mut self, conn_id: ConnId, board_id: &str, username: &str) {
        if let Some(conn) = self.connections.get_mut(&conn_id) {
            if conn
                .binding
                .as_ref()
                .is_some_and(|b| b.board_id == board_id && b.username == username)
            {
                conn.binding = None;
            }
        }
        let removed = self
            .presence
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(board_id, username);
        info!(%conn_id, %board_id, username, removed, "hub: left board");
        self.emit_participants(board_id);
    }

    /// Remove a connection and close its queue. Returns the board whose
    /// presence changed, if the connection still owned its slot.
    fn drop_connection(&mut self, conn_id: ConnId) -> Option<String> {
        let conn = self.connections.remove(&conn_id)?;
        debug!(%conn_id, total = self.connections.len(), "hub: unregistered");
        let binding = conn.binding?;
        let mut presence = self.presence.write().unwrap_or_else(PoisonError::into_inner);
        if presence.remove_if_owner(&binding.board_id, &binding.username, conn_id) {
            return Some(binding.board_id);
        }
        if let Some(owner) = presence.owner(&binding.board_id, &binding.username) {
            debug!(%conn_id, %owner, board_id = %binding.board_id, "hub: stale teardown kept newer slot");
        }
        None
    }

    fn emit_participants(&mut self, board_id: &str) {
        if let Some(payload) = self.participants_payload(board_id) {
            self.publish(payload);
        }
    }

    fn participants_payload(&self, board_id: &str) -> Option<Payload> {
        let participants = self
            .presence
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .participants(board_id);
        Event::participants_update(board_id, &participants)
            .to_payload()
            .inspect_err(|e| warn!(error = %e, %board_id, "hub: participants_update encode failed"))
            .ok()
    }

    fn publish(&mut self, payload: Payload) {
        if let Err(payload) = self.publisher.try_publish(payload) {
            self.broadcast_local(payload);
        }
    }

    /// Deliver to every local queue without waiting. Evictions can produce
    /// further presence updates, which are worked off iteratively.
    fn broadcast_local(&mut self, payload: Payload) {
        let mut pending = VecDeque::from([payload]);
        while let Some(payload) = pending.pop_front() {
            let mut evicted = Vec::new();
            for (conn_id, conn) in &self.connections {
                match conn.tx.try_send(payload.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        warn!(%conn_id, "hub: outbound queue full, evicting slow consumer");
                        evicted.push(*conn_id);
                    }
                    Err(TrySendError::Closed(_)) => evicted.push(*conn_id),
                }
            }

            for conn_id in evicted {
                let Some(board_id) = self.drop_connection(conn_id) else {
                    continue;
                };
                let Some(update) = self.participants_payload(&board_id) else {
                    continue;
                };
                if let Err(update) = self.publisher.try_publish(update) {
                    pending.push_back(update);
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
