//! WebSocket handler — reader/writer pair per connection.
//!
//! DESIGN
//! ======
//! On upgrade the connection registers an outbound queue with the hub and
//! splits into two tasks. The reader classifies each inbound text frame,
//! applies any hub side effect, then relays the frame unchanged. The writer
//! drains the outbound queue and sends keepalive pings.
//!
//! The two halves share exactly two signals: the outbound queue, which the
//! hub closes on unregister or slow-consumer eviction, and a oneshot held by
//! the writer, which drops when the writer gives up on the socket.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade → register with the hub
//! 2. Reader loop until close, read error, idle deadline, or writer exit
//! 3. Unregister → hub drops the queue → writer sends Close and exits

use axum::body::Bytes;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior, timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ConnectionConfig;
use crate::event::{Inbound, Payload, classify};
use crate::hub::ConnId;
use crate::services;
use crate::state::AppState;

/// Upper bound on frames written between two flushes.
const MAX_WRITE_BATCH: usize = 64;

#[derive(Debug, thiserror::Error)]
enum WriteError {
    #[error("write timed out")]
    Timeout,
    #[error("transport: {0}")]
    Transport(#[from] axum::Error),
}

// =============================================================================
// UPGRADE
// =============================================================================

/// `GET /ws` — no identity at upgrade time; clients announce it with `join_board`.
pub async fn handle_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let limit = state.connection.max_message_bytes;
    ws.max_message_size(limit)
        .max_frame_size(limit)
        .on_upgrade(move |socket| run_ws(socket, state))
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(socket: WebSocket, state: AppState) {
    let conn_id = Uuid::new_v4();
    let config = state.connection;

    let (tx, rx) = mpsc::channel::<Payload>(config.outbound_capacity);
    if let Err(e) = state.hub.register(conn_id, tx).await {
        warn!(%conn_id, error = %e, "ws: register failed");
        return;
    }
    info!(%conn_id, "ws: client connected");

    let (sink, stream) = socket.split();
    let (closed_tx, closed_rx) = oneshot::channel::<()>();
    let writer = tokio::spawn(write_pump(conn_id, sink, rx, config, closed_tx));

    read_pump(&state, conn_id, stream, &config, closed_rx).await;

    if let Err(e) = state.hub.unregister(conn_id).await {
        warn!(%conn_id, error = %e, "ws: unregister failed");
    }
    let _ = writer.await;
    info!(%conn_id, "ws: client disconnected");
}

async fn read_pump(
    state: &AppState,
    conn_id: ConnId,
    mut stream: SplitStream<WebSocket>,
    config: &ConnectionConfig,
    mut writer_closed: oneshot::Receiver<()>,
) {
    loop {
        // Any inbound frame, pongs included, refreshes the idle deadline.
        let next = tokio::select! {
            _ = &mut writer_closed => break,
            next = timeout(config.pong_wait, stream.next()) => next,
        };
        let msg = match next {
            Err(_) => {
                info!(%conn_id, "ws: read deadline expired");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                debug!(%conn_id, error = %e, "ws: read error");
                break;
            }
            Ok(Some(Ok(msg))) => msg,
        };

        match msg {
            Message::Text(text) => process_inbound_text(state, conn_id, text.as_str()).await,
            Message::Close(_) => break,
            _ => {}
        }
    }
}

/// Apply one inbound text frame: hub side effect first, then relay.
///
/// Frames that are not JSON objects are dropped. Everything else is relayed
/// verbatim, control messages included, so clients on every instance see them.
pub(crate) async fn process_inbound_text(state: &AppState, conn_id: ConnId, text: &str) {
    let Some(inbound) = classify(text) else {
        debug!(%conn_id, "ws: dropping non-object frame");
        return;
    };

    let applied = match inbound {
        Inbound::Join { board_id, participant } => state.hub.join(conn_id, board_id, participant).await,
        Inbound::Leave { board_id, username } => state.hub.leave(conn_id, board_id, username).await,
        Inbound::PhaseChange { board_id, phase } => {
            services::board::spawn_phase_change(state.store.clone(), state.hub.clone(), board_id, phase);
            Ok(())
        }
        Inbound::Relay { kind } => {
            debug!(%conn_id, kind = kind.as_deref().unwrap_or("<none>"), "ws: relay");
            Ok(())
        }
    };

    if let Err(e) = applied.and(state.hub.relay(Payload::from(text)).await) {
        warn!(%conn_id, error = %e, "ws: hub unavailable");
    }
}

// =============================================================================
// WRITER
// =============================================================================

async fn write_pump(
    conn_id: ConnId,
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Payload>,
    config: ConnectionConfig,
    _closed: oneshot::Sender<()>,
) {
    let mut ping = tokio::time::interval_at(Instant::now() + config.ping_interval, config.ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            next = rx.recv() => {
                let Some(payload) = next else {
                    // Queue closed by unregister or eviction.
                    let _ = timeout(config.write_timeout, sink.send(Message::Close(None))).await;
                    return;
                };
                if let Err(e) = write_batch(&mut sink, &mut rx, payload, config).await {
                    debug!(%conn_id, error = %e, "ws: write failed");
                    return;
                }
            }
            _ = ping.tick() => {
                let sent = timeout(config.write_timeout, sink.send(Message::Ping(Bytes::new()))).await;
                if !matches!(sent, Ok(Ok(()))) {
                    debug!(%conn_id, "ws: ping failed");
                    return;
                }
            }
        }
    }
}

/// Write `first` plus whatever else is already queued, then flush once.
/// Each payload stays its own text frame.
async fn write_batch(
    sink: &mut SplitSink<WebSocket, Message>,
    rx: &mut mpsc::Receiver<Payload>,
    first: Payload,
    config: ConnectionConfig,
) -> Result<(), WriteError> {
    let write = async {
        sink.feed(text_message(&first)).await?;
        for _ in 1..MAX_WRITE_BATCH {
            let Ok(payload) = rx.try_recv() else { break };
            sink.feed(text_message(&payload)).await?;
        }
        sink.flush().await
    };
    timeout(config.write_timeout, write).await.map_err(|_| WriteError::Timeout)??;
    Ok(())
}

fn text_message(payload: &Payload) -> Message {
    Message::Text(payload.to_string().into())
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
