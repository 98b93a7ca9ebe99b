//! Fan-out bridge — relays hub events through a shared pub/sub topic.
//!
//! DESIGN
//! ======
//! Two tasks per process. The publisher drains a bounded queue fed by the
//! dispatch loop and publishes each payload to the backbone; a failed publish
//! is handed back to the hub as a local-only broadcast. The subscriber
//! consumes the topic and feeds every payload into the hub's command queue
//! as a backbone-origin broadcast.
//!
//! ERROR HANDLING
//! ==============
//! The backbone is probed once at startup with a bounded timeout. If it is
//! unreachable, or the subscription later ends, the bridge stays disabled for
//! the rest of the process and the hub broadcasts locally. There is no
//! reconnect loop; clients recover by reconnecting.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::StreamExt;
use futures::stream::BoxStream;
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::Command;
use crate::config::BackboneConfig;
use crate::event::Payload;

#[derive(Debug, thiserror::Error)]
pub enum BackboneError {
    #[error("backbone timed out after {0:?}")]
    Timeout(Duration),
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

// =============================================================================
// BACKBONE
// =============================================================================

/// Shared publish/subscribe topic. Every subscriber, including the
/// publishing instance's own, receives each published payload.
#[async_trait::async_trait]
pub trait Backbone: Send + Sync {
    /// Publish one serialized envelope to the topic.
    ///
    /// # Errors
    ///
    /// Returns a [`BackboneError`] if the backbone rejects or cannot reach the topic.
    async fn publish(&self, payload: &str) -> Result<(), BackboneError>;

    /// Open a subscription to the topic.
    ///
    /// # Errors
    ///
    /// Returns a [`BackboneError`] if the subscription cannot be established.
    async fn subscribe(&self) -> Result<BoxStream<'static, String>, BackboneError>;
}

/// Redis pub/sub backbone.
pub struct RedisBackbone {
    client: redis::Client,
    conn: redis::aio::MultiplexedConnection,
    topic: String,
    timeout: Duration,
}

impl RedisBackbone {
    /// Connect within `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`BackboneError::Timeout`] or the underlying redis error.
    pub async fn connect(url: &str, topic: &str, timeout: Duration) -> Result<Self, BackboneError> {
        let client = redis::Client::open(url)?;
        let conn = tokio::time::timeout(timeout, client.get_multiplexed_async_connection())
            .await
            .map_err(|_| BackboneError::Timeout(timeout))??;
        Ok(Self { client, conn, topic: topic.to_owned(), timeout })
    }
}

#[async_trait::async_trait]
impl Backbone for RedisBackbone {
    async fn publish(&self, payload: &str) -> Result<(), BackboneError> {
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(&self.topic, payload).await?;
        Ok(())
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, String>, BackboneError> {
        let mut pubsub = tokio::time::timeout(self.timeout, self.client.get_async_pubsub())
            .await
            .map_err(|_| BackboneError::Timeout(self.timeout))??;
        pubsub.subscribe(&self.topic).await?;
        let stream = pubsub
            .into_on_message()
            .filter_map(|msg| async move {
                msg.get_payload::<String>()
                    .inspect_err(|e| warn!(error = %e, "bridge: dropping non-text backbone payload"))
                    .ok()
            });
        Ok(stream.boxed())
    }
}

/// In-process backbone. Hubs holding clones of one `MemoryBackbone` behave
/// like instances sharing a Redis topic.
#[cfg(test)]
#[derive(Clone)]
pub struct MemoryBackbone {
    tx: tokio::sync::broadcast::Sender<String>,
}

#[cfg(test)]
impl MemoryBackbone {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity.max(1));
        Self { tx }
    }
}

#[cfg(test)]
#[async_trait::async_trait]
impl Backbone for MemoryBackbone {
    async fn publish(&self, payload: &str) -> Result<(), BackboneError> {
        // No subscribers is not an error, same as Redis PUBLISH.
        let _ = self.tx.send(payload.to_owned());
        Ok(())
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, String>, BackboneError> {
        use tokio::sync::broadcast::error::RecvError;

        let rx = self.tx.subscribe();
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => return Some((payload, rx)),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "bridge: subscriber lagged, payloads dropped");
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }
}

/// Probe the configured backbone once. `None` means local-only mode.
pub async fn connect_backbone(config: &BackboneConfig) -> Option<Arc<dyn Backbone>> {
    let Some(url) = config.url.as_deref() else {
        info!("bridge: no REDIS_URL configured, local-only broadcast");
        return None;
    };
    match RedisBackbone::connect(url, &config.topic, config.connect_timeout).await {
        Ok(backbone) => {
            info!(topic = %config.topic, "bridge: backbone connected");
            Some(Arc::new(backbone))
        }
        Err(e) => {
            warn!(error = %e, "bridge: backbone unreachable, local-only broadcast for process lifetime");
            None
        }
    }
}

// =============================================================================
// PUBLISHER HANDLE
// =============================================================================

/// Dispatch loop's side of the bridge. Never blocks.
pub(crate) struct Publisher {
    tx: Option<mpsc::Sender<Payload>>,
    subscribed: Arc<AtomicBool>,
}

impl Publisher {
    fn disabled() -> Self {
        Self { tx: None, subscribed: Arc::new(AtomicBool::new(false)) }
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.tx.is_some() && self.subscribed.load(Ordering::Relaxed)
    }

    /// Queue a payload for the backbone. Hands it back when the bridge is
    /// disabled or its queue is full, so the caller can deliver locally.
    pub(crate) fn try_publish(&self, payload: Payload) -> Result<(), Payload> {
        let Some(tx) = self.tx.as_ref().filter(|_| self.subscribed.load(Ordering::Relaxed)) else {
            return Err(payload);
        };
        tx.try_send(payload).map_err(|e| {
            warn!("bridge: publish queue full, delivering locally");
            e.into_inner()
        })
    }
}

// =============================================================================
// TASKS
// =============================================================================

/// Subscribe and spawn the bridge tasks. Returns a disabled publisher when
/// there is no backbone or the subscription cannot be opened.
pub(crate) async fn start(
    backbone: Option<Arc<dyn Backbone>>,
    commands: mpsc::Sender<Command>,
    publish_capacity: usize,
    publish_timeout: Duration,
) -> Publisher {
    let Some(backbone) = backbone else {
        return Publisher::disabled();
    };
    let stream = match backbone.subscribe().await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = %e, "bridge: subscribe failed, local-only broadcast for process lifetime");
            return Publisher::disabled();
        }
    };

    let subscribed = Arc::new(AtomicBool::new(true));
    tokio::spawn(run_subscriber(stream, commands.clone(), subscribed.clone()));

    let (tx, rx) = mpsc::channel(publish_capacity.max(1));
    tokio::spawn(run_publisher(backbone, rx, commands, publish_timeout));

    Publisher { tx: Some(tx), subscribed }
}

/// Publishes one payload at a time. A publish that outlives `publish_timeout`
/// counts as failed, so a stalled backbone cannot hold up local delivery.
async fn run_publisher(
    backbone: Arc<dyn Backbone>,
    mut rx: mpsc::Receiver<Payload>,
    commands: mpsc::Sender<Command>,
    publish_timeout: Duration,
) {
    while let Some(payload) = rx.recv().await {
        let published = tokio::time::timeout(publish_timeout, backbone.publish(&payload))
            .await
            .unwrap_or(Err(BackboneError::Timeout(publish_timeout)));
        if let Err(e) = published {
            warn!(error = %e, "bridge: publish failed, delivering locally");
            if commands.send(Command::BroadcastLocal(payload)).await.is_err() {
                break;
            }
        }
    }
}

async fn run_subscriber(
    mut stream: BoxStream<'static, String>,
    commands: mpsc::Sender<Command>,
    subscribed: Arc<AtomicBool>,
) {
    while let Some(text) = stream.next().await {
        if commands.send(Command::BroadcastRemote(Payload::from(text))).await.is_err() {
            return;
        }
    }
    subscribed.store(false, Ordering::Relaxed);
    warn!("bridge: backbone subscription ended, local-only broadcast for process lifetime");
}

#[cfg(test)]
#[path = "bridge_test.rs"]
mod tests;
