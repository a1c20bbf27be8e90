/// Peer session manager: one pub/sub channel per room.
///
/// The session owns the peer node for the active room. Joining a room
/// creates a node, dials the bootstrap list, waits (bounded) for push and
/// filter service peers and subscribes to the room channel. Two background
/// tasks then run until the room is left: the inbound task decodes payloads
/// into [`AnnouncementRecord`]s, the monitor samples the peer count and
/// re-dials when it hits zero.
mod monitor;

use std::fmt;
use std::sync::{Arc, RwLock};

use roomdrop_transport::{NodeFactory, PubSubNode, REQUIRED_PROTOCOLS};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::announcement::AnnouncementRecord;
use crate::config::{validate_room_id, SessionConfig};
use crate::error::RoomdropError;
use crate::metrics::SessionMetrics;

// ── State ─────────────────────────────────────────────────────────────

/// Connection lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("disconnected"),
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Connected => f.write_str("connected"),
        }
    }
}

/// Observable session status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub state: ConnectionState,
    /// Room being joined or joined; `None` after `stop`.
    pub room_id: Option<String>,
    pub peer_count: usize,
    /// Last connection error, kept for display until the next success.
    pub last_error: Option<String>,
}

/// Events emitted by the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged {
        state: ConnectionState,
        room_id: Option<String>,
    },
    PeerCountChanged {
        count: usize,
    },
    /// One bootstrap re-dial made by the background loop.
    ReconnectAttempt {
        room_id: String,
        endpoint: String,
        success: bool,
    },
    /// An inbound payload could not be decoded and was dropped.
    RecordDropped {
        reason: String,
    },
}

// ── Reporter (status + events shared with background tasks) ───────────

#[derive(Debug)]
struct Reporter {
    status: watch::Sender<SessionStatus>,
    events: broadcast::Sender<SessionEvent>,
    metrics: Arc<SessionMetrics>,
}

impl Reporter {
    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Apply `update` to the status unless `guard` is cancelled, then emit
    /// events for whatever changed.
    fn update(&self, guard: Option<&CancellationToken>, update: impl FnOnce(&mut SessionStatus)) {
        let mut before = None;
        let mut after = None;
        self.status.send_if_modified(|status| {
            if guard.is_some_and(|g| g.is_cancelled()) {
                return false;
            }
            let old = status.clone();
            update(status);
            let changed = *status != old;
            if changed {
                after = Some(status.clone());
                before = Some(old);
            }
            changed
        });

        let (Some(before), Some(after)) = (before, after) else {
            return;
        };
        if before.state != after.state {
            tracing::info!(
                room = after.room_id.as_deref().unwrap_or("-"),
                from = %before.state,
                to = %after.state,
                "session state changed"
            );
            self.emit(SessionEvent::StateChanged {
                state: after.state,
                room_id: after.room_id.clone(),
            });
        }
        if before.peer_count != after.peer_count {
            self.metrics.peer_count.set(after.peer_count as i64);
            self.emit(SessionEvent::PeerCountChanged {
                count: after.peer_count,
            });
        }
    }
}

// ── Session handle ────────────────────────────────────────────────────

/// Node and channel of the joined room.
#[derive(Clone)]
struct Link {
    room_id: String,
    channel: String,
    node: Arc<dyn PubSubNode>,
}

struct ActiveRoom {
    link: Link,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    _guard: DropGuard,
}

struct Inner {
    config: SessionConfig,
    factory: Arc<dyn NodeFactory>,
    reporter: Arc<Reporter>,
    records: mpsc::Sender<AnnouncementRecord>,
    /// Serializes start/switch/stop.
    room: Mutex<Option<ActiveRoom>>,
    /// Set only while a room is joined; read by `publish`.
    link: RwLock<Option<Link>>,
}

/// Handle to the peer session. Cheap to clone.
#[derive(Clone)]
pub struct PeerSession {
    inner: Arc<Inner>,
}

/// A new session and the stream of decoded inbound records.
pub struct SessionChannels {
    pub session: PeerSession,
    pub records: mpsc::Receiver<AnnouncementRecord>,
}

impl PeerSession {
    /// Build an idle session. Nothing is dialed until [`start`](Self::start).
    pub fn new(config: SessionConfig, factory: Arc<dyn NodeFactory>) -> SessionChannels {
        let (records_tx, records_rx) = mpsc::channel(config.inbound_buffer.max(1));
        let (status, _) = watch::channel(SessionStatus::default());
        let (events, _) = broadcast::channel(config.event_buffer.max(1));

        let inner = Inner {
            config,
            factory,
            reporter: Arc::new(Reporter {
                status,
                events,
                metrics: Arc::new(SessionMetrics::default()),
            }),
            records: records_tx,
            room: Mutex::new(None),
            link: RwLock::new(None),
        };

        SessionChannels {
            session: PeerSession {
                inner: Arc::new(inner),
            },
            records: records_rx,
        }
    }

    /// Join `room_id`.
    ///
    /// A no-op when the session is already connecting or connected to the
    /// same room. A different room is left first.
    pub async fn start(&self, room_id: &str) -> Result<(), RoomdropError> {
        self.join(room_id).await
    }

    /// Leave the current room and join `room_id`.
    pub async fn switch_room(&self, room_id: &str) -> Result<(), RoomdropError> {
        tracing::info!(room = room_id, "switching room");
        self.join(room_id).await
    }

    /// Leave the current room, if any, and report `disconnected`.
    pub async fn stop(&self) {
        let mut room = self.inner.room.lock().await;
        if let Some(active) = room.take() {
            self.teardown(active).await;
        }
        self.inner.reporter.update(None, |status| {
            *status = SessionStatus::default();
        });
    }

    /// Publish raw bytes on the room channel.
    ///
    /// Fails with [`RoomdropError::NotConnected`] unless the session is
    /// `connected`. Success means the local node accepted the message.
    pub async fn publish(&self, payload: &[u8]) -> Result<(), RoomdropError> {
        let link = self.connected_link().ok_or(RoomdropError::NotConnected)?;
        let metrics = &self.inner.reporter.metrics;

        match link.node.publish(&link.channel, payload).await {
            Ok(()) => {
                metrics.publishes.inc();
                Ok(())
            }
            Err(e) => {
                metrics.publish_failures.inc();
                tracing::warn!(room = %link.room_id, "publish failed: {e}");
                Err(e.into())
            }
        }
    }

    /// Encode and publish an announcement.
    pub async fn publish_record(&self, record: &AnnouncementRecord) -> Result<(), RoomdropError> {
        let bytes = record.encode()?;
        self.publish(&bytes).await
    }

    pub fn status(&self) -> SessionStatus {
        self.inner.reporter.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.inner.reporter.status.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.reporter.events.subscribe()
    }

    pub fn metrics(&self) -> &SessionMetrics {
        &self.inner.reporter.metrics
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    fn connected_link(&self) -> Option<Link> {
        if self.inner.reporter.status.borrow().state != ConnectionState::Connected {
            return None;
        }
        self.inner
            .link
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    async fn join(&self, room_id: &str) -> Result<(), RoomdropError> {
        let room_id = validate_room_id(room_id)?;

        let mut room = self.inner.room.lock().await;
        if let Some(active) = room.as_ref() {
            let state = self.inner.reporter.status.borrow().state;
            if active.link.room_id == room_id && state != ConnectionState::Disconnected {
                tracing::debug!(room = room_id, %state, "already in room");
                return Ok(());
            }
        }
        if let Some(active) = room.take() {
            self.teardown(active).await;
        }

        let active = self.open(room_id).await?;
        *room = Some(active);
        Ok(())
    }

    async fn open(&self, room_id: &str) -> Result<ActiveRoom, RoomdropError> {
        let reporter = &self.inner.reporter;
        reporter.update(None, |status| {
            status.state = ConnectionState::Connecting;
            status.room_id = Some(room_id.to_string());
            status.peer_count = 0;
        });

        let link = match self.establish(room_id).await {
            Ok(link) => link,
            Err(e) => {
                tracing::warn!(room = room_id, "could not join room: {e}");
                let reason = e.to_string();
                reporter.update(None, |status| {
                    status.state = ConnectionState::Disconnected;
                    status.peer_count = 0;
                    status.last_error = Some(reason);
                });
                return Err(e);
            }
        };

        let subscription = link.node.subscribe(&link.channel).await;
        let subscription = match subscription {
            Ok(sub) => sub,
            Err(e) => {
                link.node.stop().await;
                let err = RoomdropError::from(e);
                let reason = err.to_string();
                reporter.update(None, |status| {
                    status.state = ConnectionState::Disconnected;
                    status.last_error = Some(reason);
                });
                return Err(err);
            }
        };

        let cancel = CancellationToken::new();
        let inbound = tokio::spawn(monitor::inbound_loop(
            link.room_id.clone(),
            subscription,
            self.inner.records.clone(),
            reporter.clone(),
            cancel.clone(),
        ));
        let peers = tokio::spawn(monitor::peer_monitor(
            link.clone(),
            self.inner.config.bootstrap.clone(),
            self.inner.config.peer_poll_interval,
            reporter.clone(),
            cancel.clone(),
        ));

        *self
            .inner
            .link
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(link.clone());

        let peer_count = link.node.peer_count().await;
        reporter.update(None, |status| {
            status.state = ConnectionState::Connected;
            status.peer_count = peer_count;
            status.last_error = None;
        });
        tracing::info!(room = room_id, channel = %link.channel, peer_count, "joined room");

        Ok(ActiveRoom {
            link,
            _guard: cancel.clone().drop_guard(),
            cancel,
            tasks: vec![inbound, peers],
        })
    }

    /// Create a node, dial, and wait for the required protocols.
    /// The node is stopped again on failure.
    async fn establish(&self, room_id: &str) -> Result<Link, RoomdropError> {
        let config = &self.inner.config;
        let node = self.inner.factory.create().await?;

        let ready = async {
            monitor::dial_all(node.as_ref(), &config.bootstrap).await?;
            tokio::time::timeout(
                config.protocol_timeout,
                node.wait_for_protocols(REQUIRED_PROTOCOLS),
            )
            .await
            .map_err(|_| {
                RoomdropError::Connection(format!(
                    "push and filter peers not available after {:?}",
                    config.protocol_timeout
                ))
            })??;
            Ok::<(), RoomdropError>(())
        };

        if let Err(e) = ready.await {
            node.stop().await;
            return Err(e);
        }

        Ok(Link {
            room_id: room_id.to_string(),
            channel: config.channel_for(room_id),
            node,
        })
    }

    async fn teardown(&self, active: ActiveRoom) {
        let ActiveRoom {
            link,
            cancel,
            tasks,
            _guard,
        } = active;

        cancel.cancel();
        *self
            .inner
            .link
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;

        if let Err(e) = link.node.unsubscribe(&link.channel).await {
            tracing::debug!(room = %link.room_id, "unsubscribe failed: {e}");
        }
        link.node.stop().await;
        for task in tasks {
            let _ = task.await;
        }
        tracing::info!(room = %link.room_id, "left room");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roomdrop_transport::MemoryNetwork;

    const BOOT: &str = "/dns4/boot-1/tcp/443/wss";

    fn session(network: &MemoryNetwork) -> SessionChannels {
        let config = SessionConfig::new().bootstrap([BOOT]);
        PeerSession::new(config, Arc::new(network.factory()))
    }

    #[tokio::test]
    async fn start_connects_and_reports() {
        let network = MemoryNetwork::with_endpoints([BOOT]);
        let SessionChannels { session, .. } = session(&network);

        session.start("lobby").await.unwrap();

        let status = session.status();
        assert_eq!(status.state, ConnectionState::Connected);
        assert_eq!(status.room_id.as_deref(), Some("lobby"));
        assert_eq!(status.peer_count, 1);
        assert_eq!(network.subscriber_count("/roomdrop/1/room-lobby/proto"), 1);
    }

    #[tokio::test]
    async fn publish_before_start_is_not_connected() {
        let network = MemoryNetwork::with_endpoints([BOOT]);
        let SessionChannels { session, .. } = session(&network);

        let err = session.publish(b"x").await.unwrap_err();
        assert!(matches!(err, RoomdropError::NotConnected));
    }

    #[tokio::test]
    async fn empty_room_is_rejected() {
        let network = MemoryNetwork::with_endpoints([BOOT]);
        let SessionChannels { session, .. } = session(&network);
        assert!(matches!(
            session.start(" ").await,
            Err(RoomdropError::Config(_))
        ));
        assert_eq!(network.nodes_created(), 0);
    }

    #[tokio::test]
    async fn stop_releases_subscription() {
        let network = MemoryNetwork::with_endpoints([BOOT]);
        let SessionChannels { session, .. } = session(&network);

        session.start("lobby").await.unwrap();
        session.stop().await;

        assert_eq!(session.status(), SessionStatus::default());
        assert_eq!(network.subscriber_count("/roomdrop/1/room-lobby/proto"), 0);
    }

    #[test]
    fn state_display() {
        assert_eq!(ConnectionState::Connecting.to_string(), "connecting");
    }
}
