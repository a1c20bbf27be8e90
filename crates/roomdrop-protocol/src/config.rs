//! Configuration for sessions and transfers, and the settings handed in by
//! the embedding application.
//!
//! Nothing here is persisted by roomdrop itself.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Namespace prefix shared by every roomdrop deployment.
pub const CHANNEL_NAMESPACE: &str = "/roomdrop";

/// Channel schema version.
pub const CHANNEL_VERSION: u32 = 1;

/// Environment variable overriding the bootstrap list (comma-separated).
pub const BOOTSTRAP_ENV: &str = "ROOMDROP_BOOTSTRAP";

/// Built-in bootstrap endpoints, tried in order.
pub const DEFAULT_BOOTSTRAP: &[&str] = &[
    "/dns4/node-01.ams.roomdrop.net/tcp/443/wss",
    "/dns4/node-01.nyc.roomdrop.net/tcp/443/wss",
    "/dns4/node-01.sgp.roomdrop.net/tcp/443/wss",
];

/// Shortest peer-count sampling interval a session accepts.
pub const MIN_PEER_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Channel name for a room: `"<namespace>/<version>/room-<roomId>/proto"`.
///
/// Every peer computes the same name for the same room.
pub fn channel_name(namespace: &str, version: u32, room_id: &str) -> String {
    format!("{namespace}/{version}/room-{room_id}/proto")
}

// ── Session ───────────────────────────────────────────────────────────

/// Configuration for a [`PeerSession`](crate::PeerSession).
///
/// ```rust
/// use std::time::Duration;
/// use roomdrop_protocol::SessionConfig;
///
/// let config = SessionConfig::new()
///     .bootstrap(["/dns4/localhost/tcp/8000/ws"])
///     .protocol_timeout(Duration::from_secs(5));
/// assert_eq!(config.channel_for("lobby"), "/roomdrop/1/room-lobby/proto");
/// ```
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub(crate) bootstrap: Vec<String>,
    pub(crate) namespace: String,
    pub(crate) version: u32,
    pub(crate) protocol_timeout: Duration,
    pub(crate) peer_poll_interval: Duration,
    pub(crate) inbound_buffer: usize,
    pub(crate) event_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionConfig {
    /// Defaults, with the bootstrap list taken from `ROOMDROP_BOOTSTRAP` when set.
    pub fn new() -> Self {
        let bootstrap = std::env::var(BOOTSTRAP_ENV)
            .ok()
            .map(|raw| parse_endpoint_list(&raw))
            .filter(|list| !list.is_empty())
            .unwrap_or_else(|| DEFAULT_BOOTSTRAP.iter().map(|s| s.to_string()).collect());

        Self {
            bootstrap,
            namespace: CHANNEL_NAMESPACE.to_string(),
            version: CHANNEL_VERSION,
            protocol_timeout: Duration::from_secs(15),
            peer_poll_interval: Duration::from_secs(5),
            inbound_buffer: 256,
            event_buffer: 64,
        }
    }

    /// Replace the bootstrap endpoint list.
    pub fn bootstrap<I, S>(mut self, endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.bootstrap = endpoints.into_iter().map(Into::into).collect();
        self
    }

    /// Override the channel namespace (default `/roomdrop`).
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Override the channel version (default 1).
    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// How long `start` waits for push and filter peers (default 15s).
    pub fn protocol_timeout(mut self, timeout: Duration) -> Self {
        self.protocol_timeout = timeout;
        self
    }

    /// Peer-count sampling interval (default 5s, at least
    /// [`MIN_PEER_POLL_INTERVAL`]).
    pub fn peer_poll_interval(mut self, interval: Duration) -> Self {
        self.peer_poll_interval = interval.max(MIN_PEER_POLL_INTERVAL);
        self
    }

    /// Buffer for decoded inbound records (default 256).
    pub fn inbound_buffer(mut self, capacity: usize) -> Self {
        self.inbound_buffer = capacity;
        self
    }

    /// Buffer for session events (default 64).
    pub fn event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity;
        self
    }

    pub fn bootstrap_endpoints(&self) -> &[String] {
        &self.bootstrap
    }

    pub fn channel_for(&self, room_id: &str) -> String {
        channel_name(&self.namespace, self.version, room_id)
    }
}

fn parse_endpoint_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

// ── Transfer ──────────────────────────────────────────────────────────

/// Configuration for a [`TransferCoordinator`](crate::TransferCoordinator).
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Bound on every storage upload/download call.
    pub storage_timeout: Duration,
    /// Buffer for transfer events.
    pub event_buffer: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            storage_timeout: Duration::from_secs(15),
            event_buffer: 256,
        }
    }
}

// ── Settings (owned by the application) ───────────────────────────────

/// How the application runs its peer node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeMode {
    /// Light client: roomdrop manages the session (dial, subscribe, reconnect).
    #[default]
    Light,
    /// A separately managed full node. The session stays idle.
    Full,
}

/// Threshold-encryption access condition parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionSpec {
    /// Chain the condition is evaluated on.
    pub chain: String,
    /// Value being tested, e.g. `balance`.
    pub method: String,
    /// Comparison operator, e.g. `>`.
    pub comparator: String,
    /// Right-hand side of the comparison.
    pub value: String,
}

impl ConditionSpec {
    pub fn new(
        chain: impl Into<String>,
        method: impl Into<String>,
        comparator: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            chain: chain.into(),
            method: method.into(),
            comparator: comparator.into(),
            value: value.into(),
        }
    }

    /// Human-readable form carried in `accessCondition`, e.g. `balance > 0`.
    pub fn description(&self) -> String {
        format!("{} {} {}", self.method, self.comparator, self.value)
    }
}

impl Default for ConditionSpec {
    fn default() -> Self {
        Self::new("ethereum", "balance", ">", "0")
    }
}

/// Encryption toggle plus the condition applied when it is on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionSettings {
    pub enabled: bool,
    #[serde(default)]
    pub condition: ConditionSpec,
}

impl EncryptionSettings {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn with_condition(condition: ConditionSpec) -> Self {
        Self {
            enabled: true,
            condition,
        }
    }
}

/// Settings read from the application's settings store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub room_id: String,
    #[serde(default)]
    pub node_mode: NodeMode,
    #[serde(default)]
    pub encryption: EncryptionSettings,
}

impl Settings {
    pub fn new(room_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            node_mode: NodeMode::Light,
            encryption: EncryptionSettings::disabled(),
        }
    }

    /// Reject settings roomdrop cannot act on.
    pub fn validate(&self) -> Result<(), crate::RoomdropError> {
        validate_room_id(&self.room_id).map(|_| ())
    }
}

/// Trim a room id and reject ids that would change the channel-name shape.
pub fn validate_room_id(room_id: &str) -> Result<&str, crate::RoomdropError> {
    let room = room_id.trim();
    if room.is_empty() {
        return Err(crate::RoomdropError::Config("room id is empty".into()));
    }
    if room.contains('/') {
        return Err(crate::RoomdropError::Config(format!(
            "room id {room:?} must not contain '/'"
        )));
    }
    Ok(room)
}
