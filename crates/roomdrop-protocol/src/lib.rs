//! roomdrop protocol layer: room file announcements over pub/sub.
//!
//! A sender stores a file in a content-addressed store (optionally sealed
//! under an access condition) and broadcasts a small announcement on the
//! room's channel. Peers in the same room list the announcement and fetch
//! the file on demand.
//!
//! Layers, leaves first:
//! - [`announcement`]: tagged MessagePack codec for [`AnnouncementRecord`]
//! - [`identity`]: sender ids and the self-filter
//! - [`session`]: one peer node per room, with reconnect
//! - [`coordinator`]: send/receive/download pipelines and item lists
//! - [`gateway`] / [`storage`]: collaborator contracts and reference adapters
//! - [`integrity`]: checks of fetched bytes against their identifier
//! - [`client`]: wiring from [`Settings`]

pub mod announcement;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod gateway;
pub mod identity;
pub mod integrity;
pub mod metrics;
pub mod session;
pub mod storage;
pub mod types;

pub use announcement::{AnnouncementRecord, WIRE_VERSION};
pub use client::{ClientParts, RoomdropClient};
pub use config::{
    channel_name, validate_room_id, ConditionSpec, EncryptionSettings, NodeMode, SessionConfig,
    Settings, TransferConfig, BOOTSTRAP_ENV, CHANNEL_NAMESPACE, CHANNEL_VERSION,
    DEFAULT_BOOTSTRAP, MIN_PEER_POLL_INTERVAL,
};
pub use coordinator::{
    BatchHandle, DownloadedFile, RawFile, SendOutcome, TransferCoordinator, TransferEvent,
    TransferItem, TransferStatus,
};
pub use error::RoomdropError;
pub use gateway::{
    ConditionOracle, DecryptContext, EncryptionGateway, GatewayError, LocalConditionGateway,
    StaticOracle,
};
pub use identity::{InstallationToken, SelfFilter, SenderIdentity};
pub use integrity::{matches_content_id, same_content, sha256_content_id};
pub use metrics::{MetricsSnapshot, SessionMetrics, TransferMetrics};
pub use session::{ConnectionState, PeerSession, SessionChannels, SessionEvent, SessionStatus};
pub use storage::{
    HttpStorage, MemoryStorage, ProgressSink, StorageBackend, StorageError, TimeoutStorage,
};
pub use types::ItemId;
