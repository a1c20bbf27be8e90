/// RoomdropClient: wires identity, session and coordinator from settings.
///
/// Every collaborator is handed in through [`ClientParts`]; the client
/// keeps no process-wide state, so several clients (rooms) can run side
/// by side in one process.
use std::sync::{Arc, RwLock};

use roomdrop_transport::NodeFactory;

use crate::config::{EncryptionSettings, NodeMode, SessionConfig, Settings, TransferConfig};
use crate::coordinator::TransferCoordinator;
use crate::error::RoomdropError;
use crate::gateway::EncryptionGateway;
use crate::identity::{InstallationToken, SenderIdentity};
use crate::metrics::MetricsSnapshot;
use crate::session::{PeerSession, SessionChannels};
use crate::storage::StorageBackend;

/// Collaborators and tuning for a [`RoomdropClient`].
pub struct ClientParts {
    pub factory: Arc<dyn NodeFactory>,
    pub storage: Arc<dyn StorageBackend>,
    pub gateway: Arc<dyn EncryptionGateway>,
    pub installation: InstallationToken,
    pub session_config: SessionConfig,
    pub transfer_config: TransferConfig,
}

impl ClientParts {
    /// Parts with default session and transfer configuration.
    pub fn new(
        factory: Arc<dyn NodeFactory>,
        storage: Arc<dyn StorageBackend>,
        gateway: Arc<dyn EncryptionGateway>,
        installation: InstallationToken,
    ) -> Self {
        Self {
            factory,
            storage,
            gateway,
            installation,
            session_config: SessionConfig::default(),
            transfer_config: TransferConfig::default(),
        }
    }

    pub fn session_config(mut self, config: SessionConfig) -> Self {
        self.session_config = config;
        self
    }

    pub fn transfer_config(mut self, config: TransferConfig) -> Self {
        self.transfer_config = config;
        self
    }
}

/// One user's view of one room.
pub struct RoomdropClient {
    settings: RwLock<Settings>,
    session: PeerSession,
    coordinator: TransferCoordinator,
}

impl RoomdropClient {
    /// Build the client and, in [`NodeMode::Light`], join the configured room.
    ///
    /// Invalid settings are an error. A failed join is not: the client is
    /// returned with the session `disconnected` and the error in its status.
    pub async fn open(settings: Settings, parts: ClientParts) -> Result<Self, RoomdropError> {
        settings.validate()?;

        let SessionChannels { session, records } =
            PeerSession::new(parts.session_config, parts.factory);
        let coordinator = TransferCoordinator::spawn(
            parts.transfer_config,
            session.clone(),
            parts.storage,
            parts.gateway,
            SenderIdentity::new(parts.installation),
            records,
        );
        coordinator.set_encryption(settings.encryption.clone());

        let client = Self {
            settings: RwLock::new(settings),
            session,
            coordinator,
        };
        client.connect().await;
        Ok(client)
    }

    /// Join (or re-join) the configured room. No-op in full-node mode.
    pub async fn connect(&self) {
        let settings = self.settings();
        if settings.node_mode != NodeMode::Light {
            tracing::info!(room = %settings.room_id, "full node mode, session left idle");
            return;
        }
        if let Err(e) = self.session.start(&settings.room_id).await {
            tracing::warn!(room = %settings.room_id, "could not join room: {e}");
        }
    }

    /// Move to another room.
    pub async fn switch_room(&self, room_id: &str) -> Result<(), RoomdropError> {
        let mut next = self.settings();
        next.room_id = room_id.to_string();
        next.validate()?;

        let mode = next.node_mode;
        *self
            .settings
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = next;

        if mode == NodeMode::Light {
            self.session.switch_room(room_id).await?;
        }
        Ok(())
    }

    /// Change encryption for batches submitted from now on.
    pub fn set_encryption(&self, encryption: EncryptionSettings) {
        self.coordinator.set_encryption(encryption.clone());
        self.settings
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .encryption = encryption;
    }

    pub fn settings(&self) -> Settings {
        self.settings
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn session(&self) -> &PeerSession {
        &self.session
    }

    pub fn coordinator(&self) -> &TransferCoordinator {
        &self.coordinator
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        MetricsSnapshot::collect(self.session.metrics(), self.coordinator.metrics())
    }

    /// Leave the room and stop the node.
    pub async fn close(&self) {
        self.session.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{LocalConditionGateway, StaticOracle};
    use crate::session::ConnectionState;
    use crate::storage::MemoryStorage;
    use roomdrop_transport::MemoryNetwork;

    const BOOT: &str = "/dns4/boot/tcp/443/wss";

    fn parts(network: &MemoryNetwork) -> ClientParts {
        ClientParts::new(
            Arc::new(network.factory()),
            Arc::new(MemoryStorage::new()),
            Arc::new(LocalConditionGateway::new([3; 32], StaticOracle(true))),
            InstallationToken::generate(),
        )
        .session_config(SessionConfig::new().bootstrap([BOOT]))
    }

    #[tokio::test]
    async fn light_mode_joins_room() {
        let network = MemoryNetwork::with_endpoints([BOOT]);
        let client = RoomdropClient::open(Settings::new("lobby"), parts(&network))
            .await
            .unwrap();

        assert_eq!(client.session().status().state, ConnectionState::Connected);
        assert_eq!(client.metrics().peer_count, 1);
    }

    #[tokio::test]
    async fn full_mode_leaves_session_idle() {
        let network = MemoryNetwork::with_endpoints([BOOT]);
        let mut settings = Settings::new("lobby");
        settings.node_mode = NodeMode::Full;

        let client = RoomdropClient::open(settings, parts(&network)).await.unwrap();
        assert_eq!(client.session().status().state, ConnectionState::Disconnected);
        assert_eq!(network.nodes_created(), 0);
    }

    #[tokio::test]
    async fn failed_join_keeps_client_open() {
        let network = MemoryNetwork::new();
        let client = RoomdropClient::open(Settings::new("lobby"), parts(&network))
            .await
            .unwrap();

        let status = client.session().status();
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert!(status.last_error.is_some());
    }

    #[tokio::test]
    async fn invalid_settings_are_rejected() {
        let network = MemoryNetwork::with_endpoints([BOOT]);
        assert!(RoomdropClient::open(Settings::new(""), parts(&network))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn switch_room_updates_settings() {
        let network = MemoryNetwork::with_endpoints([BOOT]);
        let client = RoomdropClient::open(Settings::new("lobby"), parts(&network))
            .await
            .unwrap();

        client.switch_room("annex").await.unwrap();
        assert_eq!(client.settings().room_id, "annex");
        assert_eq!(network.subscriber_count("/roomdrop/1/room-lobby/proto"), 0);
        assert_eq!(network.subscriber_count("/roomdrop/1/room-annex/proto"), 1);
    }
}
