use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::TransportError;

/// Capabilities a node must reach on the network before a room is usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// Push a message to the network through a service peer.
    LightPush,
    /// Pull-subscription: a service peer forwards matching messages to us.
    Filter,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::LightPush => f.write_str("light-push"),
            Protocol::Filter => f.write_str("filter"),
        }
    }
}

/// Both capabilities are needed: one to announce, one to hear announcements.
pub const REQUIRED_PROTOCOLS: &[Protocol] = &[Protocol::LightPush, Protocol::Filter];

/// Inbound payloads for one channel subscription.
pub type Subscription = mpsc::Receiver<Vec<u8>>;

/// Abstraction over a publish/subscribe peer node.
///
/// In production: an adapter around the deployment's relay client.
/// In tests and the simulator: [`MemoryNode`](crate::MemoryNode).
#[async_trait::async_trait]
pub trait PubSubNode: Send + Sync {
    /// Dial one bootstrap endpoint.
    async fn dial(&self, endpoint: &str) -> Result<(), TransportError>;

    /// Resolve once every protocol in `protocols` has a serving peer.
    ///
    /// Does not time out on its own; callers bound it.
    async fn wait_for_protocols(&self, protocols: &[Protocol]) -> Result<(), TransportError>;

    /// Subscribe to a channel. Replaces an existing subscription to the same channel.
    async fn subscribe(&self, channel: &str) -> Result<Subscription, TransportError>;

    /// Drop the subscription to a channel, if any.
    async fn unsubscribe(&self, channel: &str) -> Result<(), TransportError>;

    /// Hand a message to the network. Success means the node accepted it.
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), TransportError>;

    /// Number of currently connected peers.
    async fn peer_count(&self) -> usize;

    /// Stop the node and drop all its subscriptions.
    async fn stop(&self);
}

/// Creates fresh nodes. A session builds a new node for every room it joins.
#[async_trait::async_trait]
pub trait NodeFactory: Send + Sync {
    async fn create(&self) -> Result<Arc<dyn PubSubNode>, TransportError>;
}
