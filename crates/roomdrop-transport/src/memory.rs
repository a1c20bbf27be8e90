//! In-process pub/sub network.
//!
//! A shared broker holds one `tokio::sync::broadcast` channel per channel
//! name. Every [`MemoryNode`] subscribed to a name receives every payload
//! published on it, including its own. Nodes only count as connected while
//! at least one endpoint they dialed is still reachable, so tests can take
//! bootstrap endpoints down and watch sessions reconnect.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::node::{NodeFactory, Protocol, PubSubNode, Subscription};
use crate::TransportError;

/// Capacity of each per-channel broadcast ring.
const CHANNEL_CAPACITY: usize = 256;

/// Capacity of the mpsc handed to a subscriber.
const SUBSCRIPTION_BUFFER: usize = 256;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug)]
struct Shared {
    channels: Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>,
    endpoints: Mutex<HashSet<String>>,
    subscribers: Mutex<HashMap<String, usize>>,
    protocols_ready: watch::Sender<bool>,
    fail_publish: AtomicBool,
    published: AtomicU64,
    nodes_created: AtomicUsize,
}

/// Shared broker connecting [`MemoryNode`] instances.
///
/// Cheap to clone; clones share the same network.
#[derive(Debug, Clone)]
pub struct MemoryNetwork {
    shared: Arc<Shared>,
}

impl MemoryNetwork {
    /// An empty network with no reachable endpoints and protocols available.
    pub fn new() -> Self {
        let (protocols_ready, _) = watch::channel(true);
        Self {
            shared: Arc::new(Shared {
                channels: Mutex::new(HashMap::new()),
                endpoints: Mutex::new(HashSet::new()),
                subscribers: Mutex::new(HashMap::new()),
                protocols_ready,
                fail_publish: AtomicBool::new(false),
                published: AtomicU64::new(0),
                nodes_created: AtomicUsize::new(0),
            }),
        }
    }

    /// A network where the given endpoints accept dials.
    pub fn with_endpoints<I, S>(endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let network = Self::new();
        for endpoint in endpoints {
            network.add_endpoint(endpoint);
        }
        network
    }

    /// Make an endpoint reachable.
    pub fn add_endpoint(&self, endpoint: impl Into<String>) {
        lock(&self.shared.endpoints).insert(endpoint.into());
    }

    /// Take an endpoint down. Nodes that only dialed it lose all peers.
    pub fn remove_endpoint(&self, endpoint: &str) {
        lock(&self.shared.endpoints).remove(endpoint);
    }

    /// Toggle whether push and filter service peers are available.
    pub fn set_protocols_ready(&self, ready: bool) {
        self.shared.protocols_ready.send_replace(ready);
    }

    /// Make every subsequent publish fail (or succeed again).
    pub fn set_fail_publish(&self, fail: bool) {
        self.shared.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Live subscriptions on a channel, across all nodes.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        lock(&self.shared.subscribers)
            .get(channel)
            .copied()
            .unwrap_or(0)
    }

    /// Total payloads accepted by the network.
    pub fn published_count(&self) -> u64 {
        self.shared.published.load(Ordering::SeqCst)
    }

    /// Nodes created through [`MemoryNodeFactory`].
    pub fn nodes_created(&self) -> usize {
        self.shared.nodes_created.load(Ordering::SeqCst)
    }

    /// Factory producing nodes attached to this network.
    pub fn factory(&self) -> MemoryNodeFactory {
        MemoryNodeFactory {
            network: self.clone(),
        }
    }

    /// A fresh node attached to this network.
    pub fn node(&self) -> MemoryNode {
        MemoryNode::new(self.clone())
    }

    fn is_reachable(&self, endpoint: &str) -> bool {
        lock(&self.shared.endpoints).contains(endpoint)
    }

    fn channel(&self, name: &str) -> broadcast::Sender<Vec<u8>> {
        lock(&self.shared.channels)
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    fn adjust_subscribers(&self, channel: &str, added: bool) {
        let mut subscribers = lock(&self.shared.subscribers);
        let count = subscribers.entry(channel.to_string()).or_insert(0);
        if added {
            *count += 1;
        } else {
            *count = count.saturating_sub(1);
        }
    }
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

/// A node attached to a [`MemoryNetwork`].
#[derive(Debug)]
pub struct MemoryNode {
    network: MemoryNetwork,
    dialed: Mutex<HashSet<String>>,
    subscriptions: Mutex<HashMap<String, CancellationToken>>,
    stopped: AtomicBool,
}

impl MemoryNode {
    pub fn new(network: MemoryNetwork) -> Self {
        Self {
            network,
            dialed: Mutex::new(HashSet::new()),
            subscriptions: Mutex::new(HashMap::new()),
            stopped: AtomicBool::new(false),
        }
    }

    fn ensure_running(&self) -> Result<(), TransportError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(TransportError::Stopped);
        }
        Ok(())
    }

    fn live_peers(&self) -> usize {
        lock(&self.dialed)
            .iter()
            .filter(|endpoint| self.network.is_reachable(endpoint))
            .count()
    }

    fn drop_subscription(&self, channel: &str) {
        if let Some(token) = lock(&self.subscriptions).remove(channel) {
            token.cancel();
            self.network.adjust_subscribers(channel, false);
        }
    }
}

#[async_trait::async_trait]
impl PubSubNode for MemoryNode {
    async fn dial(&self, endpoint: &str) -> Result<(), TransportError> {
        self.ensure_running()?;
        if !self.network.is_reachable(endpoint) {
            return Err(TransportError::Dial {
                endpoint: endpoint.to_string(),
                reason: "endpoint unreachable".into(),
            });
        }
        lock(&self.dialed).insert(endpoint.to_string());
        tracing::trace!(endpoint, "memory node dialed");
        Ok(())
    }

    async fn wait_for_protocols(&self, protocols: &[Protocol]) -> Result<(), TransportError> {
        self.ensure_running()?;
        if protocols.is_empty() {
            return Ok(());
        }
        let mut ready = self.network.shared.protocols_ready.subscribe();
        ready
            .wait_for(|available| *available)
            .await
            .map(|_| ())
            .map_err(|_| TransportError::ProtocolUnavailable("network shut down".into()))
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, TransportError> {
        self.ensure_running()?;
        self.drop_subscription(channel);

        let mut inbound = self.network.channel(channel).subscribe();
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let token = CancellationToken::new();

        lock(&self.subscriptions).insert(channel.to_string(), token.clone());
        self.network.adjust_subscribers(channel, true);

        let name = channel.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    result = inbound.recv() => {
                        match result {
                            Ok(payload) => {
                                if tx.send(payload).await.is_err() {
                                    break;
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                tracing::warn!(channel = %name, lagged = n, "memory subscription lagged");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), TransportError> {
        self.drop_subscription(channel);
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), TransportError> {
        self.ensure_running()?;
        if self.live_peers() == 0 {
            return Err(TransportError::Publish {
                channel: channel.to_string(),
                reason: "no connected peers".into(),
            });
        }
        if self.network.shared.fail_publish.load(Ordering::SeqCst) {
            return Err(TransportError::Publish {
                channel: channel.to_string(),
                reason: "rejected by service peer".into(),
            });
        }
        // No receivers is fine: delivery is best-effort.
        let _ = self.network.channel(channel).send(payload.to_vec());
        self.network.shared.published.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn peer_count(&self) -> usize {
        if self.stopped.load(Ordering::SeqCst) {
            return 0;
        }
        self.live_peers()
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let channels: Vec<String> = lock(&self.subscriptions).keys().cloned().collect();
        for channel in channels {
            self.drop_subscription(&channel);
        }
        lock(&self.dialed).clear();
    }
}

/// [`NodeFactory`] for [`MemoryNode`]s.
#[derive(Debug, Clone)]
pub struct MemoryNodeFactory {
    network: MemoryNetwork,
}

#[async_trait::async_trait]
impl NodeFactory for MemoryNodeFactory {
    async fn create(&self) -> Result<Arc<dyn PubSubNode>, TransportError> {
        self.network
            .shared
            .nodes_created
            .fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemoryNode::new(self.network.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const BOOT: &str = "/dns4/boot-1/tcp/443/wss";
    const CHANNEL: &str = "/roomdrop/1/room-test/proto";

    async fn connected_node(network: &MemoryNetwork) -> MemoryNode {
        let node = network.node();
        node.dial(BOOT).await.unwrap();
        node
    }

    #[tokio::test]
    async fn publish_reaches_every_subscriber_including_self() {
        let network = MemoryNetwork::with_endpoints([BOOT]);
        let alice = connected_node(&network).await;
        let bob = connected_node(&network).await;

        let mut alice_sub = alice.subscribe(CHANNEL).await.unwrap();
        let mut bob_sub = bob.subscribe(CHANNEL).await.unwrap();

        alice.publish(CHANNEL, b"announce").await.unwrap();

        assert_eq!(bob_sub.recv().await.unwrap(), b"announce".to_vec());
        assert_eq!(alice_sub.recv().await.unwrap(), b"announce".to_vec());
        assert_eq!(network.published_count(), 1);
    }

    #[tokio::test]
    async fn channels_are_isolated() {
        let network = MemoryNetwork::with_endpoints([BOOT]);
        let node = connected_node(&network).await;
        let mut other = node.subscribe("/roomdrop/1/room-other/proto").await.unwrap();

        node.publish(CHANNEL, b"x").await.unwrap();

        let res = tokio::time::timeout(Duration::from_millis(50), other.recv()).await;
        assert!(res.is_err(), "message leaked across channels");
    }

    #[tokio::test]
    async fn dial_unreachable_endpoint_fails() {
        let network = MemoryNetwork::new();
        let node = network.node();
        let err = node.dial(BOOT).await.unwrap_err();
        assert!(matches!(err, TransportError::Dial { .. }));
        assert_eq!(node.peer_count().await, 0);
    }

    #[tokio::test]
    async fn publish_without_peers_fails() {
        let network = MemoryNetwork::new();
        let node = network.node();
        let err = node.publish(CHANNEL, b"x").await.unwrap_err();
        assert!(matches!(err, TransportError::Publish { .. }));
    }

    #[tokio::test]
    async fn publish_failure_injection() {
        let network = MemoryNetwork::with_endpoints([BOOT]);
        let node = connected_node(&network).await;
        network.set_fail_publish(true);
        assert!(node.publish(CHANNEL, b"x").await.is_err());
        network.set_fail_publish(false);
        assert!(node.publish(CHANNEL, b"x").await.is_ok());
    }

    #[tokio::test]
    async fn removing_endpoint_drops_peer_count() {
        let network = MemoryNetwork::with_endpoints([BOOT]);
        let node = connected_node(&network).await;
        assert_eq!(node.peer_count().await, 1);

        network.remove_endpoint(BOOT);
        assert_eq!(node.peer_count().await, 0);

        network.add_endpoint(BOOT);
        assert_eq!(node.peer_count().await, 1);
    }

    #[tokio::test]
    async fn stop_releases_subscriptions() {
        let network = MemoryNetwork::with_endpoints([BOOT]);
        let node = connected_node(&network).await;
        let _sub = node.subscribe(CHANNEL).await.unwrap();
        assert_eq!(network.subscriber_count(CHANNEL), 1);

        node.stop().await;
        assert_eq!(network.subscriber_count(CHANNEL), 0);
        assert_eq!(node.peer_count().await, 0);
        assert_eq!(node.publish(CHANNEL, b"x").await, Err(TransportError::Stopped));
    }

    #[tokio::test]
    async fn resubscribe_replaces_previous_subscription() {
        let network = MemoryNetwork::with_endpoints([BOOT]);
        let node = connected_node(&network).await;
        let _first = node.subscribe(CHANNEL).await.unwrap();
        let _second = node.subscribe(CHANNEL).await.unwrap();
        assert_eq!(network.subscriber_count(CHANNEL), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_protocols_blocks_until_ready() {
        let network = MemoryNetwork::with_endpoints([BOOT]);
        network.set_protocols_ready(false);
        let node = connected_node(&network).await;

        let pending = tokio::time::timeout(
            Duration::from_secs(1),
            node.wait_for_protocols(&[Protocol::LightPush, Protocol::Filter]),
        )
        .await;
        assert!(pending.is_err());

        network.set_protocols_ready(true);
        node.wait_for_protocols(&[Protocol::LightPush, Protocol::Filter])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn factory_counts_nodes() {
        let network = MemoryNetwork::new();
        let factory = network.factory();
        let _a = factory.create().await.unwrap();
        let _b = factory.create().await.unwrap();
        assert_eq!(network.nodes_created(), 2);
    }
}
